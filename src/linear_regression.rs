//! Bayesian linear regression with a half-normal noise scale.
//!
//! ```text
//! beta  ~ normal(0, 10)
//! sigma ~ normal(0, 10), sigma > 0
//! y     ~ normal(X * beta, sigma)
//! ```

use thiserror::Error;

use crate::{
    data::{DataError, Dataset},
    math::{axpy, vector_dot},
    model::{Constraint, LogpError, Model, ParamSpec},
};

const PRIOR_SCALE: f64 = 10.;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("log density is not finite")]
    NonFinite,
}

impl LogpError for RegressionError {
    fn is_recoverable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct LinearRegression {
    n: usize,
    d: usize,
    /// Row-major `n x d`
    x: Vec<f64>,
    y: Vec<f64>,
    params: Vec<ParamSpec>,
}

impl LinearRegression {
    pub fn new(d: usize, x: Vec<f64>, y: Vec<f64>) -> Result<Self, DataError> {
        let n = y.len();
        if x.len() != n * d {
            return Err(DataError::WrongShape {
                name: "X".to_string(),
                expected: vec![n, d],
                found: vec![x.len()],
            });
        }
        Ok(LinearRegression {
            n,
            d,
            x,
            y,
            params: vec![
                ParamSpec::array("beta", vec![d], Constraint::Unconstrained),
                ParamSpec::scalar("sigma", Constraint::LowerBound(0.)),
            ],
        })
    }

    /// Read `N`, `D`, `X` and `y` from a dataset.
    pub fn from_data(data: &Dataset) -> Result<Self, DataError> {
        let n = data.size("N")?;
        let d = data.size("D")?;
        let x = data.matrix("X", n, d)?.to_vec();
        let y = data.vector("y", n)?.to_vec();
        Self::new(d, x, y)
    }

    pub fn num_observations(&self) -> usize {
        self.n
    }

    pub fn num_predictors(&self) -> usize {
        self.d
    }
}

impl Model for LinearRegression {
    type LogpError = RegressionError;

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn logp(&self, position: &[f64], grad: &mut [f64]) -> Result<f64, RegressionError> {
        assert!(position.len() == self.d + 1);
        assert!(grad.len() == self.d + 1);

        let (beta, log_sigma) = position.split_at(self.d);
        let log_sigma = log_sigma[0];
        let sigma = log_sigma.exp();
        let inv_var = (-2. * log_sigma).exp();

        let (grad_beta, grad_sigma) = grad.split_at_mut(self.d);
        grad_beta.fill(0.);

        let mut sum_sq = 0.;
        if self.d > 0 {
            for (row, &y) in self.x.chunks_exact(self.d).zip(&self.y) {
                let resid = y - vector_dot(row, beta);
                sum_sq += resid * resid;
                axpy(row, grad_beta, resid * inv_var);
            }
        } else {
            sum_sq = self.y.iter().map(|y| y * y).sum();
        }

        let prior_var = PRIOR_SCALE * PRIOR_SCALE;
        let mut logp = -(self.n as f64) * log_sigma - 0.5 * sum_sq * inv_var;
        for (g, &b) in grad_beta.iter_mut().zip(beta) {
            logp -= 0.5 * b * b / prior_var;
            *g -= b / prior_var;
        }
        logp -= 0.5 * sigma * sigma / prior_var;
        // log Jacobian of sigma = exp(z)
        logp += log_sigma;

        grad_sigma[0] = -(self.n as f64) + sum_sq * inv_var - sigma * sigma / prior_var + 1.;

        if !logp.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            return Err(RegressionError::NonFinite);
        }
        Ok(logp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn small_model() -> LinearRegression {
        let x = vec![1., 0.5, -1., 2., 0.3, -0.7];
        let y = vec![1.2, -2.1, 0.4];
        LinearRegression::new(2, x, y).unwrap()
    }

    proptest! {
        #[test]
        fn gradient_matches_finite_differences(
            b0 in -3f64..3f64,
            b1 in -3f64..3f64,
            z in -2f64..2f64,
        ) {
            let model = small_model();
            let pos = [b0, b1, z];
            let mut grad = [0.; 3];
            let logp = model.logp(&pos, &mut grad).unwrap();
            prop_assert!(logp.is_finite());

            let h = 1e-6;
            let mut scratch = [0.; 3];
            for i in 0..3 {
                let mut up = pos;
                let mut down = pos;
                up[i] += h;
                down[i] -= h;
                let fd = (model.logp(&up, &mut scratch).unwrap()
                    - model.logp(&down, &mut scratch).unwrap())
                    / (2. * h);
                prop_assert!((fd - grad[i]).abs() < 1e-4 * (1. + fd.abs()));
            }
        }
    }

    #[test]
    fn density_value() {
        // One observation, no predictors: y = 1, sigma = 1.
        let model = LinearRegression::new(0, vec![], vec![1.]).unwrap();
        let mut grad = [0.];
        let logp = model.logp(&[0.], &mut grad).unwrap();
        assert_abs_diff_eq!(logp, -0.5 - 0.5 / 100., epsilon = 1e-12);
        assert_abs_diff_eq!(grad[0], -1. + 1. - 0.01 + 1., epsilon = 1e-12);
    }

    #[test]
    fn from_data() -> Result<(), DataError> {
        let data = Dataset::from_json_str(
            r#"{"N": 3, "D": 2, "X": [[1, 0.5], [-1, 2], [0.3, -0.7]], "y": [1.2, -2.1, 0.4]}"#,
        )?;
        let model = LinearRegression::from_data(&data)?;
        assert_eq!(model.dim(), 3);
        assert_eq!(model.num_observations(), 3);
        assert_eq!(model.param_names(), vec!["beta[1]", "beta[2]", "sigma"]);

        let wrong = Dataset::from_json_str(r#"{"N": 3, "D": 2, "X": [[1, 0.5]], "y": [1, 2, 3]}"#)?;
        assert!(matches!(
            LinearRegression::from_data(&wrong),
            Err(DataError::WrongShape { .. })
        ));
        Ok(())
    }

    #[test]
    fn overflow_is_recoverable() {
        let model = small_model();
        let mut grad = [0.; 3];
        let err = model.logp(&[0., 0., -400.], &mut grad).unwrap_err();
        assert!(err.is_recoverable());
    }
}
