use std::fmt::Debug;

use itertools::Itertools;

use crate::params::InitError;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// Support of a parameter and the bijection that maps it to the real line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    Unconstrained,
    /// `x = lower + exp(z)`
    LowerBound(f64),
    /// `x = lower + (upper - lower) * logistic(z)`
    Bounded { lower: f64, upper: f64 },
}

fn logistic(z: f64) -> f64 {
    if z >= 0. {
        1. / (1. + (-z).exp())
    } else {
        let e = z.exp();
        e / (1. + e)
    }
}

impl Constraint {
    /// Map an unconstrained value into the support.
    pub fn constrain(&self, z: f64) -> f64 {
        match *self {
            Constraint::Unconstrained => z,
            Constraint::LowerBound(lower) => lower + z.exp(),
            Constraint::Bounded { lower, upper } => lower + (upper - lower) * logistic(z),
        }
    }

    /// Map a value from the support to the real line.
    ///
    /// Returns `None` if the value is outside of the support.
    pub fn unconstrain(&self, x: f64) -> Option<f64> {
        if !x.is_finite() {
            return None;
        }
        match *self {
            Constraint::Unconstrained => Some(x),
            Constraint::LowerBound(lower) => {
                if x > lower {
                    Some((x - lower).ln())
                } else {
                    None
                }
            }
            Constraint::Bounded { lower, upper } => {
                if x > lower && x < upper {
                    let u = (x - lower) / (upper - lower);
                    Some(u.ln() - (-u).ln_1p())
                } else {
                    None
                }
            }
        }
    }

    /// `log |dx/dz|` of the transform.
    pub fn log_jacobian(&self, z: f64) -> f64 {
        match *self {
            Constraint::Unconstrained => 0.,
            Constraint::LowerBound(_) => z,
            Constraint::Bounded { lower, upper } => {
                let s = logistic(z);
                (upper - lower).ln() + s.ln() + (-s).ln_1p()
            }
        }
    }

    /// Derivative of [`Constraint::log_jacobian`] with respect to `z`.
    pub fn log_jacobian_grad(&self, z: f64) -> f64 {
        match *self {
            Constraint::Unconstrained => 0.,
            Constraint::LowerBound(_) => 1.,
            Constraint::Bounded { .. } => 1. - 2. * logistic(z),
        }
    }

    /// `dx/dz` of the transform.
    pub fn constrain_grad(&self, z: f64) -> f64 {
        match *self {
            Constraint::Unconstrained => 1.,
            Constraint::LowerBound(_) => z.exp(),
            Constraint::Bounded { lower, upper } => {
                let s = logistic(z);
                (upper - lower) * s * (1. - s)
            }
        }
    }
}

/// A declared parameter block entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    /// Empty for scalars
    pub shape: Vec<usize>,
    pub constraint: Constraint,
}

impl ParamSpec {
    pub fn scalar(name: impl Into<String>, constraint: Constraint) -> Self {
        ParamSpec {
            name: name.into(),
            shape: vec![],
            constraint,
        }
    }

    pub fn array(name: impl Into<String>, shape: Vec<usize>, constraint: Constraint) -> Self {
        ParamSpec {
            name: name.into(),
            shape,
            constraint,
        }
    }

    /// Number of scalar entries.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Names of the scalar entries in row-major order, indexed from one:
    /// `sigma`, `beta[1]`, `L[2,1]`.
    pub fn flat_names(&self) -> Vec<String> {
        if self.shape.is_empty() {
            return vec![self.name.clone()];
        }
        self.shape
            .iter()
            .map(|&len| 1..=len)
            .multi_cartesian_product()
            .map(|idx| format!("{}[{}]", self.name, idx.iter().join(",")))
            .collect()
    }
}

/// A log density over an unconstrained space.
///
/// The log density includes the log Jacobian of the constraint transforms,
/// so that it can be sampled directly in unconstrained space.
pub trait Model: Send + Sync {
    type LogpError: LogpError;

    /// The parameter block, in the order the parameters are laid out in the
    /// unconstrained position vector.
    fn params(&self) -> &[ParamSpec];

    /// Compute the log density at an unconstrained position and write its
    /// gradient into `grad`.
    fn logp(&self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError>;

    /// The dimension of the unconstrained space.
    fn dim(&self) -> usize {
        self.params().iter().map(|p| p.size()).sum()
    }

    fn param_names(&self) -> Vec<String> {
        self.params().iter().flat_map(|p| p.flat_names()).collect()
    }

    /// Map an unconstrained position into the parameter support.
    fn constrain(&self, position: &[f64], out: &mut [f64]) {
        assert!(position.len() == self.dim());
        assert!(out.len() == self.dim());
        let mut offset = 0;
        for param in self.params() {
            let end = offset + param.size();
            out[offset..end]
                .iter_mut()
                .zip(&position[offset..end])
                .for_each(|(x, &z)| *x = param.constraint.constrain(z));
            offset = end;
        }
    }

    /// Map flat constrained values to the unconstrained space.
    fn unconstrain(&self, values: &[f64], out: &mut [f64]) -> Result<(), InitError> {
        if values.len() != self.dim() {
            return Err(InitError::DimensionMismatch {
                expected: self.dim(),
                found: values.len(),
            });
        }
        assert!(out.len() == self.dim());
        let mut offset = 0;
        for param in self.params() {
            let names = param.flat_names();
            let end = offset + param.size();
            for (i, name) in (offset..end).zip(names) {
                out[i] = param.constraint.unconstrain(values[i]).ok_or_else(|| {
                    InitError::OutOfSupport {
                        name,
                        value: values[i],
                    }
                })?;
            }
            offset = end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const CONSTRAINTS: [Constraint; 3] = [
        Constraint::Unconstrained,
        Constraint::LowerBound(-1.5),
        Constraint::Bounded {
            lower: 2.,
            upper: 5.,
        },
    ];

    proptest! {
        #[test]
        fn transforms_invert(z in -8f64..8f64) {
            for constraint in CONSTRAINTS {
                let x = constraint.constrain(z);
                let back = constraint.unconstrain(x);
                prop_assert!(back.is_some());
                prop_assert!((back.unwrap_or(f64::NAN) - z).abs() < 1e-6);
            }
        }

        #[test]
        fn jacobian_matches_finite_differences(z in -5f64..5f64) {
            let h = 1e-5;
            for constraint in CONSTRAINTS {
                let dx = (constraint.constrain(z + h) - constraint.constrain(z - h)) / (2. * h);
                prop_assert!((dx - constraint.constrain_grad(z)).abs() < 1e-5 * (1. + dx.abs()));
                prop_assert!((dx.abs().ln() - constraint.log_jacobian(z)).abs() < 1e-5);

                let dj = (constraint.log_jacobian(z + h) - constraint.log_jacobian(z - h)) / (2. * h);
                prop_assert!((dj - constraint.log_jacobian_grad(z)).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn outside_support() {
        assert_eq!(Constraint::LowerBound(0.).unconstrain(-0.3), None);
        assert_eq!(Constraint::LowerBound(0.).unconstrain(0.), None);
        assert_eq!(
            Constraint::Bounded {
                lower: 0.,
                upper: 1.
            }
            .unconstrain(1.),
            None
        );
        assert_eq!(Constraint::Unconstrained.unconstrain(f64::NAN), None);
        assert_abs_diff_eq!(
            Constraint::LowerBound(0.).unconstrain(1.).unwrap_or(f64::NAN),
            0.
        );
    }

    #[test]
    fn flat_names() {
        let beta = ParamSpec::array("beta", vec![3], Constraint::Unconstrained);
        assert_eq!(beta.flat_names(), vec!["beta[1]", "beta[2]", "beta[3]"]);

        let l = ParamSpec::array("L", vec![2, 2], Constraint::Unconstrained);
        assert_eq!(l.flat_names(), vec!["L[1,1]", "L[1,2]", "L[2,1]", "L[2,2]"]);

        let sigma = ParamSpec::scalar("sigma", Constraint::LowerBound(0.));
        assert_eq!(sigma.flat_names(), vec!["sigma"]);
        assert_eq!(sigma.size(), 1);

        let empty = ParamSpec::array("e", vec![0], Constraint::Unconstrained);
        assert!(empty.flat_names().is_empty());
    }
}
