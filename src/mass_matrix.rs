use itertools::izip;

use crate::{
    math::{multiply, vector_dot},
    state::State,
};

/// A diagonal mass matrix, stored as the inverse metric (the variance of
/// the position) and the inverse standard deviations used to draw momenta.
#[derive(Debug, Clone)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    /// The unit metric.
    pub(crate) fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        update_diag(&mut self.variance, &mut self.inv_stds, new_variance);
    }

    pub(crate) fn update_velocity(&self, state: &mut State) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    pub(crate) fn update_kinetic_energy(&self, state: &mut State) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    pub(crate) fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let dist = rand_distr::StandardNormal;
        state
            .p
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(dist);
                *p = s * norm;
            });
    }
}

fn update_diag(
    variance_out: &mut [f64],
    inv_std_out: &mut [f64],
    new_variance: impl Iterator<Item = f64>,
) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, x)| {
        assert!(x.is_finite(), "Illegal value on mass matrix: {}", x);
        assert!(x > 0f64, "Illegal value on mass matrix: {}", x);
        *var = x;
        *inv_std = (1. / x).sqrt();
    });
}

/// Welford's online estimator of the per-coordinate variance.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        RunningVariance {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        assert!(value.len() == self.mean.len());
        self.count += 1;
        let n = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.m2.iter_mut()).for_each(|(&x, mean, m2)| {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        });
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn restart(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }

    /// The sample variance shrunk towards `1e-3` with a weight of five
    /// pseudo-observations.
    ///
    /// Needs at least two samples.
    pub(crate) fn regularized_variance(&self) -> impl Iterator<Item = f64> + '_ {
        let n = self.count as f64;
        self.m2.iter().map(move |&m2| {
            let var = m2 / (n - 1.);
            (n / (n + 5.)) * var + 1e-3 * (5. / (n + 5.))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn welford_matches_two_pass() {
        let draws = [[1., 10.], [2., 14.], [4., 9.], [7., 11.]];
        let mut est = RunningVariance::new(2);
        draws.iter().for_each(|d| est.add_sample(d));
        assert_eq!(est.count(), 4);

        let col0: Vec<f64> = draws.iter().map(|d| d[0]).collect();
        let col1: Vec<f64> = draws.iter().map(|d| d[1]).collect();
        let expected = [
            crate::math::sample_variance(&col0),
            crate::math::sample_variance(&col1),
        ];

        let reg: Vec<f64> = est.regularized_variance().collect();
        for (r, v) in reg.iter().zip(expected) {
            assert_relative_eq!(*r, (4. / 9.) * v + 1e-3 * (5. / 9.), max_relative = 1e-12);
        }

        est.restart();
        assert_eq!(est.count(), 0);
    }

    #[test]
    fn kinetic_energy() {
        let mut mass = DiagMassMatrix::new(2);
        mass.update_diag([4., 0.25].into_iter());
        let mut state = State::new(2);
        state.p.copy_from_slice(&[1., 2.]);
        mass.update_velocity(&mut state);
        mass.update_kinetic_energy(&mut state);
        assert_eq!(&*state.v, &[4., 0.5]);
        assert_relative_eq!(state.kinetic_energy, 0.5 * (4. + 1.));
    }

    #[test]
    fn momentum_scale() {
        let mut mass = DiagMassMatrix::new(1);
        mass.update_diag([0.01].into_iter());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut state = State::new(1);
        let draws: Vec<f64> = (0..4000)
            .map(|_| {
                mass.randomize_momentum(&mut state, &mut rng);
                state.p[0]
            })
            .collect();
        // Momentum variance is the inverse of the position variance.
        let var = crate::math::sample_variance(&draws);
        assert!((var - 100.).abs() < 10., "{var}");
    }
}
