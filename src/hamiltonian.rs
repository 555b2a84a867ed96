use std::sync::Arc;

use rand::distr::{Distribution, StandardUniform};

use crate::{
    mass_matrix::DiagMassMatrix,
    math::{axpy, axpy_out},
    model::{LogpError, Model},
    nuts::{Collector, NutsError, Result},
    state::State,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Details about a divergent leapfrog step.
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    /// The difference between the energy at the initial location of the
    /// trajectory and the energy at the end of the diverging leapfrog step.
    ///
    /// This is not available if the divergence was caused by a logp
    /// function error.
    pub energy_error: Option<f64>,
    /// The logp function error that caused the divergence, if any
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// Potential energy from the model's log density and Gaussian kinetic
/// energy with a diagonal mass matrix.
pub(crate) struct EuclideanHamiltonian<'model, M: Model> {
    model: &'model M,
    pub(crate) mass_matrix: DiagMassMatrix,
    pub(crate) step_size: f64,
    max_energy_error: f64,
}

impl<'model, M: Model> EuclideanHamiltonian<'model, M> {
    pub(crate) fn new(model: &'model M, step_size: f64, max_energy_error: f64) -> Self {
        EuclideanHamiltonian {
            model,
            mass_matrix: DiagMassMatrix::new(model.dim()),
            step_size,
            max_energy_error,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.model.dim()
    }

    fn update_potential_gradient(&self, state: &mut State) -> std::result::Result<(), M::LogpError> {
        let logp = self.model.logp(&state.q, &mut state.grad)?;
        state.potential_energy = -logp;
        Ok(())
    }

    /// Initialize a state at a new location.
    ///
    /// The momentum is left at zero, it is set in `randomize_momentum`
    /// before every trajectory.
    pub(crate) fn init_state(&self, init: &[f64]) -> Result<State> {
        let mut state = State::new(self.dim());
        state.q.copy_from_slice(init);
        self.update_potential_gradient(&mut state)
            .map_err(|e| NutsError::BadInitGrad(Box::new(e)))?;
        if !state.potential_energy.is_finite() || state.grad.iter().any(|g| !g.is_finite()) {
            return Err(NutsError::NonFiniteInit);
        }
        Ok(state)
    }

    pub(crate) fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        self.mass_matrix.randomize_momentum(state, rng);
        self.mass_matrix.update_velocity(state);
        self.mass_matrix.update_kinetic_energy(state);
    }

    /// Recompute velocity and kinetic energy after a change of the mass matrix.
    pub(crate) fn refresh_kinetic(&self, state: &mut State) {
        self.mass_matrix.update_velocity(state);
        self.mass_matrix.update_kinetic_energy(state);
    }

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    pub(crate) fn leapfrog<C: Collector>(
        &self,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<std::result::Result<State, DivergenceInfo>> {
        let (sign, idx_step) = match dir {
            Direction::Forward => (1., 1),
            Direction::Backward => (-1., -1),
        };
        let epsilon = sign * self.step_size;

        let mut out = start.clone();

        axpy_out(&start.grad, &start.p, epsilon / 2., &mut out.p);
        self.mass_matrix.update_velocity(&mut out);
        axpy_out(&out.v, &start.q, epsilon, &mut out.q);

        if let Err(logp_error) = self.update_potential_gradient(&mut out) {
            if !logp_error.is_recoverable() {
                return Err(NutsError::LogpFailure(Box::new(logp_error)));
            }
            let info = DivergenceInfo {
                energy_error: None,
                logp_function_error: Some(Arc::new(logp_error)),
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        axpy(&out.grad, &mut out.p, epsilon / 2.);
        out.idx_in_trajectory = start.idx_in_trajectory + idx_step;
        self.mass_matrix.update_velocity(&mut out);
        self.mass_matrix.update_kinetic_energy(&mut out);
        out.set_psum(start);

        let energy_error = out.energy() - initial_energy;
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let info = DivergenceInfo {
                energy_error: Some(energy_error),
                logp_function_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        collector.register_leapfrog(start, &out, None);
        Ok(Ok(out))
    }
}

#[cfg(test)]
pub(crate) mod test_logps {
    use thiserror::Error;

    use crate::model::{Constraint, LogpError, Model, ParamSpec};

    /// Independent normal distributions with a shared mean and per
    /// coordinate standard deviations.
    #[derive(Clone, Debug)]
    pub(crate) struct NormalLogp {
        mu: f64,
        sds: Vec<f64>,
        params: Vec<ParamSpec>,
    }

    impl NormalLogp {
        pub(crate) fn new(mu: f64, sds: Vec<f64>) -> NormalLogp {
            let params = vec![ParamSpec::array(
                "x",
                vec![sds.len()],
                Constraint::Unconstrained,
            )];
            NormalLogp { mu, sds, params }
        }
    }

    #[derive(Error, Debug)]
    pub(crate) enum NormalLogpError {
        #[error("position left the support")]
        OutOfBounds,
    }

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    impl Model for NormalLogp {
        type LogpError = NormalLogpError;

        fn params(&self) -> &[ParamSpec] {
            &self.params
        }

        fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            if position.iter().any(|x| x.abs() > 1e100) {
                return Err(NormalLogpError::OutOfBounds);
            }
            let mut logp = 0f64;
            for ((p, g), sd) in position.iter().zip(gradient.iter_mut()).zip(&self.sds) {
                let val = (p - self.mu) / sd;
                logp -= 0.5 * val * val;
                *g = -val / sd;
            }
            Ok(logp)
        }
    }
}
