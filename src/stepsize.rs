use crate::{
    hamiltonian::{DivergenceInfo, Direction, EuclideanHamiltonian},
    model::Model,
    nuts::{Collector, NutsError, NutsOptions, Result},
    state::State,
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Tracks the mean Metropolis acceptance probability over all leapfrog
/// steps of a trajectory. Divergent steps count as rejections.
#[derive(Debug, Clone)]
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => self
                .mean
                .add(end.log_acceptance_probability(self.initial_energy).exp()),
        };
    }

    fn register_init(&mut self, state: &State, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}

struct NullCollector;

impl Collector for NullCollector {}

const STEP_SIZE_LIMIT: f64 = 1e7;

/// Double or halve the step size until the acceptance probability of a
/// single leapfrog step from `state` crosses 0.8.
pub(crate) fn find_reasonable_step_size<M: Model, R: rand::Rng + ?Sized>(
    hamiltonian: &mut EuclideanHamiltonian<'_, M>,
    state: &State,
    rng: &mut R,
) -> Result<()> {
    let step_size = hamiltonian.step_size;
    if step_size == 0. || step_size > STEP_SIZE_LIMIT || !step_size.is_finite() {
        return Ok(());
    }
    let threshold = 0.8f64.ln();

    let mut energy_change = |hamiltonian: &EuclideanHamiltonian<'_, M>| -> Result<f64> {
        let mut init = state.clone();
        hamiltonian.randomize_momentum(&mut init, rng);
        init.make_init_point();
        let initial_energy = init.energy();
        let end = hamiltonian.leapfrog(
            &init,
            Direction::Forward,
            initial_energy,
            &mut NullCollector,
        )?;
        Ok(match end {
            Ok(end) if end.energy().is_finite() => initial_energy - end.energy(),
            _ => f64::NEG_INFINITY,
        })
    };

    let increase = energy_change(hamiltonian)? > threshold;
    loop {
        let delta = energy_change(hamiltonian)?;
        if increase && !(delta > threshold) {
            break;
        }
        if !increase && !(delta < threshold) {
            break;
        }
        hamiltonian.step_size = if increase {
            2. * hamiltonian.step_size
        } else {
            0.5 * hamiltonian.step_size
        };
        if hamiltonian.step_size > STEP_SIZE_LIMIT {
            return Err(NutsError::ImproperPosterior);
        }
        if hamiltonian.step_size == 0. {
            return Err(NutsError::NoStepSize);
        }
    }
    Ok(())
}
