use std::time::{Duration, Instant};

use rand::{distr::Uniform, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::{
    adapt_strategy::WindowSettings,
    chain::NutsChain,
    model::Model,
    nuts::NutsError,
    params::{InitError, ParamMap},
    stepsize::DualAverageOptions,
    trace::{ChainTrace, Trace},
};

/// Random initialization gives up after this many non-finite log densities.
pub const MAX_INIT_TRIES: usize = 100;

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleSettings {
    pub num_chains: usize,
    /// The number of warmup draws, where we fit the step size and mass matrix.
    pub num_warmup: u64,
    /// The number of draws after warmup
    pub num_draws: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ max_depth.
    pub max_depth: u64,
    /// Target acceptance statistic for step size adaptation
    pub target_accept: f64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    /// Random inits are drawn uniformly from `(-init_radius, init_radius)`
    /// in unconstrained space.
    pub init_radius: f64,
    /// Keep warmup draws in the trace
    pub save_warmup: bool,
    pub seed: u64,
    /// Starting point of the initial step size search
    pub initial_step_size: f64,
    pub windows: WindowSettings,
    pub step_size_adapt: DualAverageOptions,
}

impl Default for SampleSettings {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_warmup: 1000,
            num_draws: 1000,
            max_depth: 10,
            target_accept: 0.8,
            max_energy_error: 1000f64,
            init_radius: 2.,
            save_warmup: false,
            seed: 0,
            initial_step_size: 1.,
            windows: WindowSettings::default(),
            step_size_adapt: DualAverageOptions::default(),
        }
    }
}

impl SampleSettings {
    fn validate(&self) -> Result<(), SampleError> {
        if self.num_chains == 0 {
            return Err(SampleError::Settings("num_chains must be positive"));
        }
        if self.max_depth == 0 {
            return Err(SampleError::Settings("max_depth must be positive"));
        }
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return Err(SampleError::Settings("target_accept must be in (0, 1)"));
        }
        if !(self.init_radius > 0. && self.init_radius.is_finite()) {
            return Err(SampleError::Settings("init_radius must be positive"));
        }
        if !(self.initial_step_size > 0. && self.initial_step_size.is_finite()) {
            return Err(SampleError::Settings("initial_step_size must be positive"));
        }
        // A variance estimate needs two draws per slow window.
        if self.windows.base_window < 2 {
            return Err(SampleError::Settings("windows.base_window must be at least 2"));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("initial values do not match the parameter block")]
    MissingInit(#[source] InitError),
    #[error("initial values are invalid")]
    InvalidInit(#[source] InitError),
    #[error("log density at the initial values can not be evaluated")]
    NonFiniteInit(#[source] NutsError),
    #[error("chain {chain}: no finite log density after {attempts} random initializations")]
    InitFailed { chain: usize, attempts: usize },
    #[error("chain {chain} failed")]
    Chain {
        chain: usize,
        #[source]
        source: NutsError,
    },
    #[error("invalid sampler settings: {0}")]
    Settings(&'static str),
}

impl From<InitError> for SampleError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::OutOfSupport { .. } => SampleError::InvalidInit(err),
            _ => SampleError::MissingInit(err),
        }
    }
}

/// Turn explicit constrained inits into one unconstrained position.
fn unconstrained_init<M: Model>(model: &M, inits: &ParamMap) -> Result<Box<[f64]>, SampleError> {
    let flat = inits.to_flat(model.params())?;
    let mut position = vec![0f64; model.dim()];
    model.unconstrain(&flat, &mut position)?;
    Ok(position.into())
}

fn random_init<M: Model, R: Rng + ?Sized>(
    model: &M,
    chain: usize,
    radius: f64,
    rng: &mut R,
) -> Result<Box<[f64]>, SampleError> {
    let dist = Uniform::new(-radius, radius)
        .map_err(|_| SampleError::Settings("init_radius must be positive"))?;
    let mut position = vec![0f64; model.dim()];
    let mut grad = vec![0f64; model.dim()];
    for attempt in 0..MAX_INIT_TRIES {
        position.iter_mut().for_each(|x| *x = rng.sample(dist));
        match model.logp(&position, &mut grad) {
            Ok(logp) if logp.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                return Ok(position.into());
            }
            _ => tracing::debug!(chain, attempt, "rejected random initial point"),
        }
    }
    Err(SampleError::InitFailed {
        chain,
        attempts: MAX_INIT_TRIES,
    })
}

/// Run a single chain to completion.
///
/// `init` is an unconstrained starting point; without one the chain draws
/// a random starting point. The chain's random stream is determined by
/// `settings.seed` and `chain` alone.
pub fn sample_chain<M: Model>(
    model: &M,
    chain: usize,
    init: Option<&[f64]>,
    settings: &SampleSettings,
) -> Result<ChainTrace, SampleError> {
    settings.validate()?;
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain as u64);

    let (position, explicit) = match init {
        Some(init) => (init.into(), true),
        None => (random_init(model, chain, settings.init_radius, &mut rng)?, false),
    };

    let mut sampler = NutsChain::new(model, settings, chain as u64, rng);
    sampler.set_position(&position).map_err(|err| match err {
        NutsError::BadInitGrad(_) | NutsError::NonFiniteInit if explicit => {
            SampleError::NonFiniteInit(err)
        }
        source => SampleError::Chain { chain, source },
    })?;
    tracing::debug!(chain, step_size = sampler.step_size(), "chain initialized");

    let keep = (settings.num_draws + if settings.save_warmup { settings.num_warmup } else { 0 })
        as usize;
    let mut draws = Vec::with_capacity(keep);
    let mut stats = Vec::with_capacity(keep);
    let mut warmup_time = Duration::ZERO;
    let start = Instant::now();

    for i in 0..(settings.num_warmup + settings.num_draws) {
        if i == settings.num_warmup {
            warmup_time = start.elapsed();
        }
        let (unconstrained, stat) = sampler
            .draw()
            .map_err(|source| SampleError::Chain { chain, source })?;
        if stat.warmup && !settings.save_warmup {
            continue;
        }
        let mut constrained = vec![0f64; model.dim()];
        model.constrain(&unconstrained, &mut constrained);
        draws.push(constrained.into_boxed_slice());
        stats.push(stat);
    }
    if settings.num_draws == 0 {
        warmup_time = start.elapsed();
    }
    let sampling_time = start.elapsed().saturating_sub(warmup_time);

    let trace = ChainTrace {
        chain: chain as u64,
        num_warmup_saved: if settings.save_warmup {
            settings.num_warmup as usize
        } else {
            0
        },
        draws,
        stats,
        warmup_time,
        sampling_time,
        step_size: sampler.step_size(),
        inv_metric: sampler.inv_metric().into(),
    };
    tracing::info!(
        chain,
        divergences = trace.divergences(),
        step_size = trace.step_size,
        warmup_secs = warmup_time.as_secs_f64(),
        sampling_secs = sampling_time.as_secs_f64(),
        "chain finished"
    );
    Ok(trace)
}

/// Sample `settings.num_chains` chains in parallel.
///
/// With `inits` every chain starts at the same point, otherwise each chain
/// draws its own random starting point. Chains are returned in order of
/// their id, independent of thread scheduling.
pub fn sample<M: Model>(
    model: &M,
    inits: Option<&ParamMap>,
    settings: SampleSettings,
) -> Result<Trace, SampleError> {
    settings.validate()?;
    let init = inits.map(|inits| unconstrained_init(model, inits)).transpose()?;

    tracing::info!(
        num_chains = settings.num_chains,
        num_warmup = settings.num_warmup,
        num_draws = settings.num_draws,
        explicit_inits = init.is_some(),
        "sampling"
    );

    let chains = (0..settings.num_chains)
        .into_par_iter()
        .map(|chain| sample_chain(model, chain, init.as_deref(), &settings))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Trace {
        param_names: model.param_names(),
        chains,
        num_warmup: settings.num_warmup,
        num_draws: settings.num_draws,
        max_depth: settings.max_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hamiltonian::test_logps::NormalLogp,
        model::{Constraint, LogpError, ParamSpec},
        params::ParamValue,
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn settings() -> SampleSettings {
        SampleSettings {
            num_warmup: 100,
            num_draws: 100,
            num_chains: 3,
            seed: 10,
            ..Default::default()
        }
    }

    #[test]
    fn sample_chain_layout() -> Result<()> {
        let model = NormalLogp::new(0.1, vec![1.; 10]);
        let settings = SampleSettings {
            save_warmup: true,
            ..settings()
        };
        let chain = sample_chain(&model, 1, None, &settings)?;
        assert_eq!(chain.chain, 1);
        assert_eq!(chain.draws.len(), 200);
        assert_eq!(chain.num_warmup_saved, 100);
        assert_eq!(chain.sampling_draws().len(), 100);
        assert!(chain.stats[99].warmup);
        assert!(!chain.stats[100].warmup);
        assert_eq!(chain.draws[150].len(), 10);
        Ok(())
    }

    #[test]
    fn sample_parallel_is_deterministic() -> Result<()> {
        let model = NormalLogp::new(0.1, vec![1.; 5]);
        let first = sample(&model, None, settings())?;
        let second = sample(&model, None, settings())?;
        assert_eq!(first.num_chains(), 3);
        for (a, b) in first.chains.iter().zip(&second.chains) {
            assert_eq!(a.draws, b.draws);
            assert_eq!(a.stats.len(), b.stats.len());
        }
        // Different streams per chain
        assert!(first.chains[0].draws[0] != first.chains[1].draws[0]);
        Ok(())
    }

    #[test]
    fn explicit_inits_are_shared() -> Result<()> {
        let model = NormalLogp::new(0.1, vec![1.; 2]);
        let mut inits = ParamMap::new();
        inits.insert("x", ParamValue::vector(vec![0.3, -0.2]));
        let settings = SampleSettings {
            num_warmup: 0,
            num_draws: 1,
            max_depth: 1,
            ..settings()
        };
        let trace = sample(&model, Some(&inits), settings)?;
        assert_eq!(trace.param_names, vec!["x[1]", "x[2]"]);
        assert_eq!(trace.num_transitions(), 3);
        Ok(())
    }

    #[test]
    fn bad_inits() {
        let model = NormalLogp::new(0.1, vec![1.; 2]);
        let mut inits = ParamMap::new();
        inits.insert("y", ParamValue::vector(vec![0.3, -0.2]));
        assert!(matches!(
            sample(&model, Some(&inits), settings()),
            Err(SampleError::MissingInit(InitError::Missing(_)))
        ));

        inits.insert("x", ParamValue::vector(vec![0.3]));
        assert!(matches!(
            sample(&model, Some(&inits), settings()),
            Err(SampleError::MissingInit(InitError::WrongShape { .. }))
        ));

        inits.insert("x", ParamValue::vector(vec![1e200, 0.]));
        assert!(matches!(
            sample(&model, Some(&inits), settings()),
            Err(SampleError::NonFiniteInit(_))
        ));
    }

    #[derive(Debug, thiserror::Error)]
    #[error("never finite")]
    struct NeverFinite;

    impl LogpError for NeverFinite {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    struct Broken(Vec<ParamSpec>);

    impl Model for Broken {
        type LogpError = NeverFinite;

        fn params(&self) -> &[ParamSpec] {
            &self.0
        }

        fn logp(&self, _position: &[f64], _grad: &mut [f64]) -> Result<f64, NeverFinite> {
            Err(NeverFinite)
        }
    }

    #[test]
    fn random_init_gives_up() {
        let model = Broken(vec![ParamSpec::scalar(
            "sigma",
            Constraint::LowerBound(0.),
        )]);
        assert!(matches!(
            sample(&model, None, settings()),
            Err(SampleError::InitFailed {
                attempts: MAX_INIT_TRIES,
                ..
            })
        ));

        let mut inits = ParamMap::new();
        inits.insert("sigma", ParamValue::scalar(-1.));
        assert!(matches!(
            sample(&model, Some(&inits), settings()),
            Err(SampleError::InvalidInit(InitError::OutOfSupport { .. }))
        ));
    }

    #[test]
    fn invalid_settings() {
        let model = NormalLogp::new(0.1, vec![1.; 2]);
        let settings = SampleSettings {
            num_chains: 0,
            ..settings()
        };
        assert!(matches!(
            sample(&model, None, settings),
            Err(SampleError::Settings(_))
        ));
    }

    #[test]
    fn slow_windows_need_two_draws() -> Result<()> {
        let model = NormalLogp::new(0.1, vec![1.; 3]);
        let settings = |init_buffer, base_window| SampleSettings {
            num_warmup: 200,
            num_chains: 1,
            windows: WindowSettings {
                init_buffer,
                term_buffer: 50,
                base_window,
            },
            ..settings()
        };
        for (init_buffer, base_window) in [(75, 1), (0, 0)] {
            let result = sample(&model, None, settings(init_buffer, base_window));
            assert!(
                matches!(result, Err(SampleError::Settings(_))),
                "{init_buffer}, {base_window}"
            );
            assert!(matches!(
                sample_chain(&model, 0, None, &settings(init_buffer, base_window)),
                Err(SampleError::Settings(_))
            ));
        }

        let trace = sample(&model, None, settings(0, 2))?;
        assert!(trace.chains[0].inv_metric.iter().all(|v| v.is_finite() && *v > 0.));
        Ok(())
    }
}
