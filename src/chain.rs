use crate::{
    adapt_strategy::WindowedAdaptation,
    hamiltonian::EuclideanHamiltonian,
    model::Model,
    nuts::{draw, NutsOptions, Result},
    sampler::SampleSettings,
    state::State,
    stepsize::AcceptanceRateCollector,
    trace::DrawStats,
};

/// A single NUTS chain with its warmup adaptation.
pub(crate) struct NutsChain<'model, M: Model, R: rand::Rng> {
    hamiltonian: EuclideanHamiltonian<'model, M>,
    collector: AcceptanceRateCollector,
    options: NutsOptions,
    rng: R,
    state: State,
    chain: u64,
    draw_count: u64,
    num_warmup: u64,
    strategy: WindowedAdaptation,
}

impl<'model, M: Model, R: rand::Rng> NutsChain<'model, M, R> {
    pub(crate) fn new(model: &'model M, settings: &SampleSettings, chain: u64, rng: R) -> Self {
        let hamiltonian =
            EuclideanHamiltonian::new(model, settings.initial_step_size, settings.max_energy_error);
        let strategy = WindowedAdaptation::new(
            settings.windows,
            settings.step_size_adapt,
            settings.target_accept,
            settings.num_warmup,
            model.dim(),
        );
        NutsChain {
            state: State::new(model.dim()),
            hamiltonian,
            collector: AcceptanceRateCollector::new(),
            options: NutsOptions {
                maxdepth: settings.max_depth,
            },
            rng,
            chain,
            draw_count: 0,
            num_warmup: settings.num_warmup,
            strategy,
        }
    }

    /// Move the chain to an unconstrained position and pick an initial
    /// step size there. Must be called before the first draw.
    pub(crate) fn set_position(&mut self, position: &[f64]) -> Result<()> {
        self.state = self.hamiltonian.init_state(position)?;
        self.strategy
            .init(&mut self.hamiltonian, &self.state, &mut self.rng)
    }

    /// Run one NUTS transition. Returns the unconstrained position and
    /// the draw statistics.
    pub(crate) fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats)> {
        let step_size = self.hamiltonian.step_size;
        let (state, info) = draw(
            &mut self.state,
            &mut self.rng,
            &self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;

        if let Some(div) = &info.divergence_info {
            tracing::trace!(
                chain = self.chain,
                draw = self.draw_count,
                energy_error = ?div.energy_error,
                logp_error = ?div.logp_function_error.as_ref().map(|e| e.to_string()),
                "divergent transition"
            );
        }

        let stats = DrawStats {
            lp: state.logp(),
            accept_stat: self.collector.mean.current(),
            step_size,
            tree_depth: info.depth,
            n_leapfrog: self.collector.mean.count(),
            divergent: info.divergence_info.is_some(),
            energy: state.energy(),
            maxdepth_reached: info.reached_maxdepth,
            warmup: self.draw_count < self.num_warmup,
        };

        self.strategy.adapt(
            &mut self.hamiltonian,
            &state,
            self.draw_count,
            &self.collector,
            &mut self.rng,
        )?;
        let position = state.q.clone();
        self.state = state;
        self.draw_count += 1;
        Ok((position, stats))
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.hamiltonian.step_size
    }

    pub(crate) fn inv_metric(&self) -> &[f64] {
        &self.hamiltonian.mass_matrix.variance
    }
}
