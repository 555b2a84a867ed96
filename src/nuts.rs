use thiserror::Error;

use crate::{
    hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian},
    math::logaddexp,
    model::Model,
    state::State,
};

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not evaluate logp at the initial point")]
    BadInitGrad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Logp or its gradient is not finite at the initial point")]
    NonFiniteInit,

    #[error("Step size search exceeded 1e7, the posterior may be improper")]
    ImproperPosterior,

    #[error("Step size search reached zero, no acceptably small step size exists")]
    NoStepSize,
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Callbacks for various events during a Nuts sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate.
pub(crate) trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State, _options: &NutsOptions) {}
}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub(crate) struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State,
    right: State,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State,
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(NutsError),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        let initial_energy = state.energy();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    fn extend<M, R, C>(
        mut self,
        rng: &mut R,
        hamiltonian: &EuclideanHamiltonian<'_, M>,
        direction: Direction,
        collector: &mut C,
    ) -> ExtendResult
    where
        M: Model,
        R: rand::Rng + ?Sized,
        C: Collector,
    {
        let mut other = match self.single_step(hamiltonian, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(rng, hamiltonian, direction, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        // Besides the full tree, check the two spans that straddle the
        // seam between the old tree and the new subtree.
        let mut turning = first.is_turning(last);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right);
            }
            if !turning {
                turning = self.left.is_turning(&other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    fn merge_into<R: rand::Rng + ?Sized>(&mut self, other: NutsTree, rng: &mut R, direction: Direction) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        // The main tree prefers draws from the new subtree (biased
        // progressive sampling), subtrees sample uniformly.
        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || rng.random_bool((other.log_size - self_log_size).exp().clamp(0., 1.))
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    fn single_step<M: Model, C: Collector>(
        &self,
        hamiltonian: &EuclideanHamiltonian<'_, M>,
        direction: Direction,
        collector: &mut C,
    ) -> Result<std::result::Result<NutsTree, DivergenceInfo>> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(start, direction, self.initial_energy, collector) {
            Ok(Ok(end)) => end,
            Ok(Err(info)) => return Ok(Err(info)),
            Err(error) => return Err(error),
        };

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NutsOptions {
    pub maxdepth: u64,
}

/// Draw the next state of the chain from a trajectory starting at `init`.
pub(crate) fn draw<M, R, C>(
    init: &mut State,
    rng: &mut R,
    hamiltonian: &EuclideanHamiltonian<'_, M>,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo)>
where
    M: Model,
    R: rand::Rng + ?Sized,
    C: Collector,
{
    hamiltonian.randomize_momentum(init, rng);
    init.make_init_point();
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(rng, hamiltonian, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hamiltonian::test_logps::NormalLogp, stepsize::AcceptanceRateCollector};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn draw_from_unit_normal() {
        let model = NormalLogp::new(0., vec![1.; 10]);
        let hamiltonian = EuclideanHamiltonian::new(&model, 0.1, 1000.);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut collector = AcceptanceRateCollector::new();
        let options = NutsOptions { maxdepth: 10 };

        let mut init = hamiltonian.init_state(&[0.5; 10]).unwrap();
        let (state, info) = draw(&mut init, &mut rng, &hamiltonian, &options, &mut collector).unwrap();
        assert!(info.divergence_info.is_none());
        assert!(info.depth > 0);
        assert_eq!(state.dim(), 10);
        // Step size 0.1 on a unit normal: nearly every step is accepted.
        assert!(collector.mean.current() > 0.9);
        assert!(collector.mean.count() >= (1 << info.depth) - 1);
    }

    #[test]
    fn maxdepth_limits_trajectory() {
        let model = NormalLogp::new(0., vec![1.; 3]);
        let hamiltonian = EuclideanHamiltonian::new(&model, 1e-4, 1000.);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut collector = AcceptanceRateCollector::new();
        let options = NutsOptions { maxdepth: 3 };

        let mut init = hamiltonian.init_state(&[1., 2., 3.]).unwrap();
        let (_, info) = draw(&mut init, &mut rng, &hamiltonian, &options, &mut collector).unwrap();
        assert!(info.reached_maxdepth);
        assert_eq!(info.depth, 3);
        assert_eq!(collector.mean.count(), 7);
    }

    #[test]
    fn divergence_stops_trajectory() {
        let model = NormalLogp::new(0., vec![1e-3; 2]);
        let hamiltonian = EuclideanHamiltonian::new(&model, 5., 1000.);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut collector = AcceptanceRateCollector::new();
        let options = NutsOptions { maxdepth: 10 };

        let mut init = hamiltonian.init_state(&[1e-3, -1e-3]).unwrap();
        let (state, info) = draw(&mut init, &mut rng, &hamiltonian, &options, &mut collector).unwrap();
        assert!(info.divergence_info.is_some());
        assert_eq!(info.depth, 0);
        assert_eq!(state.index_in_trajectory(), 0);
        assert_eq!(collector.mean.current(), 0.);
    }
}
