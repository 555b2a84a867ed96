use crate::math::{scalar_prods2, scalar_prods3};

/// A point in phase space.
///
/// Besides position and momentum this stores the sum of the momentum terms
/// from the initial point of the trajectory to this point, so that the
/// termination criterion can be evaluated for any pair of states in
/// `is_turning` without walking the trajectory again.
#[derive(Debug, Clone)]
pub(crate) struct State {
    pub(crate) q: Box<[f64]>,
    pub(crate) p: Box<[f64]>,
    /// Velocity, `M^{-1} p`
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    /// Gradient of the log density
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
}

impl State {
    pub(crate) fn new(dim: usize) -> State {
        State {
            q: vec![0.; dim].into(),
            p: vec![0.; dim].into(),
            v: vec![0.; dim].into(),
            p_sum: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.q.len()
    }

    /// The total energy (potential + kinetic)
    pub(crate) fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub(crate) fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    /// Initialize the point to be the first in the trajectory.
    pub(crate) fn make_init_point(&mut self) {
        self.idx_in_trajectory = 0;
        self.p_sum.copy_from_slice(&self.p);
    }

    pub(crate) fn log_acceptance_probability(&self, initial_energy: f64) -> f64 {
        (initial_energy - self.energy()).min(0.)
    }

    /// Update the momentum sum of `self`, the successor of `prev` in the
    /// trajectory.
    ///
    /// The backward half of the trajectory sums from index -1, so
    /// the initial momentum is only counted once.
    pub(crate) fn set_psum(&mut self, prev: &State) {
        assert!(self.idx_in_trajectory != 0);

        if self.idx_in_trajectory == -1 {
            self.p_sum.copy_from_slice(&self.p);
        } else {
            self.p_sum
                .iter_mut()
                .zip(prev.p_sum.iter().zip(self.p.iter()))
                .for_each(|(out, (s, p))| *out = s + p);
        }
    }

    /// Generalized no-U-turn criterion for the sub-trajectory between
    /// `self` and `other`.
    pub(crate) fn is_turning(&self, other: &State) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn point(idx: i64, p: f64) -> State {
        let mut state = State::new(1);
        state.idx_in_trajectory = idx;
        state.p[0] = p;
        state.v[0] = p;
        state
    }

    /// Build a trajectory with the given momenta at indices -k..=m and
    /// return it ordered by index.
    fn trajectory(backward: &[f64], init: f64, forward: &[f64]) -> Vec<State> {
        let mut first = point(0, init);
        first.make_init_point();

        let mut fwd = vec![first.clone()];
        for (i, &p) in forward.iter().enumerate() {
            let mut next = point(i as i64 + 1, p);
            next.set_psum(&fwd[i]);
            fwd.push(next);
        }
        let mut bwd: Vec<State> = vec![];
        for (i, &p) in backward.iter().enumerate() {
            let mut next = point(-(i as i64) - 1, p);
            next.set_psum(bwd.last().unwrap_or(&first));
            bwd.push(next);
        }
        bwd.reverse();
        bwd.extend(fwd);
        bwd
    }

    #[test]
    fn momentum_sums() {
        let traj = trajectory(&[2., 3.], 1., &[4., 5.]);
        let sums: Vec<f64> = traj.iter().map(|s| s.p_sum[0]).collect();
        assert_eq!(sums, vec![5., 2., 1., 5., 10.]);
    }

    #[test]
    fn turning_needs_reversal() {
        // All momenta point the same way: no U-turn on any span.
        let traj = trajectory(&[1., 1.], 1., &[1., 1.]);
        for i in 0..traj.len() {
            for j in (i + 1)..traj.len() {
                assert!(!traj[i].is_turning(&traj[j]));
                assert!(!traj[j].is_turning(&traj[i]));
            }
        }

        // The last point moves against the summed momentum.
        let traj = trajectory(&[], 1., &[0.5, -3.]);
        assert!(traj[0].is_turning(&traj[2]));
        assert!(!traj[0].is_turning(&traj[1]));

        let traj = trajectory(&[-3., 1.], 1., &[]);
        assert!(traj[0].is_turning(&traj[2]));
        assert!(traj[0].is_turning(&traj[1]));
        assert!(traj[1].is_turning(&traj[2]));

        let traj = trajectory(&[2.], 1., &[]);
        assert!(!traj[0].is_turning(&traj[1]));
    }
}
