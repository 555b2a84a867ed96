use serde::Serialize;

use crate::{
    hamiltonian::EuclideanHamiltonian,
    mass_matrix::RunningVariance,
    model::Model,
    nuts::Result,
    state::State,
    stepsize::{find_reasonable_step_size, AcceptanceRateCollector, DualAverage, DualAverageOptions},
};

/// Warmup windows for mass matrix adaptation.
///
/// Warmup starts with a fast interval of `init_buffer` draws where only the
/// step size is tuned, followed by slow windows that start at `base_window`
/// draws and double in size, and ends with `term_buffer` fast draws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSettings {
    pub init_buffer: u64,
    pub term_buffer: u64,
    pub base_window: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
        }
    }
}

/// Position in the warmup window schedule.
#[derive(Debug, Clone)]
pub(crate) struct WindowSchedule {
    num_warmup: u64,
    init_buffer: u64,
    term_buffer: u64,
    window_size: u64,
    next_window: u64,
    counter: u64,
    enabled: bool,
}

/// Warmups shorter than this only tune the step size.
const MIN_ADAPT_WARMUP: u64 = 20;

impl WindowSchedule {
    pub(crate) fn new(settings: WindowSettings, num_warmup: u64) -> Self {
        let WindowSettings {
            mut init_buffer,
            mut term_buffer,
            mut base_window,
        } = settings;

        let enabled = num_warmup >= MIN_ADAPT_WARMUP;
        if !enabled {
            tracing::debug!(num_warmup, "warmup too short for mass matrix adaptation");
        } else if init_buffer + base_window + term_buffer > num_warmup {
            init_buffer = (0.15 * num_warmup as f64) as u64;
            term_buffer = (0.1 * num_warmup as f64) as u64;
            base_window = num_warmup - (init_buffer + term_buffer);
            tracing::debug!(
                num_warmup,
                init_buffer,
                base_window,
                term_buffer,
                "warmup windows rescaled to fit the warmup length"
            );
        }

        WindowSchedule {
            num_warmup,
            init_buffer,
            term_buffer,
            window_size: base_window,
            next_window: init_buffer + base_window - 1,
            counter: 0,
            enabled,
        }
    }

    fn last_window_end(&self) -> u64 {
        self.num_warmup - self.term_buffer - 1
    }

    /// Whether the current draw goes into the variance estimate.
    pub(crate) fn in_slow_window(&self) -> bool {
        self.enabled
            && self.counter >= self.init_buffer
            && self.counter < self.num_warmup - self.term_buffer
            && self.counter != self.num_warmup
    }

    /// Whether the current draw closes a slow window.
    pub(crate) fn ends_window(&self) -> bool {
        self.enabled && self.counter == self.next_window && self.counter != self.num_warmup
    }

    fn compute_next_window(&mut self) {
        if self.next_window == self.last_window_end() {
            return;
        }
        self.window_size *= 2;
        self.next_window = self.counter + self.window_size;

        // Stretch the window to the terminal buffer if the one after it
        // would not fit.
        if self.next_window != self.last_window_end() {
            let next_boundary = self.next_window + 2 * self.window_size;
            if next_boundary >= self.num_warmup - self.term_buffer {
                self.next_window = self.last_window_end();
            }
        }
    }

    fn advance(&mut self) {
        self.counter += 1;
    }
}

/// Step size and diagonal mass matrix adaptation during warmup.
pub(crate) struct WindowedAdaptation {
    schedule: WindowSchedule,
    step_size_adapt: DualAverage,
    options: DualAverageOptions,
    variance: RunningVariance,
    target_accept: f64,
    num_warmup: u64,
}

impl WindowedAdaptation {
    pub(crate) fn new(
        windows: WindowSettings,
        options: DualAverageOptions,
        target_accept: f64,
        num_warmup: u64,
        dim: usize,
    ) -> Self {
        WindowedAdaptation {
            schedule: WindowSchedule::new(windows, num_warmup),
            step_size_adapt: DualAverage::new(options, 1.),
            options,
            variance: RunningVariance::new(dim),
            target_accept,
            num_warmup,
        }
    }

    /// Pick a starting step size at the initial position.
    pub(crate) fn init<M: Model, R: rand::Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<'_, M>,
        state: &State,
        rng: &mut R,
    ) -> Result<()> {
        find_reasonable_step_size(hamiltonian, state, rng)?;
        self.step_size_adapt = DualAverage::new(self.options, hamiltonian.step_size);
        Ok(())
    }

    /// Update the step size and mass matrix after warmup draw `draw`,
    /// now positioned at `state`.
    pub(crate) fn adapt<M: Model, R: rand::Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<'_, M>,
        state: &State,
        draw: u64,
        collector: &AcceptanceRateCollector,
        rng: &mut R,
    ) -> Result<()> {
        if draw >= self.num_warmup {
            return Ok(());
        }

        self.step_size_adapt
            .advance(collector.mean.current(), self.target_accept);
        hamiltonian.step_size = self.step_size_adapt.current_step_size();

        if self.schedule.in_slow_window() {
            self.variance.add_sample(&state.q);
        }
        if self.schedule.ends_window() {
            self.schedule.compute_next_window();
            hamiltonian
                .mass_matrix
                .update_diag(self.variance.regularized_variance());
            self.variance.restart();

            find_reasonable_step_size(hamiltonian, state, rng)?;
            self.step_size_adapt = DualAverage::new(self.options, hamiltonian.step_size);
            tracing::debug!(
                draw,
                step_size = hamiltonian.step_size,
                "updated mass matrix at end of slow window"
            );
        }
        self.schedule.advance();

        if draw + 1 == self.num_warmup {
            hamiltonian.step_size = self.step_size_adapt.current_step_size_adapted();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Draw indices that close a slow window.
    fn window_ends(settings: WindowSettings, num_warmup: u64) -> Vec<u64> {
        let mut schedule = WindowSchedule::new(settings, num_warmup);
        let mut ends = vec![];
        for draw in 0..num_warmup {
            if schedule.ends_window() {
                ends.push(draw);
                schedule.compute_next_window();
            }
            schedule.advance();
        }
        ends
    }

    #[test]
    fn default_windows() {
        // 75 fast draws, slow windows of 25, 50, 100, 200 and a stretched
        // final window of 500, then 50 fast draws.
        assert_eq!(
            window_ends(WindowSettings::default(), 1000),
            vec![99, 149, 249, 449, 949]
        );
    }

    #[test]
    fn short_warmup_is_rescaled() {
        // 15 / 75 / 10 split of 100 draws gives a single slow window.
        assert_eq!(window_ends(WindowSettings::default(), 100), vec![89]);

        let schedule = WindowSchedule::new(WindowSettings::default(), 100);
        assert!(!schedule.in_slow_window());
    }

    #[test]
    fn tiny_warmup_only_tunes_step_size() {
        assert!(window_ends(WindowSettings::default(), 10).is_empty());
        assert!(window_ends(WindowSettings::default(), 0).is_empty());
    }

    #[test]
    fn slow_window_covers_draws() {
        let mut schedule = WindowSchedule::new(WindowSettings::default(), 200);
        let mut slow = 0;
        for _ in 0..200 {
            if schedule.in_slow_window() {
                slow += 1;
            }
            if schedule.ends_window() {
                schedule.compute_next_window();
            }
            schedule.advance();
        }
        assert_eq!(slow, 200 - 75 - 50);
    }
}
