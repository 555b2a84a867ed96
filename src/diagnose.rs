//! Rule-based checks over a sampling run, reported as text in the manner of
//! CmdStan's `diagnose` tool.

use std::fmt;

use serde::Serialize;

use crate::{
    diagnostics::{ebfmi, ess_bulk, r_hat},
    trace::Trace,
};

/// Thresholds for [`diagnose`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiagnoseThresholds {
    /// Split R-hat above this value flags a parameter
    pub max_r_hat: f64,
    /// E-BFMI below this value flags a chain
    pub min_ebfmi: f64,
    /// Effective draws per transition below this value flag a parameter
    pub min_ess_ratio: f64,
}

impl Default for DiagnoseThresholds {
    fn default() -> Self {
        Self {
            max_r_hat: 1.05,
            min_ebfmi: 0.3,
            min_ess_ratio: 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Check {
    TreeDepth,
    Divergences,
    Ebfmi,
    EffectiveSampleSize,
    RHat,
}

impl Check {
    fn heading(&self) -> Option<&'static str> {
        match self {
            Check::TreeDepth => Some("Checking sampler transitions treedepth."),
            Check::Divergences => Some("Checking sampler transitions for divergences."),
            Check::Ebfmi => Some("Checking E-BFMI - sampler transitions HMC potential energy."),
            Check::EffectiveSampleSize | Check::RHat => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub check: Check,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn outcome(&self, check: Check) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| o.check == check)
    }

    pub fn problems(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            if let Some(heading) = outcome.check.heading() {
                writeln!(f, "{heading}")?;
            }
            writeln!(f, "{}", outcome.message)?;
            writeln!(f)?;
        }
        if self.passed() {
            write!(f, "Processing complete, no problems detected.")
        } else {
            writeln!(f, "Processing complete. Problems found:")?;
            for problem in self.problems() {
                writeln!(f, "  - {:?}", problem.check)?;
            }
            Ok(())
        }
    }
}

fn percent(count: usize, total: usize) -> f64 {
    100. * count as f64 / total.max(1) as f64
}

fn check_tree_depth(trace: &Trace) -> CheckOutcome {
    let hits = trace.max_depth_hits();
    let total = trace.num_transitions();
    let message = if hits == 0 {
        "Treedepth satisfactory for all transitions.".to_string()
    } else {
        format!(
            "{hits} of {total} ({:.2}%) transitions hit the maximum treedepth limit of {}, \
             or 2^{} leapfrog steps.\n\
             Trajectories that are prematurely terminated due to this limit will result \
             in slow exploration.\n\
             For optimal performance, increase this limit.",
            percent(hits, total),
            trace.max_depth,
            trace.max_depth
        )
    };
    CheckOutcome {
        check: Check::TreeDepth,
        passed: hits == 0,
        message,
    }
}

fn check_divergences(trace: &Trace) -> CheckOutcome {
    let divergent = trace.divergences();
    let total = trace.num_transitions();
    let message = if divergent == 0 {
        "No divergent transitions found.".to_string()
    } else {
        format!(
            "{divergent} of {total} ({:.2}%) transitions ended with a divergence.\n\
             These divergent transitions indicate that HMC is not fully able to explore \
             the posterior distribution.\n\
             Try increasing adapt delta closer to 1.\n\
             If this doesn't remove all divergences, try to reparameterize the model.",
            percent(divergent, total)
        )
    };
    CheckOutcome {
        check: Check::Divergences,
        passed: divergent == 0,
        message,
    }
}

fn check_ebfmi(trace: &Trace, threshold: f64) -> CheckOutcome {
    let low: Vec<(u64, f64)> = trace
        .chains
        .iter()
        .map(|c| (c.chain, ebfmi(&c.stat(|s| s.energy))))
        .filter(|&(_, e)| e < threshold)
        .collect();
    let message = if low.is_empty() {
        "E-BFMI satisfactory.".to_string()
    } else {
        let mut message = String::new();
        for (chain, value) in &low {
            message.push_str(&format!(
                "Chain {}: E-BFMI = {value:.3}, below the nominal threshold of {threshold:.2}.\n",
                chain + 1
            ));
        }
        message.push_str(
            "E-BFMI below 0.2 indicates you may need to reparameterize your model.",
        );
        message
    };
    CheckOutcome {
        check: Check::Ebfmi,
        passed: low.is_empty(),
        message,
    }
}

fn check_ess(trace: &Trace, threshold: f64) -> CheckOutcome {
    let total = trace.num_transitions() as f64;
    let low: Vec<&str> = trace
        .param_names
        .iter()
        .enumerate()
        .filter(|&(i, _)| ess_bulk(&trace.param_draws(i)) / total < threshold)
        .map(|(_, name)| name.as_str())
        .collect();
    let message = if low.is_empty() {
        "Effective sample size satisfactory.".to_string()
    } else {
        format!(
            "The following parameters had fewer than {threshold} effective draws per transition:\n  {}\n\
             Such low values indicate that the effective sample size estimators may be biased high \
             and actual performance may be substantially lower than quoted.",
            low.join(", ")
        )
    };
    CheckOutcome {
        check: Check::EffectiveSampleSize,
        passed: low.is_empty(),
        message,
    }
}

fn check_r_hat(trace: &Trace, threshold: f64) -> CheckOutcome {
    let high: Vec<&str> = trace
        .param_names
        .iter()
        .enumerate()
        .filter(|&(i, _)| r_hat(&trace.param_draws(i)) > threshold)
        .map(|(_, name)| name.as_str())
        .collect();
    let message = if high.is_empty() {
        "Split R-hat values satisfactory all parameters.".to_string()
    } else {
        format!(
            "The following parameters had split R-hat greater than {threshold}:\n  {}\n\
             Such high values indicate incomplete mixing and biased estimation.\n\
             You should consider regularizating your model with additional prior information \
             or a more effective parameterization.",
            high.join(", ")
        )
    };
    CheckOutcome {
        check: Check::RHat,
        passed: high.is_empty(),
        message,
    }
}

/// Run all checks on the post-warmup draws of a trace.
///
/// Statistics that can not be computed, such as R-hat of very short chains,
/// do not flag a problem.
pub fn diagnose(trace: &Trace, thresholds: &DiagnoseThresholds) -> DiagnosticReport {
    DiagnosticReport {
        outcomes: vec![
            check_tree_depth(trace),
            check_divergences(trace),
            check_ebfmi(trace, thresholds.min_ebfmi),
            check_ess(trace, thresholds.min_ess_ratio),
            check_r_hat(trace, thresholds.max_r_hat),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{
        tests::{small_trace, stats},
        ChainTrace,
    };
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};
    use std::time::Duration;

    /// A trace with iid draws of one parameter, shifted per chain.
    fn iid_trace(shift: f64, random_walk_energy: bool) -> Trace {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let chains = (0..4)
            .map(|id| {
                let mut energy = 0.;
                let (draws, draw_stats) = (0..500)
                    .map(|_| {
                        let x: f64 = StandardNormal.sample(&mut rng);
                        let e: f64 = StandardNormal.sample(&mut rng);
                        energy = if random_walk_energy { energy + 0.01 * e } else { e };
                        let mut s = stats(-x * x, false, false);
                        s.tree_depth = 1;
                        s.energy = energy;
                        (vec![x + shift * id as f64].into_boxed_slice(), s)
                    })
                    .unzip();
                ChainTrace {
                    chain: id,
                    num_warmup_saved: 0,
                    draws,
                    stats: draw_stats,
                    warmup_time: Duration::from_millis(1),
                    sampling_time: Duration::from_millis(1),
                    step_size: 0.5,
                    inv_metric: vec![1.].into(),
                }
            })
            .collect();
        Trace {
            param_names: vec!["x".to_string()],
            chains,
            num_warmup: 0,
            num_draws: 500,
            max_depth: 10,
        }
    }

    #[test]
    fn healthy_run() {
        let report = diagnose(&iid_trace(0., false), &DiagnoseThresholds::default());
        assert!(report.passed(), "{report}");
        let text = report.to_string();
        assert!(text.contains("No divergent transitions found."));
        assert!(text.ends_with("Processing complete, no problems detected."));
    }

    #[test]
    fn problems_are_reported() {
        let report = diagnose(&small_trace(), &DiagnoseThresholds::default());
        assert!(!report.passed());

        let failed: Vec<Check> = report.problems().map(|o| o.check).collect();
        assert_eq!(failed, vec![Check::TreeDepth, Check::Divergences]);

        let divergences = report.outcome(Check::Divergences).map(|o| o.message.as_str());
        assert!(divergences
            .is_some_and(|m| m.starts_with("1 of 4 (25.00%) transitions ended with a divergence.")));
        assert!(report.to_string().contains("Problems found:"));
    }

    #[test]
    fn poor_mixing() {
        let report = diagnose(&iid_trace(5., true), &DiagnoseThresholds::default());
        let failed: Vec<Check> = report.problems().map(|o| o.check).collect();
        assert!(failed.contains(&Check::Ebfmi), "{failed:?}");
        assert!(failed.contains(&Check::RHat), "{failed:?}");
        assert!(!failed.contains(&Check::Divergences));
        let r_hat = report.outcome(Check::RHat).map(|o| o.message.as_str());
        assert!(r_hat.is_some_and(|m| m.contains("\n  x\n")));
    }

    #[test]
    fn warmup_is_ignored() {
        let mut trace = small_trace();
        trace.chains[1].stats[2].divergent = false;
        for s in trace.chains.iter_mut().flat_map(|c| c.stats.iter_mut()) {
            s.maxdepth_reached = false;
        }
        // The saved warmup draws are divergent, but do not count.
        assert!(diagnose(&trace, &DiagnoseThresholds::default()).passed());
    }
}
