//! Posterior summaries: split R-hat, bulk and tail ESS, MCSE and E-BFMI.
//!
//! R-hat is the rank-normalized folded split R-hat of Vehtari et al. (2021).
//! ESS uses variogram autocorrelations with Geyer's initial monotone
//! sequence over split chains.

use std::fmt;

use serde::Serialize;
use statrs::function::erf::erf_inv;

use crate::{
    math::{mean, median, quantile_sorted, sample_variance},
    trace::Trace,
};

/// Settings for [`summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummarySettings {
    /// Percentiles shown in the table, in percent
    pub percentiles: [f64; 3],
    /// Significant figures of the printed values
    pub sig_figs: usize,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            percentiles: [5., 50., 95.],
            sig_figs: 3,
        }
    }
}

/// Summary statistics of one quantity over all post-warmup draws.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub name: String,
    pub mean: f64,
    pub mcse: f64,
    pub sd: f64,
    pub quantiles: [f64; 3],
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub ess_per_sec: f64,
    pub r_hat: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub settings: SummarySettings,
    /// `lp__` first, then the parameters in trace order
    pub rows: Vec<SummaryRow>,
}

impl Summary {
    pub fn row(&self, name: &str) -> Option<&SummaryRow> {
        self.rows.iter().find(|r| r.name == name)
    }

    /// The largest finite R-hat over the parameters, `lp__` excluded.
    pub fn max_r_hat(&self) -> f64 {
        self.rows
            .iter()
            .filter(|r| r.name != "lp__")
            .map(|r| r.r_hat)
            .filter(|v| v.is_finite())
            .fold(f64::NAN, f64::max)
    }
}

fn format_sig(value: f64, sig_figs: usize) -> String {
    if !value.is_finite() || value == 0. {
        return format!("{value}");
    }
    let magnitude = value.abs().log10().floor() as i64;
    let decimals = (sig_figs as i64 - 1 - magnitude).max(0) as usize;
    format!("{value:.decimals$}")
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sig = self.settings.sig_figs;
        let width = self
            .rows
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(0)
            .max(4);

        write!(f, "{:width$} {:>10} {:>10} {:>10}", "", "Mean", "MCSE", "StdDev")?;
        for p in self.settings.percentiles {
            write!(f, " {:>10}", format!("{p}%"))?;
        }
        writeln!(
            f,
            " {:>8} {:>10} {:>8} {:>8}",
            "N_Eff", "N_Eff/s", "ESS_tail", "R_hat"
        )?;

        for row in &self.rows {
            write!(
                f,
                "{:width$} {:>10} {:>10} {:>10}",
                row.name,
                format_sig(row.mean, sig),
                format_sig(row.mcse, sig),
                format_sig(row.sd, sig),
            )?;
            for q in row.quantiles {
                write!(f, " {:>10}", format_sig(q, sig))?;
            }
            writeln!(
                f,
                " {:>8.0} {:>10} {:>8.0} {:>8.3}",
                row.ess_bulk,
                format_sig(row.ess_per_sec, sig),
                row.ess_tail,
                row.r_hat
            )?;
        }
        Ok(())
    }
}

/// Summarize `lp__` and every parameter of a trace.
pub fn summarize(trace: &Trace, settings: &SummarySettings) -> Summary {
    let seconds = trace.sampling_time().as_secs_f64();

    let mut rows = Vec::with_capacity(trace.param_names.len() + 1);
    rows.push(summarize_draws(
        "lp__",
        &trace.stat_draws(|s| s.lp),
        settings,
        seconds,
    ));
    rows.extend(
        trace
            .param_names
            .iter()
            .enumerate()
            .map(|(i, name)| summarize_draws(name, &trace.param_draws(i), settings, seconds)),
    );
    Summary {
        settings: *settings,
        rows,
    }
}

fn summarize_draws(
    name: &str,
    chains: &[Vec<f64>],
    settings: &SummarySettings,
    seconds: f64,
) -> SummaryRow {
    let mut all: Vec<f64> = chains.iter().flatten().copied().collect();
    let row_mean = mean(&all);
    let sd = sample_variance(&all).sqrt();
    all.sort_by(f64::total_cmp);
    let quantiles = settings
        .percentiles
        .map(|p| quantile_sorted(&all, p / 100.));

    let ess_bulk = ess_bulk(chains);
    SummaryRow {
        name: name.to_string(),
        mean: row_mean,
        mcse: mcse(sd, ess_bulk),
        sd,
        quantiles,
        ess_bulk,
        ess_tail: ess_tail(chains),
        ess_per_sec: ess_bulk / seconds,
        r_hat: r_hat(chains),
    }
}

/// Monte Carlo standard error of the mean.
pub fn mcse(sd: f64, ess: f64) -> f64 {
    sd / ess.sqrt()
}

/// Split each chain in half and trim all halves to a common length.
///
/// `None` if any half would have fewer than four draws.
fn split_chains(chains: &[Vec<f64>]) -> Option<Vec<&[f64]>> {
    if chains.is_empty() {
        return None;
    }
    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|c| {
            let (a, b) = c.split_at(c.len() / 2);
            [a, b]
        })
        .collect();
    let len = halves.iter().map(|h| h.len()).min()?;
    if len < 4 {
        return None;
    }
    Some(halves.into_iter().map(|h| &h[..len]).collect())
}

/// Within-chain variance, and the pooled estimate of the marginal variance.
fn variance_components(split: &[&[f64]]) -> (f64, f64) {
    let m = split.len() as f64;
    let n = split[0].len() as f64;
    let means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let within = split.iter().map(|c| sample_variance(c)).sum::<f64>() / m;
    let between = if split.len() > 1 {
        n * sample_variance(&means)
    } else {
        0.
    };
    (within, (n - 1.) / n * within + between / n)
}

/// Classic split R-hat. `NaN` for chains that are too short or constant.
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let Some(split) = split_chains(chains) else {
        return f64::NAN;
    };
    let (within, var_plus) = variance_components(&split);
    if within < 1e-30 {
        return f64::NAN;
    }
    (var_plus / within).sqrt()
}

/// Replace draws by normal scores of their pooled ranks, averaging ties.
pub fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, draws)| draws.iter().enumerate().map(move |(i, &x)| (x, c, i)))
        .collect();
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total = flat.len() as f64;
    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.; c.len()]).collect();
    let mut start = 0;
    while start < flat.len() {
        let end = start
            + flat[start..]
                .iter()
                .take_while(|v| v.0 == flat[start].0)
                .count();
        let rank = 0.5 * ((start + 1) as f64 + end as f64);
        // Blom offset
        let p = (rank - 0.375) / (total + 0.25);
        let z = std::f64::consts::SQRT_2 * erf_inv(2. * p - 1.);
        for &(_, c, i) in &flat[start..end] {
            out[c][i] = z;
        }
        start = end;
    }
    out
}

/// Rank-normalized folded split R-hat: the larger of the R-hat of the
/// rank-normalized draws and of the rank-normalized distances to the median.
pub fn r_hat(chains: &[Vec<f64>]) -> f64 {
    let all: Vec<f64> = chains.iter().flatten().copied().collect();
    let med = median(&all);
    let folded: Vec<Vec<f64>> = chains
        .iter()
        .map(|c| c.iter().map(|x| (x - med).abs()).collect())
        .collect();
    let bulk = split_r_hat(&rank_normalize(chains));
    let tail = split_r_hat(&rank_normalize(&folded));
    match (bulk.is_nan(), tail.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => tail,
        (false, true) => bulk,
        (false, false) => bulk.max(tail),
    }
}

/// Effective sample size of split chains without rank normalization.
///
/// `NaN` if the chains are too short; the number of draws if the draws are
/// constant.
pub fn ess(chains: &[Vec<f64>]) -> f64 {
    let Some(split) = split_chains(chains) else {
        return f64::NAN;
    };
    let n = split[0].len();
    let total = (split.len() * n) as f64;
    let (_, var_plus) = variance_components(&split);
    if !var_plus.is_finite() || var_plus < 1e-30 {
        return total;
    }

    let autocorr = |lag: usize| {
        let sq_diff: f64 = split
            .iter()
            .map(|c| c.windows(lag + 1).map(|w| (w[lag] - w[0]).powi(2)).sum::<f64>())
            .sum();
        let variogram = sq_diff / (split.len() * (n - lag)) as f64;
        1. - variogram / (2. * var_plus)
    };

    // Geyer's initial positive sequence, made monotone.
    let mut tau = -1.;
    let mut prev_pair = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let rho_even = if lag == 0 { 1. } else { autocorr(lag) };
        let pair = rho_even + autocorr(lag + 1);
        if pair < 0. {
            break;
        }
        let pair = pair.min(prev_pair);
        tau += 2. * pair;
        prev_pair = pair;
        lag += 2;
    }
    let tau = tau.max(1. / total.log10());
    (total / tau).min(total * total.log10())
}

/// Bulk ESS: ESS of the rank-normalized draws.
pub fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    ess(&rank_normalize(chains))
}

/// Tail ESS: the smaller ESS of the indicators for the 5% and 95% quantiles.
pub fn ess_tail(chains: &[Vec<f64>]) -> f64 {
    let mut all: Vec<f64> = chains.iter().flatten().copied().collect();
    all.sort_by(f64::total_cmp);
    let lower = quantile_sorted(&all, 0.05);
    let upper = quantile_sorted(&all, 0.95);
    let indicator = |f: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if f(x) { 1. } else { 0. }).collect())
            .collect()
    };
    let lower = ess(&indicator(&|x| x <= lower));
    let upper = ess(&indicator(&|x| x >= upper));
    lower.min(upper)
}

/// Energy Bayesian fraction of missing information of one chain.
pub fn ebfmi(energy: &[f64]) -> f64 {
    if energy.len() < 2 {
        return f64::NAN;
    }
    let var = sample_variance(energy);
    if var < 1e-30 {
        return f64::NAN;
    }
    let msd = energy
        .windows(2)
        .map(|w| (w[1] - w[0]).powi(2))
        .sum::<f64>()
        / (energy.len() - 1) as f64;
    msd / var
}
