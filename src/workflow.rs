//! The two-stage workflow: fit a variational approximation, then start every
//! NUTS chain at its mean and report diagnostics.
//!
//! The engine is only reached through [`fit_variational`] and [`sample`].
//!
//! With a warmup of only 10 iterations, chains started at the variational
//! estimate mix on the bundled dataset while random starting points do not:
//!
//! ```no_run
//! use vi_warmstart::{
//!     workflow::{compare, ModelKind, WorkflowConfig},
//!     SampleSettings,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut config = WorkflowConfig::new(ModelKind::Blr, "demos/blr.data.json");
//! config.variational.seed = 1;
//! config.sample = SampleSettings {
//!     num_warmup: 10,
//!     num_draws: 1000,
//!     num_chains: 4,
//!     seed: 1,
//!     ..Default::default()
//! };
//! println!("{}", compare(&config)?);
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};

use crate::{
    csv_storage::CsvConfig,
    data::Dataset,
    diagnose::{diagnose, DiagnoseThresholds, DiagnosticReport},
    diagnostics::{summarize, Summary, SummarySettings},
    linear_regression::LinearRegression,
    model::Model,
    params::ParamMap,
    sampler::{sample, SampleSettings},
    trace::Trace,
    variational::{fit_variational, VariationalFit, VariationalSettings},
};

/// The bundled models, selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Bayesian linear regression
    Blr,
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blr" => Ok(ModelKind::Blr),
            other => anyhow::bail!("unknown model `{other}`, expected one of: blr"),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Blr => write!(f, "blr"),
        }
    }
}

/// Where the chains start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStrategy {
    /// Every chain starts at the variational estimate
    Variational,
    /// Each chain draws uniformly in `(-init_radius, init_radius)` on the
    /// unconstrained scale
    Random,
}

impl fmt::Display for InitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStrategy::Variational => write!(f, "variational"),
            InitStrategy::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub model: ModelKind,
    /// JSON dataset
    pub data: PathBuf,
    pub variational: VariationalSettings,
    pub sample: SampleSettings,
    pub summary: SummarySettings,
    pub thresholds: DiagnoseThresholds,
    /// Write the estimate as JSON and the chains as CSV below this directory
    pub output_dir: Option<PathBuf>,
}

impl WorkflowConfig {
    pub fn new(model: ModelKind, data: impl Into<PathBuf>) -> Self {
        Self {
            model,
            data: data.into(),
            variational: VariationalSettings::default(),
            sample: SampleSettings::default(),
            summary: SummarySettings::default(),
            thresholds: DiagnoseThresholds::default(),
            output_dir: None,
        }
    }
}

/// A sampling run together with its summaries.
#[derive(Debug, Clone)]
pub struct InitializedRun {
    pub init: InitStrategy,
    pub trace: Trace,
    pub summary: Summary,
    pub report: DiagnosticReport,
}

impl InitializedRun {
    pub fn divergences(&self) -> usize {
        self.trace.divergences()
    }

    pub fn max_r_hat(&self) -> f64 {
        self.summary.max_r_hat()
    }
}

impl fmt::Display for InitializedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sampling with {} initialization", self.init)?;
        writeln!(f)?;
        writeln!(f, "{}", self.summary)?;
        write!(f, "{}", self.report)
    }
}

pub struct WorkflowOutcome {
    pub fit: VariationalFit,
    pub run: InitializedRun,
}

fn write_estimate(f: &mut fmt::Formatter<'_>, fit: &VariationalFit) -> fmt::Result {
    writeln!(f, "Variational estimate (eta = {}):", fit.eta)?;
    writeln!(f, "{}", fit.estimate)?;
    if !fit.converged {
        writeln!(
            f,
            "The variational fit did not converge within {} iterations.",
            fit.iterations
        )?;
    }
    Ok(())
}

impl fmt::Display for WorkflowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_estimate(f, &self.fit)?;
        writeln!(f)?;
        write!(f, "{}", self.run)
    }
}

/// Both initializations with the same seed and warmup.
pub struct Comparison {
    pub fit: VariationalFit,
    pub variational: InitializedRun,
    pub random: InitializedRun,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_estimate(f, &self.fit)?;
        writeln!(f)?;
        writeln!(f, "{}", self.variational)?;
        writeln!(f)?;
        writeln!(f, "{}", self.random)?;
        writeln!(f)?;
        writeln!(f, "{:<12} {:>12} {:>10}", "init", "divergences", "max R_hat")?;
        for run in [&self.variational, &self.random] {
            writeln!(
                f,
                "{:<12} {:>12} {:>10.3}",
                run.init.to_string(),
                run.divergences(),
                run.max_r_hat()
            )?;
        }
        Ok(())
    }
}

/// Build the selected model from a JSON dataset.
pub fn load_model(kind: ModelKind, data: &Path) -> Result<LinearRegression> {
    let dataset = Dataset::from_path(data)
        .with_context(|| format!("Failed to read dataset {}", data.display()))?;
    match kind {
        ModelKind::Blr => LinearRegression::from_data(&dataset)
            .with_context(|| format!("Dataset {} does not fit model {kind}", data.display())),
    }
}

/// Sample and summarize.
pub fn run_sampling<M: Model>(
    model: &M,
    inits: Option<&ParamMap>,
    config: &WorkflowConfig,
) -> Result<InitializedRun> {
    let init = match inits {
        Some(_) => InitStrategy::Variational,
        None => InitStrategy::Random,
    };
    let trace = sample(model, inits, config.sample)
        .with_context(|| format!("Sampling with {init} initialization failed"))?;
    let summary = summarize(&trace, &config.summary);
    let report = diagnose(&trace, &config.thresholds);
    tracing::info!(
        %init,
        divergences = trace.divergences(),
        max_r_hat = summary.max_r_hat(),
        passed = report.passed(),
        "sampling finished"
    );

    if let Some(dir) = &config.output_dir {
        CsvConfig::new(dir.join(init.to_string()))
            .store_warmup(config.sample.save_warmup)
            .write_trace(&trace, &config.model.to_string())?;
    }
    Ok(InitializedRun {
        init,
        trace,
        summary,
        report,
    })
}

/// Fit the variational approximation and, with an output directory, save
/// its estimate as `estimate.json`.
pub fn fit<M: Model>(model: &M, config: &WorkflowConfig) -> Result<VariationalFit> {
    let fit = fit_variational(model, config.variational).context("Variational fit failed")?;
    tracing::info!(
        eta = fit.eta,
        iterations = fit.iterations,
        converged = fit.converged,
        "variational fit finished"
    );
    if let Some(dir) = &config.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        let path = dir.join("estimate.json");
        fit.estimate
            .write_json(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(fit)
}

/// Fit, then sample from the variational estimate.
pub fn run(config: &WorkflowConfig) -> Result<WorkflowOutcome> {
    let model = load_model(config.model, &config.data)?;
    let fit = fit(&model, config)?;
    let run = run_sampling(&model, Some(&fit.estimate), config)?;
    Ok(WorkflowOutcome { fit, run })
}

/// Fit, then sample once from the variational estimate and once from random
/// starting points.
pub fn compare(config: &WorkflowConfig) -> Result<Comparison> {
    let model = load_model(config.model, &config.data)?;
    let fit = fit(&model, config)?;
    let variational = run_sampling(&model, Some(&fit.estimate), config)?;
    let random = run_sampling(&model, None, config)?;
    Ok(Comparison {
        fit,
        variational,
        random,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn data_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/blr.data.json")
    }

    #[test]
    fn model_names() -> Result<()> {
        assert_eq!("blr".parse::<ModelKind>()?, ModelKind::Blr);
        assert_eq!(ModelKind::Blr.to_string(), "blr");
        assert!("eight_schools".parse::<ModelKind>().is_err());
        Ok(())
    }

    #[test]
    fn load_bundled_model() -> Result<()> {
        let model = load_model(ModelKind::Blr, &data_path())?;
        assert_eq!(model.num_observations(), 100);
        assert_eq!(model.num_predictors(), 5);
        assert!(load_model(ModelKind::Blr, Path::new("does/not/exist.json")).is_err());
        Ok(())
    }

    #[test]
    fn fit_saves_estimate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = load_model(ModelKind::Blr, &data_path())?;
        let mut config = WorkflowConfig::new(ModelKind::Blr, data_path());
        config.variational.seed = 2;
        config.variational.output_samples = 0;

        config.output_dir = Some(dir.path().join("nested/fit"));
        let fit = fit(&model, &config)?;
        let saved = ParamMap::read_json(dir.path().join("nested/fit/estimate.json"))?;
        assert_eq!(saved, fit.estimate);

        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "")?;
        config.output_dir = Some(blocker.join("fit"));
        let err = super::fit(&model, &config).err().map(|e| e.to_string());
        assert!(
            err.as_deref().is_some_and(|e| e.starts_with("Failed to create output directory")),
            "{err:?}"
        );
        Ok(())
    }

    #[test]
    fn writes_outputs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = WorkflowConfig::new(ModelKind::Blr, data_path());
        config.output_dir = Some(dir.path().to_path_buf());
        config.variational.seed = 5;
        config.sample = SampleSettings {
            num_chains: 2,
            num_warmup: 100,
            num_draws: 50,
            seed: 5,
            ..Default::default()
        };

        let outcome = run(&config)?;
        assert_eq!(outcome.run.init, InitStrategy::Variational);
        assert_eq!(outcome.run.trace.num_transitions(), 100);

        let estimate = ParamMap::read_json(dir.path().join("estimate.json"))?;
        assert_eq!(estimate, outcome.fit.estimate);
        assert!(dir.path().join("variational/chain_1.csv").exists());

        let text = outcome.to_string();
        assert!(text.contains("Variational estimate"));
        assert!(text.contains("sigma"));
        assert!(text.contains("Processing complete"));
        Ok(())
    }
}
