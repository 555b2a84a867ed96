//! vi-warmstart CLI

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use vi_warmstart::{
    workflow::{self, load_model, run_sampling, ModelKind, WorkflowConfig},
    ParamMap, SampleSettings, VariationalSettings,
};

#[derive(Parser)]
#[command(name = "vi-warmstart")]
#[command(about = "Initialize NUTS chains from a mean-field variational fit")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Model name
    #[arg(short, long, default_value = "blr")]
    model: ModelKind,

    /// Dataset (JSON)
    #[arg(short, long)]
    data: PathBuf,

    /// Directory for the estimate JSON and the chain CSV files
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct VariationalArgs {
    /// RNG seed of the variational fit
    #[arg(long, default_value = "0")]
    vi_seed: u64,

    /// Fail if the relative ELBO change does not converge
    #[arg(long)]
    require_converged: bool,

    /// Maximum number of ADVI iterations
    #[arg(long, default_value = "10000")]
    iter: u64,

    /// Fixed step size scale; chosen by trial runs if omitted
    #[arg(long)]
    eta: Option<f64>,

    /// Relative ELBO tolerance
    #[arg(long, default_value = "0.01")]
    tol_rel_obj: f64,
}

impl VariationalArgs {
    fn settings(&self) -> VariationalSettings {
        VariationalSettings {
            seed: self.vi_seed,
            require_converged: self.require_converged,
            iter: self.iter,
            eta: self.eta,
            tol_rel_obj: self.tol_rel_obj,
            ..Default::default()
        }
    }
}

#[derive(Args)]
struct SampleArgs {
    /// RNG seed of the sampler
    #[arg(long, default_value = "0")]
    seed: u64,

    #[arg(long, default_value = "4")]
    chains: usize,

    #[arg(long, default_value = "1000")]
    warmup: u64,

    #[arg(long, default_value = "1000")]
    draws: u64,

    #[arg(long, default_value = "10")]
    max_depth: u64,

    /// Target acceptance statistic of step size adaptation
    #[arg(long, default_value = "0.8")]
    target_accept: f64,

    /// Keep warmup draws in the CSV output
    #[arg(long)]
    save_warmup: bool,
}

impl SampleArgs {
    fn settings(&self) -> SampleSettings {
        SampleSettings {
            seed: self.seed,
            num_chains: self.chains,
            num_warmup: self.warmup,
            num_draws: self.draws,
            max_depth: self.max_depth,
            target_accept: self.target_accept,
            save_warmup: self.save_warmup,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fit ADVI, then sample starting at its estimate
    Run {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        variational: VariationalArgs,
        #[command(flatten)]
        sample: SampleArgs,

        /// Also sample from random starting points and compare
        #[arg(long)]
        compare: bool,
    },

    /// Fit ADVI and print the estimate
    Variational {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        variational: VariationalArgs,
    },

    /// Sample from random starting points, or from saved inits
    Sample {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        sample: SampleArgs,

        /// Initial values (JSON), e.g. a saved variational estimate
        #[arg(long)]
        inits: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            model,
            variational,
            sample,
            compare,
        } => cmd_run(&model, &variational, &sample, compare),
        Commands::Variational { model, variational } => cmd_variational(&model, &variational),
        Commands::Sample {
            model,
            sample,
            inits,
        } => cmd_sample(&model, &sample, inits.as_deref()),
    }
}

fn config(model: &ModelArgs) -> WorkflowConfig {
    let mut config = WorkflowConfig::new(model.model, &model.data);
    config.output_dir = model.output.clone();
    config
}

fn cmd_run(
    model: &ModelArgs,
    variational: &VariationalArgs,
    sample: &SampleArgs,
    compare: bool,
) -> Result<()> {
    let mut config = config(model);
    config.variational = variational.settings();
    config.sample = sample.settings();
    if compare {
        println!("{}", workflow::compare(&config)?);
    } else {
        println!("{}", workflow::run(&config)?);
    }
    Ok(())
}

fn cmd_variational(model: &ModelArgs, variational: &VariationalArgs) -> Result<()> {
    let mut config = config(model);
    config.variational = variational.settings();
    let logp = load_model(config.model, &config.data)?;
    let fit = workflow::fit(&logp, &config)?;
    println!("{}", fit.estimate);
    Ok(())
}

fn cmd_sample(model: &ModelArgs, sample: &SampleArgs, inits: Option<&Path>) -> Result<()> {
    let mut config = config(model);
    config.sample = sample.settings();
    let inits = inits
        .map(|path| {
            ParamMap::read_json(path)
                .with_context(|| format!("Failed to read inits {}", path.display()))
        })
        .transpose()?;
    let logp = load_model(model.model, &model.data)?;
    println!("{}", run_sampling(&logp, inits.as_ref(), &config)?);
    Ok(())
}
