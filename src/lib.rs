//! Start NUTS chains at the mean of a mean-field ADVI fit.
//!
//! The crate contains a small inference engine (mean-field ADVI and NUTS
//! with Stan-style warmup) behind two calls, [`fit_variational`] and
//! [`sample`], plus posterior summaries and a workflow that chains them.
//!
//! ```no_run
//! use vi_warmstart::{fit_variational, sample, Dataset, LinearRegression};
//!
//! # fn main() -> anyhow::Result<()> {
//! let data = Dataset::from_path("demos/blr.data.json")?;
//! let model = LinearRegression::from_data(&data)?;
//! let fit = fit_variational(&model, Default::default())?;
//! let trace = sample(&model, Some(&fit.estimate), Default::default())?;
//! println!("{} divergences", trace.divergences());
//! # Ok(())
//! # }
//! ```

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod csv_storage;
pub(crate) mod data;
pub(crate) mod diagnose;
pub(crate) mod diagnostics;
pub(crate) mod hamiltonian;
pub(crate) mod linear_regression;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod nuts;
pub(crate) mod params;
pub(crate) mod sampler;
pub(crate) mod state;
pub(crate) mod stepsize;
pub(crate) mod trace;
pub(crate) mod variational;
pub mod workflow;

pub use adapt_strategy::WindowSettings;
pub use csv_storage::CsvConfig;
pub use data::{DataError, DataValue, Dataset};
pub use diagnose::{diagnose, Check, CheckOutcome, DiagnoseThresholds, DiagnosticReport};
pub use diagnostics::{
    ebfmi, ess, ess_bulk, ess_tail, mcse, r_hat, rank_normalize, split_r_hat, summarize, Summary,
    SummaryRow, SummarySettings,
};
pub use linear_regression::{LinearRegression, RegressionError};
pub use model::{Constraint, LogpError, Model, ParamSpec};
pub use nuts::NutsError;
pub use params::{InitError, ParamMap, ParamValue};
pub use sampler::{sample, sample_chain, SampleError, SampleSettings, MAX_INIT_TRIES};
pub use stepsize::DualAverageOptions;
pub use trace::{ChainTrace, DrawStats, Trace};
pub use variational::{
    fit_variational, fit_variational_from, ElboRecord, VariationalError, VariationalFit,
    VariationalSettings,
};
