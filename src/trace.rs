use std::{sync::Arc, time::Duration};

use arrow::{
    array::{ArrayRef, BooleanArray, Float64Array, Int64Array, UInt64Array},
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
    record_batch::RecordBatch,
};
use serde::Serialize;

/// Sampler statistics of a single draw, named after their CmdStan columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DrawStats {
    /// `lp__`: log density (with Jacobian) at the draw
    pub lp: f64,
    /// `accept_stat__`: mean acceptance probability over the trajectory
    pub accept_stat: f64,
    /// `stepsize__`: step size used for the trajectory
    pub step_size: f64,
    /// `treedepth__`
    pub tree_depth: u64,
    /// `n_leapfrog__`
    pub n_leapfrog: u64,
    /// `divergent__`
    pub divergent: bool,
    /// `energy__`: Hamiltonian at the draw
    pub energy: f64,
    /// The trajectory stopped at the maximum tree depth
    pub maxdepth_reached: bool,
    pub warmup: bool,
}

/// All draws of one chain on the constrained scale.
#[derive(Debug, Clone)]
pub struct ChainTrace {
    pub chain: u64,
    /// Leading entries of `draws` and `stats` that are warmup draws
    pub num_warmup_saved: usize,
    pub draws: Vec<Box<[f64]>>,
    pub stats: Vec<DrawStats>,
    pub warmup_time: Duration,
    pub sampling_time: Duration,
    /// Adapted step size used after warmup
    pub step_size: f64,
    /// Adapted diagonal inverse metric
    pub inv_metric: Box<[f64]>,
}

impl ChainTrace {
    /// Draws after warmup.
    pub fn sampling_draws(&self) -> &[Box<[f64]>] {
        &self.draws[self.num_warmup_saved..]
    }

    pub fn sampling_stats(&self) -> &[DrawStats] {
        &self.stats[self.num_warmup_saved..]
    }

    /// One parameter across the post-warmup draws.
    pub fn param(&self, index: usize) -> Vec<f64> {
        self.sampling_draws().iter().map(|d| d[index]).collect()
    }

    pub fn stat(&self, f: impl Fn(&DrawStats) -> f64) -> Vec<f64> {
        self.sampling_stats().iter().map(f).collect()
    }

    pub fn divergences(&self) -> usize {
        self.sampling_stats().iter().filter(|s| s.divergent).count()
    }
}

/// The result of a sampling run.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Flat parameter names, `beta[1]` style
    pub param_names: Vec<String>,
    pub chains: Vec<ChainTrace>,
    pub num_warmup: u64,
    pub num_draws: u64,
    pub max_depth: u64,
}

impl Trace {
    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|n| n == name)
    }

    /// Post-warmup draws of one parameter, one vector per chain.
    pub fn param_draws(&self, index: usize) -> Vec<Vec<f64>> {
        self.chains.iter().map(|c| c.param(index)).collect()
    }

    /// Post-warmup values of one sampler statistic, one vector per chain.
    pub fn stat_draws(&self, f: impl Fn(&DrawStats) -> f64 + Copy) -> Vec<Vec<f64>> {
        self.chains.iter().map(|c| c.stat(f)).collect()
    }

    /// Total number of post-warmup transitions.
    pub fn num_transitions(&self) -> usize {
        self.chains.iter().map(|c| c.sampling_stats().len()).sum()
    }

    pub fn divergences(&self) -> usize {
        self.chains.iter().map(|c| c.divergences()).sum()
    }

    /// Post-warmup transitions that hit the maximum tree depth.
    pub fn max_depth_hits(&self) -> usize {
        self.chains
            .iter()
            .flat_map(|c| c.sampling_stats())
            .filter(|s| s.maxdepth_reached)
            .count()
    }

    pub fn sampling_time(&self) -> Duration {
        self.chains.iter().map(|c| c.sampling_time).sum()
    }

    /// A columnar view with one row per stored draw, warmup included.
    ///
    /// Warmup draws get negative draw indices.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ArrowError> {
        let mut fields = vec![
            Field::new("chain", DataType::UInt64, false),
            Field::new("draw", DataType::Int64, false),
            Field::new("lp__", DataType::Float64, false),
            Field::new("accept_stat__", DataType::Float64, false),
            Field::new("stepsize__", DataType::Float64, false),
            Field::new("treedepth__", DataType::UInt64, false),
            Field::new("n_leapfrog__", DataType::UInt64, false),
            Field::new("divergent__", DataType::Boolean, false),
            Field::new("energy__", DataType::Float64, false),
        ];
        fields.extend(
            self.param_names
                .iter()
                .map(|name| Field::new(name, DataType::Float64, false)),
        );

        let rows = || {
            self.chains
                .iter()
                .flat_map(|c| c.stats.iter().zip(&c.draws).map(move |row| (c, row)))
        };

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from_iter_values(rows().map(|(c, _)| c.chain))),
            Arc::new(Int64Array::from_iter_values(self.chains.iter().flat_map(
                |c| {
                    let warmup = c.num_warmup_saved as i64;
                    (0..c.draws.len() as i64).map(move |i| i - warmup)
                },
            ))),
            Arc::new(Float64Array::from_iter_values(rows().map(|(_, (s, _))| s.lp))),
            Arc::new(Float64Array::from_iter_values(
                rows().map(|(_, (s, _))| s.accept_stat),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows().map(|(_, (s, _))| s.step_size),
            )),
            Arc::new(UInt64Array::from_iter_values(
                rows().map(|(_, (s, _))| s.tree_depth),
            )),
            Arc::new(UInt64Array::from_iter_values(
                rows().map(|(_, (s, _))| s.n_leapfrog),
            )),
            Arc::new(BooleanArray::from(
                rows().map(|(_, (s, _))| s.divergent).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows().map(|(_, (s, _))| s.energy),
            )),
        ];
        for i in 0..self.param_names.len() {
            columns.push(Arc::new(Float64Array::from_iter_values(
                rows().map(|(_, (_, d))| d[i]),
            )));
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
    }
}
