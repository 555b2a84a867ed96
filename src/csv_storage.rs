//! CmdStan-compatible CSV output for sampling runs.
//!
//! One file per chain, named `chain_{id}.csv`, with `#` comment lines for
//! the configuration, the adaptation result and the timing, so existing Stan
//! analysis tools can read the draws.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use itertools::Itertools;

use crate::trace::{ChainTrace, DrawStats, Trace};

const STAT_COLUMNS: [&str; 7] = [
    "lp__",
    "accept_stat__",
    "stepsize__",
    "treedepth__",
    "n_leapfrog__",
    "divergent__",
    "energy__",
];

/// Configuration for CSV output.
#[derive(Debug, Clone)]
pub struct CsvConfig {
    /// Directory where CSV files will be written
    output_dir: PathBuf,
    /// Number of decimal places for floating point values
    precision: usize,
    /// Whether to write warmup draws, if the trace kept any (default: true)
    store_warmup: bool,
}

impl CsvConfig {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            precision: 6,
            store_warmup: true,
        }
    }

    /// Set the precision (number of decimal places) for floating point values.
    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn store_warmup(mut self, store: bool) -> Self {
        self.store_warmup = store;
        self
    }

    /// Write one file per chain and return their paths.
    pub fn write_trace(&self, trace: &Trace, model_name: &str) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create output directory: {:?}", self.output_dir)
        })?;

        trace
            .chains
            .iter()
            .map(|chain| {
                let path = self.output_dir.join(format!("chain_{}.csv", chain.chain));
                self.write_chain(&path, trace, chain, model_name)
                    .with_context(|| format!("Failed to write CSV file: {:?}", path))?;
                Ok(path)
            })
            .collect()
    }

    fn write_chain(&self, path: &Path, trace: &Trace, chain: &ChainTrace, model_name: &str) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);

        let save_warmup = self.store_warmup && chain.num_warmup_saved > 0;
        writeln!(out, "# model = {model_name}")?;
        writeln!(out, "# method = sample (Default)")?;
        writeln!(out, "#   sample")?;
        writeln!(out, "#     num_samples = {}", trace.num_draws)?;
        writeln!(out, "#     num_warmup = {}", trace.num_warmup)?;
        writeln!(out, "#     save_warmup = {}", u8::from(save_warmup))?;
        writeln!(out, "#     algorithm = hmc (Default)")?;
        writeln!(out, "#       hmc")?;
        writeln!(out, "#         engine = nuts (Default)")?;
        writeln!(out, "#           nuts")?;
        writeln!(out, "#             max_depth = {}", trace.max_depth)?;
        writeln!(out, "#         metric = diag_e (Default)")?;
        writeln!(out, "# id = {}", chain.chain + 1)?;

        {
            let mut writer = csv::Writer::from_writer(&mut out);
            let header = STAT_COLUMNS
                .iter()
                .map(|s| s.to_string())
                .chain(trace.param_names.iter().map(|n| cmdstan_name(n)));
            writer.write_record(header)?;
            if save_warmup {
                for (stats, draw) in chain.stats.iter().zip(&chain.draws).take(chain.num_warmup_saved) {
                    writer.write_record(self.row(stats, draw))?;
                }
            }
            writer.flush()?;
        }

        writeln!(out, "# Adaptation terminated")?;
        writeln!(out, "# Step size = {}", self.format_float(chain.step_size))?;
        writeln!(out, "# Diagonal elements of inverse mass matrix:")?;
        writeln!(
            out,
            "# {}",
            chain.inv_metric.iter().map(|v| self.format_float(*v)).join(", ")
        )?;

        {
            let mut writer = csv::Writer::from_writer(&mut out);
            for (stats, draw) in chain.sampling_stats().iter().zip(chain.sampling_draws()) {
                writer.write_record(self.row(stats, draw))?;
            }
            writer.flush()?;
        }

        let warmup = chain.warmup_time.as_secs_f64();
        let sampling = chain.sampling_time.as_secs_f64();
        writeln!(out, "# ")?;
        writeln!(out, "#  Elapsed Time: {warmup:.3} seconds (Warm-up)")?;
        writeln!(out, "#                {sampling:.3} seconds (Sampling)")?;
        writeln!(out, "#                {:.3} seconds (Total)", warmup + sampling)?;
        writeln!(out, "# ")?;
        out.flush()?;
        Ok(())
    }

    fn row(&self, stats: &DrawStats, draw: &[f64]) -> Vec<String> {
        let mut row = vec![
            self.format_float(stats.lp),
            self.format_float(stats.accept_stat),
            self.format_float(stats.step_size),
            stats.tree_depth.to_string(),
            stats.n_leapfrog.to_string(),
            if stats.divergent { "1" } else { "0" }.to_string(),
            self.format_float(stats.energy),
        ];
        row.extend(draw.iter().map(|&v| self.format_float(v)));
        row
    }

    /// Format a value for CSV output
    fn format_float(&self, v: f64) -> String {
        if v.is_nan() {
            "NA".to_string()
        } else if v.is_infinite() {
            if v > 0.0 { "Inf" } else { "-Inf" }.to_string()
        } else {
            format!("{:.prec$}", v, prec = self.precision)
        }
    }
}

/// CmdStan spells `beta[1]` as `beta.1` and `L[2,1]` as `L.2.1`.
fn cmdstan_name(name: &str) -> String {
    match name.split_once('[') {
        Some((base, rest)) => {
            let idx = rest.trim_end_matches(']').split(',').join(".");
            format!("{base}.{idx}")
        }
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::tests::small_trace;
    use pretty_assertions::assert_eq;

    fn read(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_path(path)?;
        let header = reader.headers()?.iter().map(|s| s.to_string()).collect();
        let rows = reader
            .records()
            .map(|r| Ok(r?.iter().map(|s| s.to_string()).collect()))
            .collect::<Result<_>>()?;
        Ok((header, rows))
    }

    #[test]
    fn test_names() {
        assert_eq!(cmdstan_name("sigma"), "sigma");
        assert_eq!(cmdstan_name("beta[3]"), "beta.3");
        assert_eq!(cmdstan_name("L[2,1]"), "L.2.1");
    }

    #[test]
    fn test_write_trace() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let output_path = temp_dir.path().join("out");
        let trace = small_trace();

        let paths = CsvConfig::new(&output_path)
            .with_precision(3)
            .write_trace(&trace, "normal")?;
        assert_eq!(paths.len(), 2);
        assert!(paths[1].ends_with("chain_1.csv"));

        let (header, rows) = read(&paths[1])?;
        assert_eq!(
            header,
            vec![
                "lp__",
                "accept_stat__",
                "stepsize__",
                "treedepth__",
                "n_leapfrog__",
                "divergent__",
                "energy__",
                "mu",
                "sigma"
            ]
        );
        // Warmup row plus two draws
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "-10.000");
        assert_eq!(rows[2][5], "1");
        assert_eq!(rows[2][7], "3.500");

        let text = std::fs::read_to_string(&paths[0])?;
        assert!(text.starts_with("# model = normal\n"));
        assert!(text.contains("# Step size = 0.500\n"));
        assert!(text.contains("Elapsed Time"));
        Ok(())
    }

    #[test]
    fn test_comment_blocks_surround_records() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let paths = CsvConfig::new(temp_dir.path())
            .with_precision(1)
            .write_trace(&small_trace(), "normal")?;
        let text = std::fs::read_to_string(&paths[1])?;
        let lines: Vec<&str> = text.lines().collect();

        let header = lines
            .iter()
            .position(|l| l.starts_with("lp__,"))
            .ok_or_else(|| anyhow::anyhow!("no header"))?;
        assert_eq!(lines[header - 1], "# id = 2");
        assert_eq!(lines[header + 1], "-10.0,0.9,0.5,2,3,1,11.0,100.0,200.0");
        assert_eq!(
            &lines[header + 2..header + 6],
            &[
                "# Adaptation terminated",
                "# Step size = 0.5",
                "# Diagonal elements of inverse mass matrix:",
                "# 1.0, 1.0",
            ]
        );
        assert_eq!(lines[header + 6], "-1.0,0.9,0.5,2,3,0,2.0,1.5,2.0");
        assert_eq!(lines[header + 7], "-2.0,0.9,0.5,2,3,1,3.0,3.5,4.0");
        assert_eq!(lines[header + 8], "# ");
        assert!(lines[header + 9].starts_with("#  Elapsed Time: 0.005 seconds (Warm-up)"));
        assert_eq!(lines.len(), header + 13);
        Ok(())
    }

    #[test]
    fn test_skip_warmup() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let trace = small_trace();
        let paths = CsvConfig::new(temp_dir.path())
            .store_warmup(false)
            .write_trace(&trace, "normal")?;
        let (_, rows) = read(&paths[0])?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "-1.000000");
        Ok(())
    }
}
