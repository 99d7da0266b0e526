//! CLI wiring for the kerneltune toolkit.

use crate::session::{SessionOptions, TuneOptions, TuneSession};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kerneltune_ir::ScalarType;
use kerneltune_kernels::{
    Family, MatrixAxpyParameters, ReductionParameters, RowWiseReductionParameters,
    VectorAxpyParameters,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kerneltune", about = "Kernel generation and autotuning toolkit")]
pub struct Cli {
    /// Use a simulated device that records dispatches.
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Vendor id reported by the simulated device.
    #[arg(long)]
    pub vendor: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ScalarArg {
    F32,
    F64,
}

impl From<ScalarArg> for ScalarType {
    fn from(value: ScalarArg) -> ScalarType {
        match value {
            ScalarArg::F32 => ScalarType::F32,
            ScalarArg::F64 => ScalarType::F64,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the capabilities of the selected device.
    Devices,
    /// Print the kernel source generated for a sample workload.
    Generate {
        /// vector_axpy, matrix_axpy, reduction or row_wise_reduction.
        #[arg(long)]
        family: Family,
        /// Elements per operand; matrices use the largest square that fits.
        #[arg(long, default_value_t = 1 << 16)]
        size: usize,
        #[arg(long, value_enum, default_value = "f32")]
        scalar: ScalarArg,
        /// Tuning cache whose entries override the built-in defaults.
        #[arg(long)]
        cache: Option<PathBuf>,
    },
    /// Sweep a family's parameter space on a sample workload.
    Tune {
        #[arg(long)]
        family: Family,
        /// Elements per operand; matrices use the largest square that fits.
        #[arg(long, default_value_t = 1 << 16)]
        size: usize,
        #[arg(long, value_enum, default_value = "f32")]
        scalar: ScalarArg,
        /// JSON object mapping axis names to candidate lists.
        #[arg(long)]
        space: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        repeats: usize,
        /// CSV file receiving one row per benchmarked configuration.
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Tuning cache updated with the fastest configuration.
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli {
        simulate,
        vendor,
        command,
    } = cli;
    let session = TuneSession::new(SessionOptions { simulate, vendor })?;

    match command {
        Command::Devices => {
            println!("{}", serde_json::to_string_pretty(session.info())?);
            println!(
                "scheduling_granularity={}",
                session.info().scheduling_granularity()
            );
        }
        Command::Generate {
            family,
            size,
            scalar,
            cache,
        } => {
            let statements = session.workload(family, size, scalar.into())?;
            let cache = cache.as_deref();
            let source = match family {
                Family::VectorAxpy => session.generate::<VectorAxpyParameters>(&statements, cache)?,
                Family::MatrixAxpy => session.generate::<MatrixAxpyParameters>(&statements, cache)?,
                Family::Reduction => session.generate::<ReductionParameters>(&statements, cache)?,
                Family::RowWiseReduction => {
                    session.generate::<RowWiseReductionParameters>(&statements, cache)?
                }
            };
            println!("{source}");
        }
        Command::Tune {
            family,
            size,
            scalar,
            space,
            repeats,
            trace,
            cache,
            top,
        } => {
            let options = TuneOptions {
                scalar_type: scalar.into(),
                space,
                repeats,
                trace,
                cache,
                top,
            };
            let statements = session.workload(family, size, options.scalar_type)?;
            let report = match family {
                Family::VectorAxpy => session.tune::<VectorAxpyParameters>(&statements, &options)?,
                Family::MatrixAxpy => session.tune::<MatrixAxpyParameters>(&statements, &options)?,
                Family::Reduction => session.tune::<ReductionParameters>(&statements, &options)?,
                Family::RowWiseReduction => {
                    session.tune::<RowWiseReductionParameters>(&statements, &options)?
                }
            };
            info!(
                family = %report.family,
                evaluated = report.evaluated,
                best_time = report.ranking.first().map(|entry| entry.time),
                "tuning finished"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_parse() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            "kerneltune",
            "--simulate",
            "--vendor",
            "4098",
            "tune",
            "--family",
            "row_wise_reduction",
            "--repeats",
            "3",
        ])
        .unwrap();
        assert!(cli.simulate);
        assert_eq!(cli.vendor, Some(4098));
        match cli.command {
            Command::Tune {
                family, repeats, ..
            } => {
                assert_eq!(family, Family::RowWiseReduction);
                assert_eq!(repeats, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["kerneltune", "generate", "--family", "gemm"]).is_err());
    }
}
