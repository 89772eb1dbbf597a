//! distributed-pca - truncated SVD of a row-partitioned dense matrix
//!
//! Loads one named dataset from a container file, splits its rows across the requested
//! number of processes and prints the partition table, solver diagnostics and the
//! leading singular values.
//!
//! Built with the `mpi` feature and started under `mpirun`, every MPI process is one rank
//! and `--processes` is ignored. Otherwise the ranks run as threads of this process.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use distributed_pca::job::ConvergenceDiagnostics;
use distributed_pca::report::{write_diagnostics, write_partition_table, write_results};
use distributed_pca::{
    partition_rows, run_distributed, DatasetFile, DistSvdError, EigensolverConfig, GlobalMatrixShape, JobConfig,
    ResultSet, RowCountPolicy,
};
#[cfg(feature = "mpi")]
use distributed_pca::{run_rank, Communicator, JobContext, MpiComm};
use env_logger::Env;
#[cfg(feature = "mpi")]
use log::warn;
use log::{error, info};
use std::io::{self, Write};
use std::path::PathBuf;

const EXIT_FAILURE: i32 = 1;
const EXIT_NOT_CONVERGED: i32 = 2;

/// Truncated SVD of a dense matrix through a distributed Gramian eigensolver
#[derive(Parser)]
#[command(
    name = "distributed-pca",
    version,
    about = "Truncated SVD of a row-partitioned dense matrix",
    after_help = r#"
Environment Variables:
  DPCA_PROCESSES=4         Number of cooperating processes
  DPCA_LOG_LEVEL=debug     Set log level (error, warn, info, debug, trace)

Exit status is 0 on success, 2 when the eigensolver ran out of iterations or expansion
directions, and 1 on any other failure, including rejected solver parameters.
"#
)]
struct Cli {
    /// Container file holding the matrix
    input_path: PathBuf,

    /// Name of the dataset inside the container
    dataset_name: String,

    /// Number of matrix rows to use
    numrows: usize,

    /// Number of matrix columns
    numcols: usize,

    /// Number of singular triples to compute
    numeigs: usize,

    /// Number of cooperating processes
    #[arg(short = 'p', long, env = "DPCA_PROCESSES", default_value = "1")]
    processes: usize,

    /// Eigensolver restart budget
    #[arg(long, default_value = "30")]
    max_iterations: usize,

    /// Relative residual tolerance (<= 0 means machine precision)
    #[arg(long, default_value = "1e-13")]
    tolerance: f64,

    /// Krylov basis size (defaults to 2 * numeigs, capped at numcols)
    #[arg(long)]
    subspace_size: Option<usize>,

    /// Seed for the starting vector
    #[arg(long, default_value = "2025")]
    seed: u64,

    /// Fail instead of truncating when the dataset is larger than numrows x numcols
    #[arg(long)]
    strict_rows: bool,

    /// Print the low-rank approximation A·V·Vᵗ
    #[arg(long)]
    print_approximation: bool,

    /// Print the left and right singular vectors
    #[arg(long)]
    print_factors: bool,

    /// Write the results to this file (bincode)
    #[arg(long)]
    save_results: Option<PathBuf>,

    /// Set log level
    #[arg(long, value_enum, env = "DPCA_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl Cli {
    fn job_config(&self) -> JobConfig {
        JobConfig {
            eigensolver: EigensolverConfig {
                max_iterations: self.max_iterations,
                tolerance: self.tolerance,
                subspace_size: self.subspace_size,
                random_seed: self.seed,
                start_vector: None,
            },
            row_policy: if self.strict_rows { RowCountPolicy::Strict } else { RowCountPolicy::Truncate },
            low_rank_approximation: self.print_approximation,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .filter_level(cli.log_level.into())
        .init();

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        let code = match e.downcast_ref::<DistSvdError>() {
            Some(DistSvdError::NotConverged { .. }) => EXIT_NOT_CONVERGED,
            _ => EXIT_FAILURE,
        };
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    info!("distributed-pca v{} starting", env!("CARGO_PKG_VERSION"));

    #[cfg(feature = "mpi")]
    if let Some(comm) = MpiComm::initialize() {
        if comm.size() > 1 {
            return run_mpi(cli, comm);
        }
    }

    let shape = GlobalMatrixShape::new(cli.numrows, cli.numcols, cli.numeigs);
    shape.validate(cli.processes)?;
    let dataset = open_dataset(cli)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_partition_table(&mut out, &partition_rows(shape.numrows, cli.processes))?;

    let outcome = run_distributed(&dataset, shape, cli.processes, &cli.job_config());
    report_outcome(&mut out, cli, outcome)
}

fn open_dataset(cli: &Cli) -> Result<DatasetFile> {
    DatasetFile::open(&cli.input_path, &cli.dataset_name)
        .with_context(|| format!("failed to open dataset {:?} in {:?}", cli.dataset_name, cli.input_path))
}

/// Prints the root's results, or the solver diagnostics when the eigensolver stopped
/// short of convergence.
fn report_outcome<W: Write>(out: &mut W, cli: &Cli, outcome: Result<ResultSet, DistSvdError>) -> Result<()> {
    let results = match outcome {
        Ok(results) => results,
        Err(e) => {
            if let DistSvdError::NotConverged { status, iterations, converged, requested, operator_applications } = e {
                let diagnostics = ConvergenceDiagnostics { iterations, converged, operator_applications, status };
                write_diagnostics(out, &diagnostics, requested)?;
                writeln!(out, "No results: the eigensolver did not converge")?;
                out.flush()?;
            }
            return Err(e.into());
        }
    };

    write_results(out, &results, cli.print_factors)?;
    out.flush()?;

    if let Some(path) = &cli.save_results {
        results
            .save(path)
            .with_context(|| format!("failed to save results to {:?}", path))?;
        info!("Saved results to {:?}", path);
    }
    Ok(())
}

/// One rank of a job launched with `mpirun`. Errors every rank reaches together are
/// returned; anything else aborts the whole MPI job so no peer waits in a collective.
#[cfg(feature = "mpi")]
fn run_mpi(cli: &Cli, mut comm: MpiComm) -> Result<()> {
    let processes = comm.size();
    if cli.processes != 1 && cli.processes != processes {
        warn!("Ignoring --processes {}: the job runs on the {} MPI processes", cli.processes, processes);
    }
    let outcome = run_mpi_rank(cli, &mut comm, processes);
    if let Err(e) = &outcome {
        let collective = e.downcast_ref::<DistSvdError>().is_some_and(DistSvdError::is_collective_outcome);
        if !collective {
            error!("{:#}", e);
            comm.abort();
        }
    }
    outcome
}

#[cfg(feature = "mpi")]
fn run_mpi_rank(cli: &Cli, comm: &mut MpiComm, processes: usize) -> Result<()> {
    let shape = GlobalMatrixShape::new(cli.numrows, cli.numcols, cli.numeigs);
    shape.validate(processes)?;
    let dataset = open_dataset(cli)?;
    let ctx = JobContext::new(shape, processes, comm.rank(), cli.job_config())?;

    let is_root = comm.is_root();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if is_root {
        write_partition_table(&mut out, &partition_rows(shape.numrows, processes))?;
        out.flush()?;
    }

    match run_rank(comm, &dataset, &ctx) {
        Ok(Some(results)) => report_outcome(&mut out, cli, Ok(results)),
        Ok(None) => Ok(()),
        Err(e) if is_root => report_outcome(&mut out, cli, Err(e)),
        Err(e) => Err(e.into()),
    }
}
