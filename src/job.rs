// src/job.rs

//! One truncated-SVD job: the per-rank pipeline and the launcher that runs it on every rank.
//!
//! Stages, in order, on every rank:
//! 1. load the rank's row slab,
//! 2. apply the Gramian once to a fixed ramp vector,
//! 3. drive the eigensolver (root) or follow it (other ranks),
//! 4. broadcast the eigenvectors and gather `A·V` on the root,
//! 5. refine `A·V` with a dense SVD on the root.

use crate::comm::{Communicator, ProcessGroup, SingleProcessComm, ROOT_RANK};
use crate::driver::{drive_root, drive_worker, sanity_product, DriveReport};
use crate::error::DistSvdError;
use crate::gramian::GramianOperator;
use crate::lanczos::{EigensolverConfig, SolverStatus, ThickRestartLanczos};
use crate::partition::{partition_rows, GatherPlan, GlobalMatrixShape, Partition};
use crate::reconstruct::{distribute_eigenvectors, reconstruct};
use crate::refine::refine_svd;
use crate::ritz::extract_eigenpairs;
use crate::slab::{RowCountPolicy, RowSlab, RowSlabSource};
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

/// Job-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub eigensolver: EigensolverConfig,
    pub row_policy: RowCountPolicy,
    /// Also form the rank-`numeigs` approximation `A·V·Vᵗ` on the root.
    pub low_rank_approximation: bool,
}

/// Everything a rank needs to know about the job, built once and passed to each stage.
#[derive(Debug, Clone)]
pub struct JobContext {
    shape: GlobalMatrixShape,
    num_processes: usize,
    rank: usize,
    partitions: Vec<Partition>,
    config: JobConfig,
}

impl JobContext {
    pub fn new(
        shape: GlobalMatrixShape,
        num_processes: usize,
        rank: usize,
        config: JobConfig,
    ) -> Result<Self, DistSvdError> {
        shape.validate(num_processes)?;
        if rank >= num_processes {
            return Err(DistSvdError::InvalidShape(format!(
                "rank {} is outside a group of {} processes",
                rank, num_processes
            )));
        }
        let partitions = partition_rows(shape.numrows, num_processes);
        if let Some(empty) = partitions.iter().find(|p| p.is_empty()) {
            return Err(DistSvdError::InvalidShape(format!("rank {} would own no rows", empty.rank)));
        }
        Ok(Self { shape, num_processes, rank, partitions, config })
    }

    pub fn shape(&self) -> GlobalMatrixShape {
        self.shape
    }

    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn partition(&self) -> Partition {
        self.partitions[self.rank]
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// The root's plan for gathering `A·V`; `None` on every other rank.
    pub fn gather_plan(&self) -> Option<GatherPlan> {
        (self.rank == ROOT_RANK).then(|| GatherPlan::from_partitions(&self.partitions, self.shape.numeigs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceDiagnostics {
    pub iterations: usize,
    pub converged: usize,
    pub operator_applications: usize,
    pub status: SolverStatus,
}

impl From<DriveReport> for ConvergenceDiagnostics {
    fn from(report: DriveReport) -> Self {
        Self {
            iterations: report.iterations,
            converged: report.converged,
            operator_applications: report.operator_applications,
            status: report.status,
        }
    }
}

/// Final factors of a converged job. Only the root produces one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Descending singular values of `A` from the refined SVD.
    pub singular_values: Array1<f64>,
    /// Gramian eigenvalues, descending.
    pub eigenvalues: Array1<f64>,
    /// `numcols x numeigs` Ritz vectors `V`.
    pub eigenvectors: Array2<f64>,
    /// `numcols x numeigs`, the composition `V · W`.
    pub right_singular_vectors: Array2<f64>,
    /// `numrows x numeigs`.
    pub left_singular_vectors: Array2<f64>,
    /// `numeigs x numeigs` right factor `W` of the refinement SVD of `A·V`.
    pub refined_right_factor: Array2<f64>,
    /// `numrows x numcols`, present when requested in [`JobConfig`].
    pub low_rank_approximation: Option<Array2<f64>>,
    pub diagnostics: ConvergenceDiagnostics,
}

impl ResultSet {
    /// Saves the results to a file using bincode.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DistSvdError> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| DistSvdError::Persistence(format!("Failed to serialize results: {}", e)))?;
        Ok(())
    }

    /// Loads results previously written by [`ResultSet::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DistSvdError> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let results: ResultSet = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| DistSvdError::Persistence(format!("Failed to deserialize results: {}", e)))?;
        let k = results.singular_values.len();
        if results.right_singular_vectors.ncols() != k || results.left_singular_vectors.ncols() != k {
            return Err(DistSvdError::Persistence(format!(
                "Loaded results are inconsistent: {} singular values, {} right and {} left vectors",
                k,
                results.right_singular_vectors.ncols(),
                results.left_singular_vectors.ncols()
            )));
        }
        Ok(results)
    }
}

/// Runs the whole pipeline on one rank. Collective: every rank of `comm` must call it with
/// a context built for its own rank. The root returns `Some(results)`, other ranks `None`.
pub fn run_rank<C, S>(comm: &mut C, source: &S, ctx: &JobContext) -> Result<Option<ResultSet>, DistSvdError>
where
    C: Communicator + ?Sized,
    S: RowSlabSource + ?Sized,
{
    let shape = ctx.shape();
    let config = ctx.config();
    let rank = comm.rank();

    let truncated = config.row_policy.reconcile(source.shape(), &shape)?;
    if truncated && comm.is_root() {
        let (rows, cols) = source.shape();
        warn!(
            "Dataset holds {}x{}; using only its leading {}x{} block",
            rows, cols, shape.numrows, shape.numcols
        );
    }

    let slab = RowSlab::load(source, ctx.partition(), shape.numcols)?;
    info!("Rank {}: loaded my data", rank);
    let mut operator = GramianOperator::new(&slab);
    sanity_product(comm, &mut operator)?;

    let mut solver = comm
        .is_root()
        .then(|| ThickRestartLanczos::new(shape.numcols, shape.numeigs, &config.eigensolver));
    let report = match solver.as_mut() {
        Some(solver) => drive_root(comm, &mut operator, solver)?,
        None => drive_worker(comm, &mut operator)?,
    };
    let diagnostics = ConvergenceDiagnostics::from(report);
    if report.status.is_incomplete() {
        return Err(DistSvdError::NotConverged {
            status: report.status,
            iterations: report.iterations,
            converged: report.converged,
            requested: shape.numeigs,
            operator_applications: report.operator_applications,
        });
    }
    if !report.status.is_success() {
        return Err(DistSvdError::SolverFailed { status: report.status, iterations: report.iterations });
    }

    let eigen = match solver.as_ref() {
        Some(solver) => Some(extract_eigenpairs(solver, shape.numeigs)?),
        None => None,
    };
    let vectors = distribute_eigenvectors(comm, eigen.as_ref().map(|e| &e.vectors))?;
    let plan = ctx.gather_plan();
    let av = reconstruct(comm, &slab, &vectors, plan.as_ref())?;

    let (Some(eigen), Some(av)) = (eigen, av) else {
        debug!("Rank {}: finished", rank);
        return Ok(None);
    };
    let refined = refine_svd(&av)?;
    let low_rank_approximation = config.low_rank_approximation.then(|| av.dot(&eigen.vectors.t()));

    Ok(Some(ResultSet {
        singular_values: refined.singular_values,
        right_singular_vectors: eigen.vectors.dot(&refined.right_singular_vectors),
        left_singular_vectors: refined.left_singular_vectors,
        refined_right_factor: refined.right_singular_vectors,
        eigenvalues: eigen.values,
        eigenvectors: eigen.vectors,
        low_rank_approximation,
        diagnostics,
    }))
}

/// Picks the job outcome from the per-rank outcomes: the root's results, or the first
/// error that did not merely come from another rank aborting.
fn collect_outcome(outcomes: Vec<Result<Option<ResultSet>, DistSvdError>>) -> Result<ResultSet, DistSvdError> {
    let mut results = None;
    let mut origin = None;
    let mut induced = None;
    for outcome in outcomes {
        match outcome {
            Ok(Some(found)) => results = results.or(Some(found)),
            Ok(None) => {}
            Err(e) if e.is_induced_abort() => induced = induced.or(Some(e)),
            Err(e) => origin = origin.or(Some(e)),
        }
    }
    if let Some(e) = origin.or(induced) {
        return Err(e);
    }
    results.ok_or(DistSvdError::MissingResult)
}

/// Runs a job over `num_processes` ranks in this process and returns the root's results.
pub fn run_distributed<S: RowSlabSource + ?Sized>(
    source: &S,
    shape: GlobalMatrixShape,
    num_processes: usize,
    config: &JobConfig,
) -> Result<ResultSet, DistSvdError> {
    shape.validate(num_processes)?;
    let start_time = Instant::now();
    info!(
        "Computing top {} singular triples of a {}x{} matrix on {} processes",
        shape.numeigs, shape.numrows, shape.numcols, num_processes
    );

    let outcomes = if num_processes == 1 {
        let ctx = JobContext::new(shape, 1, ROOT_RANK, config.clone())?;
        vec![run_rank(&mut SingleProcessComm, source, &ctx)]
    } else {
        ProcessGroup::new(num_processes)?.run(|comm| {
            let ctx = JobContext::new(shape, num_processes, comm.rank(), config.clone())?;
            run_rank(comm, source, &ctx)
        })
    };

    let results = collect_outcome(outcomes)?;
    info!("Job finished in {:?}", start_time.elapsed());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommError;
    use crate::slab::InMemoryMatrix;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    fn source() -> InMemoryMatrix {
        InMemoryMatrix::new(array![
            [2.0, 0.0, 1.0],
            [0.0, 3.0, 0.0],
            [1.0, 0.0, 2.0],
            [0.5, 0.5, 0.5],
            [1.0, -1.0, 0.0]
        ])
    }

    #[test]
    fn context_rejects_out_of_group_ranks_and_builds_root_plan() {
        let shape = GlobalMatrixShape::new(5, 3, 2);
        assert!(JobContext::new(shape, 2, 2, JobConfig::default()).is_err());

        let root = JobContext::new(shape, 2, 0, JobConfig::default()).unwrap();
        let plan = root.gather_plan().unwrap();
        assert_eq!(plan.counts, vec![6, 4]);
        assert_eq!(root.partition().localrows, 3);

        let worker = JobContext::new(shape, 2, 1, JobConfig::default()).unwrap();
        assert!(worker.gather_plan().is_none());
        assert_eq!(worker.partition().startingrow, 3);
    }

    #[test]
    fn low_rank_approximation_is_opt_in() {
        let shape = GlobalMatrixShape::new(5, 3, 2);
        let plain = run_distributed(&source(), shape, 2, &JobConfig::default()).unwrap();
        assert!(plain.low_rank_approximation.is_none());

        let config = JobConfig { low_rank_approximation: true, ..Default::default() };
        let with_approx = run_distributed(&source(), shape, 2, &config).unwrap();
        let approx = with_approx.low_rank_approximation.unwrap();
        assert_eq!(approx.dim(), (5, 3));
        let expected = source().view().dot(&with_approx.eigenvectors).dot(&with_approx.eigenvectors.t());
        assert_abs_diff_eq!(approx, expected, epsilon = 1e-10);
    }

    #[test]
    fn originating_error_wins_over_induced_aborts() {
        let outcomes = vec![
            Err(DistSvdError::Comm(CommError::Aborted { rank: 2 })),
            Ok(None),
            Err(DistSvdError::DimensionMismatch { expected: 3, found: 2 }),
        ];
        assert!(matches!(
            collect_outcome(outcomes),
            Err(DistSvdError::DimensionMismatch { expected: 3, found: 2 })
        ));
        assert!(matches!(collect_outcome(vec![Ok(None)]), Err(DistSvdError::MissingResult)));
    }

    #[test]
    fn results_survive_a_save_and_load() {
        let shape = GlobalMatrixShape::new(5, 3, 2);
        let results = run_distributed(&source(), shape, 1, &JobConfig::default()).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.bin");
        results.save(&path).unwrap();
        assert_eq!(ResultSet::load(&path).unwrap(), results);
    }
}
