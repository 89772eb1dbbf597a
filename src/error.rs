use crate::comm::CommError;
use crate::driver::DriverError;
use crate::lanczos::SolverStatus;
use crate::ThreadSafeStdError;
use thiserror::Error;

/// Errors surfaced at the job boundary.
///
/// Solver non-convergence is its own variant so callers can tell "did not converge"
/// apart from a solver that rejected its parameters or broke down.
#[derive(Debug, Error)]
pub enum DistSvdError {
    #[error("invalid matrix shape: {0}")]
    InvalidShape(String),

    #[error("failed to load rows {start}..{end}: {source}")]
    Load {
        start: usize,
        end: usize,
        #[source]
        source: ThreadSafeStdError,
    },

    #[error("vector of length {found} passed to an operator of dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Protocol(#[from] DriverError),

    #[error(
        "eigensolver did not converge: {status} after {iterations} iterations ({converged} of {requested} eigenpairs converged)"
    )]
    NotConverged {
        status: SolverStatus,
        iterations: usize,
        converged: usize,
        requested: usize,
        operator_applications: usize,
    },

    #[error("eigensolver failed: {status} after {iterations} iterations")]
    SolverFailed { status: SolverStatus, iterations: usize },

    #[error("eigenpair extraction refused: solver status is {0}")]
    Extraction(SolverStatus),

    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: ThreadSafeStdError,
    },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("the root rank finished without producing a result")]
    MissingResult,

    #[error("failed to persist results: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DistSvdError {
    /// True when this error was only induced by another rank aborting the group.
    pub fn is_induced_abort(&self) -> bool {
        matches!(self, DistSvdError::Comm(CommError::Aborted { .. }))
    }

    /// True for errors every rank reaches together from the broadcast solver outcome.
    pub fn is_collective_outcome(&self) -> bool {
        matches!(self, DistSvdError::NotConverged { .. } | DistSvdError::SolverFailed { .. })
    }
}
