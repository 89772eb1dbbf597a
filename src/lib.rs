// Distributed truncated singular value decomposition

#![doc = include_str!("../README.md")]

use std::error::Error;

pub mod comm;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod gramian;
pub mod job;
pub mod lanczos;
pub mod linalg_backends;
#[cfg(feature = "mpi")]
pub mod mpi_comm;
pub mod partition;
pub mod reconstruct;
pub mod refine;
pub mod report;
pub mod ritz;
pub mod slab;

/// Error type returned across the dense-backend and data-source boundaries.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

pub use comm::{ChannelComm, CommError, Communicator, Message, ProcessGroup, SingleProcessComm, ROOT_RANK};
pub use dataset::{write_container, DatasetFile};
pub use driver::{DriveReport, DriverError, DriverState};
pub use error::DistSvdError;
pub use gramian::GramianOperator;
pub use job::{run_distributed, run_rank, ConvergenceDiagnostics, JobConfig, JobContext, ResultSet};
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;
pub use lanczos::{EigensolverConfig, ReverseCommSolver, SolverStatus, ThickRestartLanczos};
pub use partition::{partition_rows, GatherPlan, GlobalMatrixShape, Partition};
pub use refine::RefinedSvd;
pub use ritz::EigenPairs;
pub use slab::{InMemoryMatrix, RowCountPolicy, RowSlab, RowSlabSource};
