//! [`Communicator`] over MPI, for jobs launched with `mpirun`.
//!
//! Each MPI process is one rank. Broadcast messages travel as a length followed by their
//! byte framing; the numeric collectives map directly onto `MPI_Allreduce` and
//! `MPI_Gatherv`.

use crate::comm::{CommError, Communicator, Message, ROOT_RANK};
use crate::partition::GatherPlan;
use log::{debug, error};
use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::{Communicator as _, CommunicatorCollectives as _, Root as _};
use mpi::Count;

/// Error code handed to `MPI_Abort`.
const ABORT_CODE: i32 = 1;

pub struct MpiComm {
    // Declared before `universe` so the communicator is released before MPI finalizes.
    world: SimpleCommunicator,
    _universe: Universe,
    rank: usize,
    size: usize,
}

impl MpiComm {
    /// Initializes MPI. Returns `None` when MPI was already initialized in this process.
    pub fn initialize() -> Option<Self> {
        let universe = mpi::initialize()?;
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        debug!("MPI rank {} of {} initialized", rank, size);
        Some(Self { world, _universe: universe, rank, size })
    }
}

fn to_count(count: usize) -> Result<Count, CommError> {
    Count::try_from(count).map_err(|_| CommError::CountOverflow { count })
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&mut self, message: Option<Message>) -> Result<Message, CommError> {
        let root = self.world.process_at_rank(ROOT_RANK as i32);
        if self.rank == ROOT_RANK {
            let message = message.ok_or(CommError::MissingRootMessage)?;
            let mut bytes = message.to_bytes()?;
            let mut len = bytes.len() as u64;
            root.broadcast_into(&mut len);
            root.broadcast_into(&mut bytes[..]);
            return Ok(message);
        }
        let mut len = 0u64;
        root.broadcast_into(&mut len);
        let mut bytes = vec![0u8; len as usize];
        root.broadcast_into(&mut bytes[..]);
        Message::from_bytes(&bytes)
    }

    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<(), CommError> {
        let local = values.to_vec();
        self.world.all_reduce_into(&local[..], values, SystemOperation::sum());
        Ok(())
    }

    fn gather_varcount(
        &mut self,
        local: &[f64],
        plan: Option<&GatherPlan>,
    ) -> Result<Option<Vec<f64>>, CommError> {
        let root = self.world.process_at_rank(ROOT_RANK as i32);
        if self.rank != ROOT_RANK {
            root.gather_varcount_into(local);
            return Ok(None);
        }

        let plan = plan.ok_or(CommError::MissingGatherPlan)?;
        if plan.num_ranks() != self.size {
            return Err(CommError::InvalidGatherPlan { ranks: plan.num_ranks(), size: self.size });
        }
        if local.len() != plan.counts[ROOT_RANK] {
            return Err(CommError::LengthMismatch {
                peer: ROOT_RANK,
                expected: plan.counts[ROOT_RANK],
                found: local.len(),
            });
        }
        let counts = plan.counts.iter().map(|&c| to_count(c)).collect::<Result<Vec<_>, _>>()?;
        let offsets = plan.offsets.iter().map(|&o| to_count(o)).collect::<Result<Vec<_>, _>>()?;

        let mut gathered = vec![0.0; plan.total_len()];
        {
            let mut partition = PartitionMut::new(&mut gathered[..], counts, offsets);
            root.gather_varcount_into_root(local, &mut partition);
        }
        Ok(Some(gathered))
    }

    fn abort(&mut self) {
        error!("Rank {} aborting the MPI job", self.rank);
        self.world.abort(ABORT_CODE)
    }
}
