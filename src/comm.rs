//! Collective communication between the processes of one job.
//!
//! Every process calls the same collectives in the same order. Rank 0 is the root of
//! every rooted collective. Each envelope carries its sender and a per-rank sequence
//! number, so a process that diverges from the shared call order is reported as a
//! [`CommError::CollectiveMismatch`] instead of silently pairing with the wrong call.

use crate::partition::GatherPlan;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The coordinating process.
pub const ROOT_RANK: usize = 0;

/// Typed payloads carried by [`Communicator::broadcast`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Whether the eigensolver loop runs another operator application.
    ContinueSignal { proceed: bool },
    /// The Krylov vector every process feeds to the next Gramian application.
    OperatorRequest { vector: Vec<f64> },
    /// Final solver state, broadcast once after the loop ends.
    SolverOutcome { info: i32, iterations: usize, converged: usize },
    /// A dense row-major matrix, used to share the extracted eigenvectors.
    EigenvectorBlock { rows: usize, cols: usize, values: Vec<f64> },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::ContinueSignal { .. } => "ContinueSignal",
            Message::OperatorRequest { .. } => "OperatorRequest",
            Message::SolverOutcome { .. } => "SolverOutcome",
            Message::EigenvectorBlock { .. } => "EigenvectorBlock",
        }
    }

    /// Byte framing for transports that only move raw buffers.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CommError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CommError::Codec(format!("failed to encode {}: {}", self.name(), e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommError> {
        let (message, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CommError::Codec(format!("failed to decode message: {}", e)))?;
        if read != bytes.len() {
            return Err(CommError::Codec(format!(
                "message used {} of {} received bytes",
                read,
                bytes.len()
            )));
        }
        Ok(message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectiveKind {
    Broadcast,
    AllReduceSum,
    GatherVarcount,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommError {
    #[error("rank {rank} aborted the process group")]
    Aborted { rank: usize },

    #[error("rank {peer} disconnected during collective #{sequence}")]
    Disconnected { peer: usize, sequence: u64 },

    #[error(
        "collective #{sequence} diverged on rank {rank}: expected {expected:?}, rank {peer} sent {found:?}"
    )]
    CollectiveMismatch {
        rank: usize,
        peer: usize,
        sequence: u64,
        expected: CollectiveKind,
        found: CollectiveKind,
    },

    #[error("rank {peer} contributed {found} elements where {expected} were expected")]
    LengthMismatch { peer: usize, expected: usize, found: usize },

    #[error("the root rank must supply the message it broadcasts")]
    MissingRootMessage,

    #[error("the root rank needs a gather plan to gather variable-sized blocks")]
    MissingGatherPlan,

    #[error("gather plan describes {ranks} ranks but the group has {size}")]
    InvalidGatherPlan { ranks: usize, size: usize },

    #[error("a process group needs at least one process")]
    EmptyGroup,

    #[error("rank {rank} panicked")]
    RankPanicked { rank: usize },

    #[error("{0}")]
    Codec(String),

    #[error("block of {count} elements exceeds the transport's element count limit")]
    CountOverflow { count: usize },
}

/// Blocking collectives over a fixed group of processes.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == ROOT_RANK
    }

    /// One-to-all. The root passes `Some(message)`; every rank gets the root's message back.
    fn broadcast(&mut self, message: Option<Message>) -> Result<Message, CommError>;

    /// Element-wise sum across all ranks, leaving the identical result on every rank.
    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<(), CommError>;

    /// All-to-root gather of variable-sized blocks. The root places each rank's block at
    /// the offset given by `plan` and receives the full buffer; other ranks receive `None`.
    fn gather_varcount(
        &mut self,
        local: &[f64],
        plan: Option<&GatherPlan>,
    ) -> Result<Option<Vec<f64>>, CommError>;

    /// Tears the group down after an unrecoverable local failure.
    fn abort(&mut self);
}

fn place_block(
    gathered: &mut [f64],
    plan: &GatherPlan,
    source: usize,
    block: &[f64],
) -> Result<(), CommError> {
    let expected = plan.counts[source];
    if block.len() != expected {
        return Err(CommError::LengthMismatch { peer: source, expected, found: block.len() });
    }
    let offset = plan.offsets[source];
    gathered[offset..offset + expected].copy_from_slice(block);
    Ok(())
}

fn checked_plan(plan: Option<&GatherPlan>, size: usize) -> Result<&GatherPlan, CommError> {
    let plan = plan.ok_or(CommError::MissingGatherPlan)?;
    if plan.num_ranks() != size {
        return Err(CommError::InvalidGatherPlan { ranks: plan.num_ranks(), size });
    }
    Ok(plan)
}

/// The whole job in one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcessComm;

impl Communicator for SingleProcessComm {
    fn rank(&self) -> usize {
        ROOT_RANK
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast(&mut self, message: Option<Message>) -> Result<Message, CommError> {
        message.ok_or(CommError::MissingRootMessage)
    }

    fn all_reduce_sum(&mut self, _values: &mut [f64]) -> Result<(), CommError> {
        Ok(())
    }

    fn gather_varcount(
        &mut self,
        local: &[f64],
        plan: Option<&GatherPlan>,
    ) -> Result<Option<Vec<f64>>, CommError> {
        let plan = checked_plan(plan, 1)?;
        let mut gathered = vec![0.0; plan.total_len()];
        place_block(&mut gathered, plan, ROOT_RANK, local)?;
        Ok(Some(gathered))
    }

    fn abort(&mut self) {}
}

enum Payload {
    Broadcast(Message),
    Contribution(Vec<f64>),
    Reduced(Vec<f64>),
    Block(Vec<f64>),
}

impl Payload {
    fn kind(&self) -> CollectiveKind {
        match self {
            Payload::Broadcast(_) => CollectiveKind::Broadcast,
            Payload::Contribution(_) | Payload::Reduced(_) => CollectiveKind::AllReduceSum,
            Payload::Block(_) => CollectiveKind::GatherVarcount,
        }
    }
}

enum Envelope {
    Collective { source: usize, sequence: u64, payload: Payload },
    Abort { source: usize },
}

/// One rank's endpoint in a [`ProcessGroup`].
pub struct ChannelComm {
    rank: usize,
    size: usize,
    sequence: u64,
    inbox: Receiver<Envelope>,
    /// Senders into every other rank's inbox; `None` at this rank's own index.
    peers: Vec<Option<Sender<Envelope>>>,
    /// Envelopes that arrived before the collective they belong to.
    stash: Vec<(usize, u64, Payload)>,
    aborted_by: Option<usize>,
}

impl ChannelComm {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    fn other_ranks(&self) -> impl Iterator<Item = usize> {
        let rank = self.rank;
        (0..self.size).filter(move |&peer| peer != rank)
    }

    fn send(&mut self, dest: usize, sequence: u64, payload: Payload) -> Result<(), CommError> {
        let envelope = Envelope::Collective { source: self.rank, sequence, payload };
        let delivered = match &self.peers[dest] {
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        };
        if delivered {
            Ok(())
        } else {
            Err(self.disconnected(dest, sequence))
        }
    }

    /// A peer that failed sends its abort before closing its inbox, so a pending abort
    /// explains a closed channel better than the disconnect itself.
    fn disconnected(&mut self, peer: usize, sequence: u64) -> CommError {
        while let Ok(envelope) = self.inbox.try_recv() {
            match envelope {
                Envelope::Abort { source } => {
                    self.aborted_by = Some(source);
                    return CommError::Aborted { rank: source };
                }
                Envelope::Collective { source, sequence: seq, payload } => self.stash.push((source, seq, payload)),
            }
        }
        CommError::Disconnected { peer, sequence }
    }

    fn receive(
        &mut self,
        source: usize,
        sequence: u64,
        expected: CollectiveKind,
    ) -> Result<Payload, CommError> {
        if let Some(rank) = self.aborted_by {
            return Err(CommError::Aborted { rank });
        }
        if let Some(position) = self
            .stash
            .iter()
            .position(|(from, seq, _)| *from == source && *seq == sequence)
        {
            let (_, _, payload) = self.stash.swap_remove(position);
            return self.check_kind(source, sequence, expected, payload);
        }
        loop {
            match self.inbox.recv() {
                Ok(Envelope::Abort { source: aborting }) => {
                    debug!("Rank {}: received abort from rank {}", self.rank, aborting);
                    self.aborted_by = Some(aborting);
                    return Err(CommError::Aborted { rank: aborting });
                }
                Ok(Envelope::Collective { source: from, sequence: seq, payload }) => {
                    if from == source && seq == sequence {
                        return self.check_kind(source, sequence, expected, payload);
                    }
                    trace!(
                        "Rank {}: stashing collective #{} from rank {} while waiting for #{} from rank {}",
                        self.rank, seq, from, sequence, source
                    );
                    self.stash.push((from, seq, payload));
                }
                Err(_) => return Err(CommError::Disconnected { peer: source, sequence }),
            }
        }
    }

    fn check_kind(
        &self,
        peer: usize,
        sequence: u64,
        expected: CollectiveKind,
        payload: Payload,
    ) -> Result<Payload, CommError> {
        if payload.kind() != expected {
            return Err(self.mismatch(peer, sequence, expected, payload.kind()));
        }
        Ok(payload)
    }

    fn mismatch(
        &self,
        peer: usize,
        sequence: u64,
        expected: CollectiveKind,
        found: CollectiveKind,
    ) -> CommError {
        CommError::CollectiveMismatch { rank: self.rank, peer, sequence, expected, found }
    }
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&mut self, message: Option<Message>) -> Result<Message, CommError> {
        let sequence = self.next_sequence();
        if self.is_root() {
            let message = message.ok_or(CommError::MissingRootMessage)?;
            let peers: Vec<usize> = self.other_ranks().collect();
            for peer in peers {
                self.send(peer, sequence, Payload::Broadcast(message.clone()))?;
            }
            return Ok(message);
        }
        match self.receive(ROOT_RANK, sequence, CollectiveKind::Broadcast)? {
            Payload::Broadcast(message) => Ok(message),
            other => Err(self.mismatch(ROOT_RANK, sequence, CollectiveKind::Broadcast, other.kind())),
        }
    }

    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<(), CommError> {
        let sequence = self.next_sequence();
        if self.is_root() {
            // Contributions are summed in rank order so every run reduces identically.
            let peers: Vec<usize> = self.other_ranks().collect();
            for &peer in &peers {
                let contribution = match self.receive(peer, sequence, CollectiveKind::AllReduceSum)? {
                    Payload::Contribution(contribution) => contribution,
                    other => {
                        return Err(self.mismatch(peer, sequence, CollectiveKind::AllReduceSum, other.kind()))
                    }
                };
                if contribution.len() != values.len() {
                    return Err(CommError::LengthMismatch {
                        peer,
                        expected: values.len(),
                        found: contribution.len(),
                    });
                }
                values
                    .par_iter_mut()
                    .zip(contribution.par_iter())
                    .for_each(|(acc, x)| *acc += x);
            }
            for &peer in &peers {
                self.send(peer, sequence, Payload::Reduced(values.to_vec()))?;
            }
            return Ok(());
        }

        self.send(ROOT_RANK, sequence, Payload::Contribution(values.to_vec()))?;
        let reduced = match self.receive(ROOT_RANK, sequence, CollectiveKind::AllReduceSum)? {
            Payload::Reduced(reduced) => reduced,
            other => {
                return Err(self.mismatch(ROOT_RANK, sequence, CollectiveKind::AllReduceSum, other.kind()))
            }
        };
        if reduced.len() != values.len() {
            return Err(CommError::LengthMismatch {
                peer: ROOT_RANK,
                expected: values.len(),
                found: reduced.len(),
            });
        }
        values.copy_from_slice(&reduced);
        Ok(())
    }

    fn gather_varcount(
        &mut self,
        local: &[f64],
        plan: Option<&GatherPlan>,
    ) -> Result<Option<Vec<f64>>, CommError> {
        let sequence = self.next_sequence();
        if !self.is_root() {
            self.send(ROOT_RANK, sequence, Payload::Block(local.to_vec()))?;
            return Ok(None);
        }

        let plan = checked_plan(plan, self.size)?;
        let mut gathered = vec![0.0; plan.total_len()];
        place_block(&mut gathered, plan, self.rank, local)?;
        let peers: Vec<usize> = self.other_ranks().collect();
        for peer in peers {
            match self.receive(peer, sequence, CollectiveKind::GatherVarcount)? {
                Payload::Block(block) => place_block(&mut gathered, plan, peer, &block)?,
                other => {
                    return Err(self.mismatch(peer, sequence, CollectiveKind::GatherVarcount, other.kind()))
                }
            }
        }
        Ok(Some(gathered))
    }

    fn abort(&mut self) {
        debug!("Rank {}: aborting process group", self.rank);
        for sender in self.peers.iter().flatten() {
            // A peer that already exited has nothing left to unblock.
            let _ = sender.send(Envelope::Abort { source: self.rank });
        }
    }
}

impl Drop for ChannelComm {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.abort();
        }
    }
}

/// A fixed set of ranks, each run on its own thread and connected by channels.
#[derive(Debug, Clone, Copy)]
pub struct ProcessGroup {
    size: usize,
}

impl ProcessGroup {
    pub fn new(size: usize) -> Result<Self, CommError> {
        if size == 0 {
            return Err(CommError::EmptyGroup);
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Creates one connected endpoint per rank, in rank order.
    pub fn connect(&self) -> Vec<ChannelComm> {
        let (senders, inboxes): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..self.size).map(|_| unbounded()).unzip();
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelComm {
                rank,
                size: self.size,
                sequence: 0,
                inbox,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(peer, sender)| if peer == rank { None } else { Some(sender.clone()) })
                    .collect(),
                stash: Vec::new(),
                aborted_by: None,
            })
            .collect()
    }

    /// Runs `job` once per rank, concurrently, and returns the per-rank outcomes in rank order.
    ///
    /// A rank whose job fails (or panics) aborts the group, so peers blocked in a
    /// collective fail with [`CommError::Aborted`] instead of hanging.
    pub fn run<T, E, F>(&self, job: F) -> Vec<Result<T, E>>
    where
        F: Fn(&mut ChannelComm) -> Result<T, E> + Sync,
        T: Send,
        E: Send + From<CommError>,
    {
        let endpoints = self.connect();
        let job = &job;
        crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|mut comm| {
                    scope.spawn(move |_| {
                        let outcome = job(&mut comm);
                        if outcome.is_err() {
                            comm.abort();
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(E::from(CommError::RankPanicked { rank })))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_else(|_| {
            (0..self.size)
                .map(|rank| Err(E::from(CommError::RankPanicked { rank })))
                .collect()
        })
    }
}
