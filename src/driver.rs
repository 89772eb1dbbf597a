//! Drives a reverse-communication eigensolver across the process group.
//!
//! Only the root holds the solver. On every operator request it broadcasts a
//! [`Message::ContinueSignal`] and then the [`Message::OperatorRequest`] vector, so that
//! every rank enters the same Gramian all-reduce. When the solver is done the root
//! broadcasts a final stop signal followed by the [`Message::SolverOutcome`], which
//! leaves every rank with the same status.

use crate::comm::{Communicator, Message};
use crate::error::DistSvdError;
use crate::gramian::GramianOperator;
use crate::lanczos::{
    ReverseCommSolver, ReverseCommStep, SolverStatus, IDO_APPLY_OPERATOR, IDO_DONE, IDO_FIRST_REQUEST,
};
use log::{debug, info};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("solver issued unsupported request code ido={ido}")]
    UnsupportedRequest { ido: i32 },

    #[error("solver issued request ido={ido} after it had already finished")]
    AlreadyDone { ido: i32 },

    #[error("solver pointer {offset} addresses a {len}-long vector outside its {workd_len}-long workspace")]
    PointerOutOfRange { offset: usize, len: usize, workd_len: usize },

    #[error("rank {rank} expected a {expected} message but received {found}")]
    UnexpectedMessage { rank: usize, expected: &'static str, found: &'static str },
}

/// Where the driver stands in the reverse-communication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    /// Apply the operator to `workd[input..input + n]` and store it at `workd[output..output + n]`.
    OpRequest { input: usize, output: usize },
    Done,
}

impl DriverState {
    /// Next state after the solver returns `step`.
    pub fn transition(self, step: ReverseCommStep) -> Result<DriverState, DriverError> {
        match (self, step.ido) {
            (DriverState::Done, ido) => Err(DriverError::AlreadyDone { ido }),
            (_, IDO_FIRST_REQUEST) | (_, IDO_APPLY_OPERATOR) => {
                Ok(DriverState::OpRequest { input: step.ipntr[0], output: step.ipntr[1] })
            }
            (_, IDO_DONE) => Ok(DriverState::Done),
            (_, ido) => Err(DriverError::UnsupportedRequest { ido }),
        }
    }
}

/// What every rank knows once the loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveReport {
    pub status: SolverStatus,
    pub iterations: usize,
    pub converged: usize,
    /// Gramian applications performed by the loop.
    pub operator_applications: usize,
}

fn unexpected(rank: usize, expected: &'static str, found: &Message) -> DistSvdError {
    DriverError::UnexpectedMessage { rank, expected, found: found.name() }.into()
}

fn check_pointer(offset: usize, len: usize, workd_len: usize) -> Result<(), DriverError> {
    if offset + len > workd_len {
        return Err(DriverError::PointerOutOfRange { offset, len, workd_len });
    }
    Ok(())
}

/// Applies the operator once to `[1, 2, ..., n]`. Collective; the root logs the product.
pub fn sanity_product<C: Communicator + ?Sized>(
    comm: &mut C,
    operator: &mut GramianOperator<'_>,
) -> Result<Vec<f64>, DistSvdError> {
    let ramp: Vec<f64> = (1..=operator.dimension()).map(|i| i as f64).collect();
    let product = operator.apply_to(comm, &ramp)?;
    if comm.is_root() {
        debug!("Gramian applied to [1..{}]: {:?}", ramp.len(), product);
    }
    Ok(product)
}

/// Root side of the loop. Steps `solver` until it is done, serving each operator request
/// collectively.
pub fn drive_root<C, S>(
    comm: &mut C,
    operator: &mut GramianOperator<'_>,
    solver: &mut S,
) -> Result<DriveReport, DistSvdError>
where
    C: Communicator + ?Sized,
    S: ReverseCommSolver + ?Sized,
{
    let n = operator.dimension();
    if solver.dimension() != n {
        return Err(DistSvdError::DimensionMismatch { expected: n, found: solver.dimension() });
    }
    let start_time = Instant::now();
    let mut product = vec![0.0; n];
    let mut applications = 0;
    let mut state = DriverState::Init;

    loop {
        state = state.transition(solver.step())?;
        let (input, output) = match state {
            DriverState::OpRequest { input, output } => (input, output),
            DriverState::Init | DriverState::Done => break,
        };
        let workd_len = solver.workd().len();
        check_pointer(input, n, workd_len)?;
        check_pointer(output, n, workd_len)?;

        comm.broadcast(Some(Message::ContinueSignal { proceed: true }))?;
        let request = Message::OperatorRequest { vector: solver.workd()[input..input + n].to_vec() };
        let vector = match comm.broadcast(Some(request))? {
            Message::OperatorRequest { vector } => vector,
            other => return Err(unexpected(comm.rank(), "OperatorRequest", &other)),
        };
        operator.apply(comm, &vector, &mut product)?;
        solver.workd_mut()[output..output + n].copy_from_slice(&product);
        applications += 1;
    }

    comm.broadcast(Some(Message::ContinueSignal { proceed: false }))?;
    let report = DriveReport {
        status: solver.status(),
        iterations: solver.iterations(),
        converged: solver.converged(),
        operator_applications: applications,
    };
    comm.broadcast(Some(Message::SolverOutcome {
        info: report.status.code(),
        iterations: report.iterations,
        converged: report.converged,
    }))?;
    info!(
        "Eigensolver loop finished in {:?}: {}, {} iterations, {} Gramian applications",
        start_time.elapsed(),
        report.status,
        report.iterations,
        report.operator_applications
    );
    Ok(report)
}

/// Non-root side of the loop. Follows the root's signals until the outcome arrives.
pub fn drive_worker<C: Communicator + ?Sized>(
    comm: &mut C,
    operator: &mut GramianOperator<'_>,
) -> Result<DriveReport, DistSvdError> {
    let rank = comm.rank();
    let mut product = vec![0.0; operator.dimension()];
    let mut applications = 0;

    loop {
        match comm.broadcast(None)? {
            Message::ContinueSignal { proceed: true } => {}
            Message::ContinueSignal { proceed: false } => break,
            other => return Err(unexpected(rank, "ContinueSignal", &other)),
        }
        let vector = match comm.broadcast(None)? {
            Message::OperatorRequest { vector } => vector,
            other => return Err(unexpected(rank, "OperatorRequest", &other)),
        };
        operator.apply(comm, &vector, &mut product)?;
        applications += 1;
    }

    match comm.broadcast(None)? {
        Message::SolverOutcome { info, iterations, converged } => {
            debug!("Rank {}: solver outcome info={} after {} applications", rank, info, applications);
            Ok(DriveReport {
                status: SolverStatus::from_info(info),
                iterations,
                converged,
                operator_applications: applications,
            })
        }
        other => Err(unexpected(rank, "SolverOutcome", &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{CommError, ProcessGroup, SingleProcessComm};
    use crate::lanczos::RitzPairs;
    use crate::partition::partition_rows;
    use crate::slab::{InMemoryMatrix, RowSlab};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array2};

    /// Requests a fixed number of products, then finishes with a preset `info`.
    struct ScriptedSolver {
        n: usize,
        remaining: usize,
        final_info: i32,
        ido_override: Option<i32>,
        ipntr: [usize; 2],
        workd: Vec<f64>,
        started: bool,
        inputs: Vec<Vec<f64>>,
        products: Vec<Vec<f64>>,
        info: i32,
    }

    impl ScriptedSolver {
        fn new(n: usize, requests: usize, final_info: i32) -> Self {
            Self {
                n,
                remaining: requests,
                final_info,
                ido_override: None,
                ipntr: [n, 0],
                workd: vec![0.0; 2 * n],
                started: false,
                inputs: Vec::new(),
                products: Vec::new(),
                info: 0,
            }
        }
    }

    impl ReverseCommSolver for ScriptedSolver {
        fn dimension(&self) -> usize {
            self.n
        }

        fn requested(&self) -> usize {
            1
        }

        fn step(&mut self) -> ReverseCommStep {
            let n = self.n;
            if self.started {
                let [_, output] = self.ipntr;
                self.products.push(self.workd[output..output + n].to_vec());
            }
            let first = !self.started;
            self.started = true;
            if self.remaining == 0 {
                self.info = self.final_info;
                return ReverseCommStep { ido: IDO_DONE, ipntr: [0, 0] };
            }
            self.remaining -= 1;
            let input: Vec<f64> = (0..n).map(|j| (self.inputs.len() + j + 1) as f64).collect();
            let [start, _] = self.ipntr;
            if start + n <= self.workd.len() {
                self.workd[start..start + n].copy_from_slice(&input);
            }
            self.inputs.push(input);
            let ido = self.ido_override.unwrap_or(if first { IDO_FIRST_REQUEST } else { IDO_APPLY_OPERATOR });
            ReverseCommStep { ido, ipntr: self.ipntr }
        }

        fn workd(&self) -> &[f64] {
            &self.workd
        }

        fn workd_mut(&mut self) -> &mut [f64] {
            &mut self.workd
        }

        fn info(&self) -> i32 {
            self.info
        }

        fn iterations(&self) -> usize {
            self.inputs.len()
        }

        fn converged(&self) -> usize {
            0
        }

        fn operator_applications(&self) -> usize {
            self.products.len()
        }

        fn extract(&self) -> Result<RitzPairs, SolverStatus> {
            Err(self.status())
        }
    }

    fn matrix() -> Array2<f64> {
        array![[1.0, 2.0, 0.0], [0.0, 1.0, -1.0], [3.0, 0.0, 1.0], [1.0, 1.0, 1.0]]
    }

    #[test]
    fn transitions_follow_the_request_codes() {
        let op = ReverseCommStep { ido: IDO_APPLY_OPERATOR, ipntr: [3, 0] };
        let first = ReverseCommStep { ido: IDO_FIRST_REQUEST, ipntr: [0, 3] };
        let done = ReverseCommStep { ido: IDO_DONE, ipntr: [0, 0] };

        assert_eq!(DriverState::Init.transition(first), Ok(DriverState::OpRequest { input: 0, output: 3 }));
        assert_eq!(DriverState::Init.transition(done), Ok(DriverState::Done));
        let requesting = DriverState::OpRequest { input: 0, output: 3 };
        assert_eq!(requesting.transition(op), Ok(DriverState::OpRequest { input: 3, output: 0 }));
        assert_eq!(requesting.transition(done), Ok(DriverState::Done));
        assert_eq!(DriverState::Done.transition(op), Err(DriverError::AlreadyDone { ido: 1 }));
        assert_eq!(
            requesting.transition(ReverseCommStep { ido: 2, ipntr: [0, 0] }),
            Err(DriverError::UnsupportedRequest { ido: 2 })
        );
    }

    #[test]
    fn scripted_solver_receives_gramian_products() {
        let a = matrix();
        let slab = RowSlab::from_array(partition_rows(4, 1)[0], 3, a.clone()).unwrap();
        let mut operator = GramianOperator::new(&slab);
        let mut solver = ScriptedSolver::new(3, 4, 0);

        let report = drive_root(&mut SingleProcessComm, &mut operator, &mut solver).unwrap();
        assert_eq!(report.status, SolverStatus::Converged);
        assert_eq!(report.operator_applications, 4);
        assert_eq!(solver.products.len(), 4);
        for (input, product) in solver.inputs.iter().zip(&solver.products) {
            let expected = a.t().dot(&a.dot(&Array1::from(input.clone())));
            assert_abs_diff_eq!(Array1::from(product.clone()), expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn every_rank_follows_the_root_and_sees_its_status() {
        let source = InMemoryMatrix::new(matrix());
        let partitions = partition_rows(4, 3);
        let group = ProcessGroup::new(3).unwrap();
        let outcomes = group.run(|comm| -> Result<DriveReport, DistSvdError> {
            let slab = RowSlab::load(&source, partitions[comm.rank()], 3)?;
            let mut operator = GramianOperator::new(&slab);
            sanity_product(comm, &mut operator)?;
            if comm.is_root() {
                let mut solver = ScriptedSolver::new(3, 5, 1);
                drive_root(comm, &mut operator, &mut solver)
            } else {
                drive_worker(comm, &mut operator)
            }
        });
        for outcome in outcomes {
            let report = outcome.unwrap();
            assert_eq!(report.status, SolverStatus::MaxIterations);
            assert_eq!(report.iterations, 5);
            assert_eq!(report.operator_applications, 5);
        }
    }

    #[test]
    fn unsupported_request_aborts_the_group() {
        let source = InMemoryMatrix::new(matrix());
        let partitions = partition_rows(4, 2);
        let group = ProcessGroup::new(2).unwrap();
        let outcomes = group.run(|comm| -> Result<DriveReport, DistSvdError> {
            let slab = RowSlab::load(&source, partitions[comm.rank()], 3)?;
            let mut operator = GramianOperator::new(&slab);
            if comm.is_root() {
                let mut solver = ScriptedSolver::new(3, 2, 0);
                solver.ido_override = Some(2);
                drive_root(comm, &mut operator, &mut solver)
            } else {
                drive_worker(comm, &mut operator)
            }
        });
        assert!(matches!(
            outcomes[0],
            Err(DistSvdError::Protocol(DriverError::UnsupportedRequest { ido: 2 }))
        ));
        assert!(matches!(outcomes[1], Err(DistSvdError::Comm(CommError::Aborted { rank: 0 }))));
    }

    #[test]
    fn out_of_range_pointer_is_rejected() {
        let slab = RowSlab::from_array(partition_rows(4, 1)[0], 3, matrix()).unwrap();
        let mut operator = GramianOperator::new(&slab);
        let mut solver = ScriptedSolver::new(3, 1, 0);
        solver.ipntr = [0, 5];
        let err = drive_root(&mut SingleProcessComm, &mut operator, &mut solver).unwrap_err();
        assert!(matches!(
            err,
            DistSvdError::Protocol(DriverError::PointerOutOfRange { offset: 5, len: 3, workd_len: 6 })
        ));
    }

    #[test]
    fn worker_rejects_out_of_order_messages() {
        let slab = RowSlab::from_array(partition_rows(4, 1)[0], 3, matrix()).unwrap();
        let group = ProcessGroup::new(2).unwrap();
        let outcomes = group.run(|comm| -> Result<(), DistSvdError> {
            if comm.is_root() {
                comm.broadcast(Some(Message::SolverOutcome { info: 0, iterations: 0, converged: 0 }))?;
                Ok(())
            } else {
                drive_worker(comm, &mut GramianOperator::new(&slab)).map(|_| ())
            }
        });
        assert!(outcomes[0].is_ok());
        assert!(matches!(
            outcomes[1],
            Err(DistSvdError::Protocol(DriverError::UnexpectedMessage {
                rank: 1,
                expected: "ContinueSignal",
                found: "SolverOutcome"
            }))
        ));
    }
}
