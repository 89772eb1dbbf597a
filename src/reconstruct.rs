//! Distributed reconstruction of `A·V`.

use crate::comm::{Communicator, Message};
use crate::driver::DriverError;
use crate::error::DistSvdError;
use crate::partition::GatherPlan;
use crate::slab::RowSlab;
use log::info;
use ndarray::Array2;
use std::time::Instant;

/// Broadcasts the root's eigenvectors so that every rank can project its slab.
/// The root passes `Some`; the others pass `None`.
pub fn distribute_eigenvectors<C: Communicator + ?Sized>(
    comm: &mut C,
    vectors: Option<&Array2<f64>>,
) -> Result<Array2<f64>, DistSvdError> {
    let message = vectors.map(|v| Message::EigenvectorBlock {
        rows: v.nrows(),
        cols: v.ncols(),
        values: v.iter().copied().collect(),
    });
    match comm.broadcast(message)? {
        Message::EigenvectorBlock { rows, cols, values } => Ok(Array2::from_shape_vec((rows, cols), values)?),
        other => Err(DriverError::UnexpectedMessage {
            rank: comm.rank(),
            expected: "EigenvectorBlock",
            found: other.name(),
        }
        .into()),
    }
}

/// Computes `A·V` collectively. Each rank multiplies its own slab by `v`; the root
/// gathers the blocks in global row order using `plan` and gets `Some(numrows x numeigs)`.
pub fn reconstruct<C: Communicator + ?Sized>(
    comm: &mut C,
    slab: &RowSlab,
    v: &Array2<f64>,
    plan: Option<&GatherPlan>,
) -> Result<Option<Array2<f64>>, DistSvdError> {
    if v.nrows() != slab.numcols() {
        return Err(DistSvdError::DimensionMismatch { expected: slab.numcols(), found: v.nrows() });
    }
    let start_time = Instant::now();
    let numeigs = v.ncols();
    let local = slab.data().dot(v);
    let flat: Vec<f64> = local.iter().copied().collect();

    match comm.gather_varcount(&flat, plan)? {
        None => Ok(None),
        Some(buffer) => {
            let numrows = buffer.len() / numeigs.max(1);
            let av = Array2::from_shape_vec((numrows, numeigs), buffer)?;
            info!("Reconstructed A·V ({} x {}) in {:?}", numrows, numeigs, start_time.elapsed());
            Ok(Some(av))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ProcessGroup, SingleProcessComm};
    use crate::partition::partition_rows;
    use crate::slab::InMemoryMatrix;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn a() -> Array2<f64> {
        Array2::from_shape_fn((7, 3), |(i, j)| (i as f64 + 1.0) * if j == 1 { -1.0 } else { 0.5 * j as f64 + 1.0 })
    }

    fn v() -> Array2<f64> {
        array![[0.6, 0.0], [0.0, 1.0], [0.8, 0.0]]
    }

    #[test]
    fn single_process_reconstruction_is_a_times_v() {
        let partitions = partition_rows(7, 1);
        let slab = RowSlab::from_array(partitions[0], 3, a()).unwrap();
        let plan = GatherPlan::from_partitions(&partitions, 2);
        let av = reconstruct(&mut SingleProcessComm, &slab, &v(), Some(&plan)).unwrap().unwrap();
        assert_abs_diff_eq!(av, a().dot(&v()), epsilon = 1e-12);
    }

    #[test]
    fn wrong_eigenvector_height_is_rejected() {
        let slab = RowSlab::from_array(partition_rows(7, 1)[0], 3, a()).unwrap();
        let err = reconstruct(&mut SingleProcessComm, &slab, &Array2::zeros((2, 2)), None).unwrap_err();
        assert!(matches!(err, DistSvdError::DimensionMismatch { expected: 3, found: 2 }));
    }

    #[test]
    fn gathered_rows_follow_global_order() {
        let source = InMemoryMatrix::new(a());
        let partitions = partition_rows(7, 3);
        let plan = GatherPlan::from_partitions(&partitions, 2);
        let group = ProcessGroup::new(3).unwrap();
        let outcomes = group.run(|comm| -> Result<Option<Array2<f64>>, DistSvdError> {
            let slab = RowSlab::load(&source, partitions[comm.rank()], 3)?;
            let root_vectors = v();
            let shared = if comm.is_root() { Some(&root_vectors) } else { None };
            let vectors = distribute_eigenvectors(comm, shared)?;
            assert_eq!(vectors, root_vectors);
            let plan = if comm.is_root() { Some(&plan) } else { None };
            reconstruct(comm, &slab, &vectors, plan)
        });
        let mut outcomes = outcomes.into_iter();
        let av = outcomes.next().unwrap().unwrap().unwrap();
        assert_abs_diff_eq!(av, a().dot(&v()), epsilon = 1e-12);
        assert!(outcomes.all(|outcome| matches!(outcome, Ok(None))));
    }
}
