//! The process-local row slab and the seam through which it is loaded.

use crate::error::DistSvdError;
use crate::partition::{GlobalMatrixShape, Partition};
use crate::ThreadSafeStdError;
use log::{debug, log_enabled, trace, Level};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::io;

/// Row-addressable storage for the global matrix.
///
/// Every process reads only its own contiguous row range, so implementations must be
/// shareable across ranks and must not assume they see the whole matrix at once.
pub trait RowSlabSource: Sync {
    /// `(rows, cols)` of the stored matrix.
    fn shape(&self) -> (usize, usize);

    /// Reads rows `startingrow..startingrow + rows` restricted to the leading `cols` columns.
    ///
    /// # Returns
    /// An `Array2<f64>` of shape `(rows, cols)`.
    fn read_block(
        &self,
        startingrow: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<f64>, ThreadSafeStdError>;
}

/// What to do when the stored matrix is larger than the requested one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowCountPolicy {
    /// Use the leading `numrows x numcols` block.
    #[default]
    Truncate,
    /// Require the requested shape to match the stored one exactly.
    Strict,
}

impl RowCountPolicy {
    /// Checks a requested shape against the stored `(rows, cols)`. Returns `true` when
    /// only a leading sub-block of the stored matrix will be used.
    pub fn reconcile(
        &self,
        available: (usize, usize),
        requested: &GlobalMatrixShape,
    ) -> Result<bool, DistSvdError> {
        let (rows, cols) = available;
        if requested.numrows > rows || requested.numcols > cols {
            return Err(DistSvdError::InvalidShape(format!(
                "requested a {}x{} matrix but the dataset holds {}x{}",
                requested.numrows, requested.numcols, rows, cols
            )));
        }
        let truncated = requested.numrows < rows || requested.numcols < cols;
        if truncated && *self == RowCountPolicy::Strict {
            return Err(DistSvdError::InvalidShape(format!(
                "requested a {}x{} matrix but the dataset holds {}x{} and the row-count policy is strict",
                requested.numrows, requested.numcols, rows, cols
            )));
        }
        Ok(truncated)
    }
}

/// One process's exclusively owned `localrows x numcols` share of the matrix.
#[derive(Clone, Debug)]
pub struct RowSlab {
    partition: Partition,
    data: Array2<f64>,
}

impl RowSlab {
    pub fn load<S: RowSlabSource + ?Sized>(
        source: &S,
        partition: Partition,
        numcols: usize,
    ) -> Result<Self, DistSvdError> {
        let rows = partition.rows();
        let data = source
            .read_block(partition.startingrow, partition.localrows, numcols)
            .map_err(|source| DistSvdError::Load { start: rows.start, end: rows.end, source })?;
        let slab = Self::from_array(partition, numcols, data)?;

        if log_enabled!(Level::Trace) {
            for (i, row) in slab.data.rows().into_iter().enumerate() {
                for (j, value) in row.iter().enumerate() {
                    trace!("A[{}][{}] = {}", partition.startingrow + i, j, value);
                }
            }
        }
        debug!(
            "Rank {}: loaded rows {}..{} ({} x {})",
            partition.rank, rows.start, rows.end, partition.localrows, numcols
        );
        Ok(slab)
    }

    /// Wraps an already materialized block, checking it against the partition.
    pub fn from_array(partition: Partition, numcols: usize, data: Array2<f64>) -> Result<Self, DistSvdError> {
        if data.dim() != (partition.localrows, numcols) {
            return Err(DistSvdError::InvalidShape(format!(
                "rank {} expected a {}x{} slab, got {}x{}",
                partition.rank,
                partition.localrows,
                numcols,
                data.nrows(),
                data.ncols()
            )));
        }
        Ok(Self { partition, data })
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn localrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn numcols(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }
}

/// A matrix held in memory, readable by row ranges.
#[derive(Clone, Debug)]
pub struct InMemoryMatrix {
    data: Array2<f64>,
}

impl InMemoryMatrix {
    pub fn new(data: Array2<f64>) -> Self {
        Self { data }
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }
}

impl RowSlabSource for InMemoryMatrix {
    fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    fn read_block(
        &self,
        startingrow: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        let (nrows, ncols) = self.data.dim();
        if startingrow + rows > nrows || cols > ncols {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block rows {}..{} x cols 0..{} outside a {}x{} matrix",
                    startingrow,
                    startingrow + rows,
                    cols,
                    nrows,
                    ncols
                ),
            )));
        }
        Ok(self.data.slice(s![startingrow..startingrow + rows, ..cols]).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition_rows;
    use ndarray::array;

    fn source() -> InMemoryMatrix {
        InMemoryMatrix::new(array![
            [1.0, 2.0, 3.0, 9.0],
            [4.0, 5.0, 6.0, 9.0],
            [7.0, 8.0, 9.0, 9.0],
            [10.0, 11.0, 12.0, 9.0],
            [13.0, 14.0, 15.0, 9.0]
        ])
    }

    #[test]
    fn load_reads_own_rows_and_leading_columns() {
        let partitions = partition_rows(5, 2);
        let slab = RowSlab::load(&source(), partitions[1], 3).unwrap();
        assert_eq!(slab.partition(), partitions[1]);
        assert_eq!(slab.data(), array![[10.0, 11.0, 12.0], [13.0, 14.0, 15.0]]);
    }

    #[test]
    fn out_of_range_read_is_a_load_error() {
        let partition = Partition { rank: 0, localrows: 3, startingrow: 4 };
        let err = RowSlab::load(&source(), partition, 3).unwrap_err();
        assert!(matches!(err, DistSvdError::Load { start: 4, end: 7, .. }), "{:?}", err);
    }

    #[test]
    fn from_array_rejects_wrong_block_shape() {
        let partition = Partition { rank: 0, localrows: 2, startingrow: 0 };
        assert!(RowSlab::from_array(partition, 3, Array2::zeros((2, 2))).is_err());
        assert!(RowSlab::from_array(partition, 3, Array2::zeros((2, 3))).is_ok());
    }

    #[test]
    fn row_count_policy_truncates_or_refuses() {
        let requested = GlobalMatrixShape::new(4, 3, 2);
        assert_eq!(RowCountPolicy::Truncate.reconcile((5, 4), &requested).unwrap(), true);
        assert_eq!(RowCountPolicy::Truncate.reconcile((4, 3), &requested).unwrap(), false);
        assert_eq!(RowCountPolicy::Strict.reconcile((4, 3), &requested).unwrap(), false);
        assert!(RowCountPolicy::Strict.reconcile((5, 3), &requested).is_err());
        assert!(RowCountPolicy::Truncate.reconcile((3, 3), &requested).is_err());
        assert!(RowCountPolicy::Truncate.reconcile((4, 2), &requested).is_err());
    }
}
