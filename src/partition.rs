//! Row partitioning of the global matrix across processes.

use crate::error::DistSvdError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Dimensions of the job, fixed for its whole duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMatrixShape {
    pub numrows: usize,
    pub numcols: usize,
    /// Number of eigenpairs (singular triples) requested.
    pub numeigs: usize,
}

impl GlobalMatrixShape {
    pub fn new(numrows: usize, numcols: usize, numeigs: usize) -> Self {
        Self { numrows, numcols, numeigs }
    }

    /// Rejects degenerate shapes before any process loads data.
    pub fn validate(&self, num_processes: usize) -> Result<(), DistSvdError> {
        if self.numrows == 0 || self.numcols == 0 {
            return Err(DistSvdError::InvalidShape(format!(
                "matrix must have at least one row and one column, got {}x{}",
                self.numrows, self.numcols
            )));
        }
        if self.numeigs == 0 || self.numeigs >= self.numcols {
            return Err(DistSvdError::InvalidShape(format!(
                "numeigs must satisfy 0 < numeigs < numcols, got numeigs={} with numcols={}",
                self.numeigs, self.numcols
            )));
        }
        if self.numeigs > self.numrows {
            return Err(DistSvdError::InvalidShape(format!(
                "numeigs ({}) exceeds the rank bound set by numrows ({})",
                self.numeigs, self.numrows
            )));
        }
        if num_processes == 0 {
            return Err(DistSvdError::InvalidShape("process count must be positive".to_string()));
        }
        if self.numrows < num_processes {
            return Err(DistSvdError::InvalidShape(format!(
                "{} rows cannot give each of {} processes a non-empty partition",
                self.numrows, num_processes
            )));
        }
        Ok(())
    }
}

/// One process's contiguous share of rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub rank: usize,
    pub localrows: usize,
    pub startingrow: usize,
}

impl Partition {
    /// Global row indices owned by this partition.
    pub fn rows(&self) -> Range<usize> {
        self.startingrow..self.startingrow + self.localrows
    }

    pub fn is_empty(&self) -> bool {
        self.localrows == 0
    }
}

/// Splits `numrows` rows over `num_processes` ranks.
///
/// With `q = numrows / P` and `r = numrows % P`, ranks `0..r` get `q + 1` rows and the
/// rest get `q`. Shares are contiguous and in rank order, so `startingrow` is the prefix
/// sum of the shares before it. Returns an empty plan for zero processes.
pub fn partition_rows(numrows: usize, num_processes: usize) -> Vec<Partition> {
    if num_processes == 0 {
        return Vec::new();
    }
    let base_share = numrows / num_processes;
    let remainder = numrows % num_processes;

    let mut startingrow = 0;
    (0..num_processes)
        .map(|rank| {
            let localrows = if rank < remainder { base_share + 1 } else { base_share };
            let partition = Partition { rank, localrows, startingrow };
            startingrow += localrows;
            partition
        })
        .collect()
}

/// Per-rank element counts and offsets into the root's gathered `numrows x width` buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatherPlan {
    pub counts: Vec<usize>,
    pub offsets: Vec<usize>,
}

impl GatherPlan {
    /// Builds the plan for gathering row blocks that are `width` elements wide.
    pub fn from_partitions(partitions: &[Partition], width: usize) -> Self {
        let counts = partitions.iter().map(|p| p.localrows * width).collect();
        let offsets = partitions.iter().map(|p| p.startingrow * width).collect();
        Self { counts, offsets }
    }

    pub fn num_ranks(&self) -> usize {
        self.counts.len()
    }

    /// Length of the gathered buffer.
    pub fn total_len(&self) -> usize {
        self.counts
            .iter()
            .zip(&self.offsets)
            .map(|(count, offset)| count + offset)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_cover_rows_exactly_once() {
        for numrows in 0..64 {
            for num_processes in 1..10 {
                let partitions = partition_rows(numrows, num_processes);
                assert_eq!(partitions.len(), num_processes);
                assert_eq!(partitions.iter().map(|p| p.localrows).sum::<usize>(), numrows);

                let mut expected_start = 0;
                for (rank, partition) in partitions.iter().enumerate() {
                    assert_eq!(partition.rank, rank);
                    assert_eq!(partition.startingrow, expected_start, "gap or overlap at rank {}", rank);
                    expected_start += partition.localrows;
                }

                let largest = partitions.iter().map(|p| p.localrows).max().unwrap();
                let smallest = partitions.iter().map(|p| p.localrows).min().unwrap();
                assert!(largest - smallest <= 1, "numrows={} P={}", numrows, num_processes);
            }
        }
    }

    #[test]
    fn remainder_rows_go_to_lowest_ranks() {
        let partitions = partition_rows(10, 4);
        let shares: Vec<usize> = partitions.iter().map(|p| p.localrows).collect();
        assert_eq!(shares, vec![3, 3, 2, 2]);
        assert_eq!(partitions[2].rows(), 6..8);
        assert_eq!(partitions[3].rows(), 8..10);
    }

    #[test]
    fn zero_processes_yield_no_partitions() {
        assert!(partition_rows(5, 0).is_empty());
    }

    #[test]
    fn gather_plan_counts_elements_in_row_order() {
        let partitions = partition_rows(7, 3);
        let plan = GatherPlan::from_partitions(&partitions, 2);
        assert_eq!(plan.counts, vec![6, 4, 4]);
        assert_eq!(plan.offsets, vec![0, 6, 10]);
        assert_eq!(plan.total_len(), 14);
        assert_eq!(plan.num_ranks(), 3);
    }

    #[test]
    fn shape_validation_rejects_degenerate_requests() {
        assert!(GlobalMatrixShape::new(4, 3, 2).validate(4).is_ok());
        assert!(GlobalMatrixShape::new(4, 3, 3).validate(1).is_err());
        assert!(GlobalMatrixShape::new(4, 3, 0).validate(1).is_err());
        assert!(GlobalMatrixShape::new(0, 3, 1).validate(1).is_err());
        assert!(GlobalMatrixShape::new(1, 5, 2).validate(1).is_err());
        assert!(GlobalMatrixShape::new(3, 5, 2).validate(4).is_err());
        assert!(GlobalMatrixShape::new(3, 5, 2).validate(0).is_err());
    }
}
