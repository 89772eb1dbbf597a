//! Ritz extraction: eigenpairs from a finished solver, most significant first.

use crate::error::DistSvdError;
use crate::lanczos::{ReverseCommSolver, RitzPairs};
use ndarray::{Array1, Array2, Axis};

/// Eigenpairs of the Gramian in the layout used downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenPairs {
    /// Eigenvalues in descending order.
    pub values: Array1<f64>,
    /// `numcols x numeigs`; column `i` pairs with `values[i]`.
    pub vectors: Array2<f64>,
}

impl EigenPairs {
    pub fn numeigs(&self) -> usize {
        self.values.len()
    }

    pub fn numcols(&self) -> usize {
        self.vectors.nrows()
    }

    /// `sqrt(λ)` for each eigenvalue, with round-off negatives clamped to zero.
    pub fn singular_values(&self) -> Array1<f64> {
        self.values.mapv(|lambda| lambda.max(0.0).sqrt())
    }
}

/// Reorders the columns of a matrix based on a given slice of indices.
pub fn reorder_columns_owned(matrix: &Array2<f64>, order: &[usize]) -> Array2<f64> {
    if order.is_empty() {
        return Array2::zeros((matrix.nrows(), 0));
    }
    matrix.select(Axis(1), order)
}

pub fn reorder_array_owned(array: &Array1<f64>, order: &[usize]) -> Array1<f64> {
    if order.is_empty() {
        return Array1::zeros(0);
    }
    array.select(Axis(0), order)
}

/// Indices that sort `values` from largest to smallest.
pub fn descending_order(values: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

/// Converts the solver's ascending, one-vector-per-row pairs into [`EigenPairs`].
pub fn to_descending(pairs: &RitzPairs) -> EigenPairs {
    let order = descending_order(&pairs.values);
    let columnar = pairs.vectors.t().as_standard_layout().into_owned();
    EigenPairs {
        values: reorder_array_owned(&pairs.values, &order),
        vectors: reorder_columns_owned(&columnar, &order),
    }
}

/// Runs the solver's companion extraction and checks the result against the job shape.
///
/// Fails with [`DistSvdError::Extraction`] unless the solver converged, so unconverged
/// vectors never leave this function.
pub fn extract_eigenpairs<S: ReverseCommSolver + ?Sized>(
    solver: &S,
    numeigs: usize,
) -> Result<EigenPairs, DistSvdError> {
    let pairs = solver.extract().map_err(DistSvdError::Extraction)?;
    if pairs.values.len() != numeigs {
        return Err(DistSvdError::DimensionMismatch { expected: numeigs, found: pairs.values.len() });
    }
    if pairs.vectors.dim() != (numeigs, solver.dimension()) {
        return Err(DistSvdError::DimensionMismatch {
            expected: solver.dimension(),
            found: pairs.vectors.ncols(),
        });
    }
    Ok(to_descending(&pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lanczos::{EigensolverConfig, SolverStatus, ThickRestartLanczos};
    use ndarray::array;

    #[test]
    fn ascending_rows_become_descending_columns() {
        let pairs = RitzPairs {
            values: array![1.0, 4.0, 9.0],
            vectors: array![[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 0.6, 0.8]],
        };
        let eigen = to_descending(&pairs);
        assert_eq!(eigen.values, array![9.0, 4.0, 1.0]);
        assert_eq!(eigen.vectors.dim(), (4, 3));
        assert_eq!(eigen.vectors.column(0), array![0.0, 0.0, 0.6, 0.8]);
        assert_eq!(eigen.vectors.column(2), array![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(eigen.singular_values(), array![3.0, 2.0, 1.0]);
    }

    #[test]
    fn round_off_negative_eigenvalues_give_zero_singular_values() {
        let eigen = EigenPairs { values: array![4.0, -1e-17], vectors: Array2::zeros((3, 2)) };
        assert_eq!(eigen.singular_values(), array![2.0, 0.0]);
    }

    #[test]
    fn unconverged_solver_refuses_extraction() {
        let mut solver = ThickRestartLanczos::new(4, 0, &EigensolverConfig::default());
        solver.step();
        let err = extract_eigenpairs(&solver, 1).unwrap_err();
        assert!(matches!(err, DistSvdError::Extraction(SolverStatus::InvalidEigenCount)));
    }

    #[test]
    fn empty_orders_keep_row_counts() {
        assert_eq!(reorder_columns_owned(&Array2::zeros((3, 2)), &[]).dim(), (3, 0));
        assert_eq!(reorder_array_owned(&array![1.0, 2.0], &[]).len(), 0);
    }
}
