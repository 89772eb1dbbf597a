//! The distributed Gramian operator `v -> AᵗAv`.

use crate::comm::Communicator;
use crate::error::DistSvdError;
use crate::slab::RowSlab;
use ndarray::linalg::general_mat_vec_mul;
use ndarray::{Array1, ArrayView1, ArrayViewMut1};

/// Applies `AᵗA` where `A` is the row-wise concatenation of every rank's slab.
///
/// `apply` is collective: every rank must call it, in the same order, with the same input.
pub struct GramianOperator<'a> {
    slab: &'a RowSlab,
    /// Holds `S = slab · v`, reused across applications.
    scratch: Array1<f64>,
    applications: usize,
}

impl<'a> GramianOperator<'a> {
    pub fn new(slab: &'a RowSlab) -> Self {
        Self { slab, scratch: Array1::zeros(slab.localrows()), applications: 0 }
    }

    pub fn dimension(&self) -> usize {
        self.slab.numcols()
    }

    pub fn applications(&self) -> usize {
        self.applications
    }

    /// Writes `AᵗA · input` into `output` on every rank.
    pub fn apply<C: Communicator + ?Sized>(
        &mut self,
        comm: &mut C,
        input: &[f64],
        output: &mut [f64],
    ) -> Result<(), DistSvdError> {
        let n = self.dimension();
        if input.len() != n {
            return Err(DistSvdError::DimensionMismatch { expected: n, found: input.len() });
        }
        if output.len() != n {
            return Err(DistSvdError::DimensionMismatch { expected: n, found: output.len() });
        }

        if self.slab.localrows() == 0 {
            output.fill(0.0);
        } else {
            let data = self.slab.data();
            let x = ArrayView1::from(input);
            let mut partial = ArrayViewMut1::from(&mut *output);
            general_mat_vec_mul(1.0, &data, &x, 0.0, &mut self.scratch);
            general_mat_vec_mul(1.0, &data.t(), &self.scratch, 0.0, &mut partial);
        }

        comm.all_reduce_sum(output)?;
        self.applications += 1;
        Ok(())
    }

    /// Allocating form of [`GramianOperator::apply`].
    pub fn apply_to<C: Communicator + ?Sized>(
        &mut self,
        comm: &mut C,
        input: &[f64],
    ) -> Result<Vec<f64>, DistSvdError> {
        let mut output = vec![0.0; self.dimension()];
        self.apply(comm, input, &mut output)?;
        Ok(output)
    }
}
