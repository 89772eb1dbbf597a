// src/linalg_backends.rs

//! Dense, process-local linear algebra used by the eigensolver and the refinement stage.
//!
//! Everything here runs on a single rank over small matrices (the projected
//! `ncv x ncv` problem, the thin `numrows x numeigs` reconstruction). The backend is
//! chosen at compile time: ndarray-linalg (LAPACK) by default, faer with `backend_faer`.

use crate::ThreadSafeStdError;
use ndarray::{Array1, Array2};

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors as columns; `eigenvectors.column(i)` pairs with `eigenvalues[i]`.
    pub eigenvectors: Array2<f64>,
}

/// Output of a singular value decomposition.
#[derive(Debug)]
pub struct SVDOutput {
    pub u: Option<Array2<f64>>,
    pub s: Array1<f64>,
    pub vt: Option<Array2<f64>>,
}

/// Symmetric eigendecomposition reading the upper triangle (LAPACK `DSYEV*`).
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError>;
}

/// Thin QR decomposition, returning only the orthonormal factor.
pub trait BackendQR {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError>;
}

/// Singular value decomposition consuming its input.
pub trait BackendSVD {
    fn svd_into(
        &self,
        matrix: Array2<f64>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput, ThreadSafeStdError>;
}

// --- ndarray-linalg ---

use ndarray_linalg::{Eigh as NdLinalgEigh, SVDInto as NdLinalgSVDInto, QR as NdLinalgQR, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
    Box::new(e)
}

impl BackendEigh for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError> {
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendQR for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

impl BackendSVD for NdarrayLinAlgBackend {
    fn svd_into(
        &self,
        matrix: Array2<f64>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput, ThreadSafeStdError> {
        let (u, s, vt) = matrix.svd_into(compute_u, compute_v).map_err(to_dyn_error)?;
        Ok(SVDOutput { u, s, vt })
    }
}

// --- faer ---

#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendEigh, BackendQR, BackendSVD, EighOutput, SVDOutput};
    use crate::ThreadSafeStdError;
    use faer::linalg::solvers::Svd as FaerSolverSvd;
    use faer::MatRef;
    use ndarray::{Array1, Array2, ShapeBuilder};

    fn to_dyn_error_faer(msg: String) -> ThreadSafeStdError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    /// Borrows a contiguous ndarray matrix as a faer view without copying.
    fn faer_view(matrix: &Array2<f64>) -> Result<MatRef<'_, f64>, ThreadSafeStdError> {
        let (nrows, ncols) = matrix.dim();
        let slice = matrix.as_slice_memory_order().ok_or_else(|| {
            to_dyn_error_faer(format!(
                "Matrix ({}x{}) is non-contiguous and cannot be viewed by faer.",
                nrows, ncols
            ))
        })?;
        if matrix.is_standard_layout() {
            Ok(MatRef::from_row_major_slice(slice, nrows, ncols))
        } else {
            Ok(MatRef::from_column_major_slice(slice, nrows, ncols))
        }
    }

    fn faer_mat_to_ndarray(faer_mat: MatRef<'_, f64>) -> Array2<f64> {
        let (nrows, ncols) = (faer_mat.nrows(), faer_mat.ncols());
        Array2::from_shape_fn((nrows, ncols).f(), |(i, j)| faer_mat[(i, j)])
    }

    fn faer_col_to_ndarray(faer_col: faer::ColRef<'_, f64>) -> Array1<f64> {
        Array1::from_shape_fn(faer_col.nrows(), |i| faer_col[i])
    }

    impl BackendEigh for FaerLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError> {
            if matrix.nrows() != matrix.ncols() {
                return Err(to_dyn_error_faer("Matrix must be square for eigendecomposition.".to_string()));
            }
            if matrix.is_empty() {
                return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
            }
            let eig = faer_view(matrix)?
                .self_adjoint_eigen(faer::Side::Upper)
                .map_err(|e| to_dyn_error_faer(format!("Faer eigendecomposition failed: {:?}", e)))?;
            Ok(EighOutput {
                eigenvalues: faer_col_to_ndarray(eig.S().column_vector()),
                eigenvectors: faer_mat_to_ndarray(eig.U()),
            })
        }
    }

    impl BackendQR for FaerLinAlgBackend {
        fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
            let (nrows, ncols) = matrix.dim();
            if nrows == 0 {
                return Ok(Array2::zeros((0, nrows.min(ncols))));
            }
            let q_thin = faer_view(matrix)?.qr().compute_thin_Q();
            Ok(faer_mat_to_ndarray(q_thin.as_ref()))
        }
    }

    impl BackendSVD for FaerLinAlgBackend {
        fn svd_into(
            &self,
            matrix: Array2<f64>,
            compute_u: bool,
            compute_v: bool,
        ) -> Result<SVDOutput, ThreadSafeStdError> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                let k_dim = nrows.min(ncols);
                return Ok(SVDOutput {
                    u: if compute_u { Some(Array2::zeros((nrows, k_dim))) } else { None },
                    s: Array1::zeros(k_dim),
                    vt: if compute_v { Some(Array2::zeros((k_dim, ncols))) } else { None },
                });
            }
            let svd = FaerSolverSvd::new_thin(faer_view(&matrix)?)
                .map_err(|e| to_dyn_error_faer(format!("Faer SVD computation failed: {:?}", e)))?;
            let s = faer_col_to_ndarray(svd.S().column_vector());
            let u = if compute_u { Some(faer_mat_to_ndarray(svd.U().as_ref())) } else { None };
            let vt = if compute_v { Some(faer_mat_to_ndarray(svd.V().as_ref()).t().into_owned()) } else { None };
            Ok(SVDOutput { u, s, vt })
        }
    }
}

/// Dispatches to the backend selected by feature flags.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider;

impl LinAlgBackendProvider {
    pub fn new() -> Self {
        Self
    }
}

impl BackendEigh for LinAlgBackendProvider {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.eigh_upper(matrix)
        }
    }
}

impl BackendQR for LinAlgBackendProvider {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.qr_q_factor(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.qr_q_factor(matrix)
        }
    }
}

impl BackendSVD for LinAlgBackendProvider {
    fn svd_into(
        &self,
        matrix: Array2<f64>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
    }
}
