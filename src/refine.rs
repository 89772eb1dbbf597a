//! Local refinement SVD of the small `A·V` matrix, run on the root only.

use crate::error::DistSvdError;
use crate::linalg_backends::{BackendQR, BackendSVD, LinAlgBackendProvider};
use crate::ThreadSafeStdError;
use log::info;
use ndarray::{Array1, Array2};
use std::time::Instant;

/// Thin SVD `A·V = U · diag(s) · Wᵗ`.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinedSvd {
    /// `U`, `numrows x numeigs` with orthonormal columns.
    pub left_singular_vectors: Array2<f64>,
    /// Descending.
    pub singular_values: Array1<f64>,
    /// `W`, `numeigs x numeigs`. `V · W` gives right singular vectors of `A`.
    pub right_singular_vectors: Array2<f64>,
}

fn missing_factor(which: &str) -> ThreadSafeStdError {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("SVD {} factor not returned", which),
    ))
}

/// Factors `av` (`numrows x numeigs`, `numrows >= numeigs`).
///
/// A thin QR first reduces the problem to the `numeigs x numeigs` factor `R`, so the dense
/// SVD never forms a `numrows x numrows` left factor.
pub fn refine_svd(av: &Array2<f64>) -> Result<RefinedSvd, DistSvdError> {
    let (numrows, numeigs) = av.dim();
    if numrows < numeigs {
        return Err(DistSvdError::InvalidShape(format!(
            "refinement needs at least as many rows as eigenvectors, got {}x{}",
            numrows, numeigs
        )));
    }
    let start_time = Instant::now();
    let backend = LinAlgBackendProvider::new();

    let q = backend
        .qr_q_factor(av)
        .map_err(|source| DistSvdError::Backend { context: "QR decomposition of A·V failed", source })?;
    let r = q.t().dot(av);
    let svd = backend
        .svd_into(r, true, true)
        .map_err(|source| DistSvdError::Backend { context: "SVD of the reduced A·V factor failed", source })?;
    let u_r = svd
        .u
        .ok_or_else(|| DistSvdError::Backend { context: "refinement SVD", source: missing_factor("U") })?;
    let vt = svd
        .vt
        .ok_or_else(|| DistSvdError::Backend { context: "refinement SVD", source: missing_factor("Vt") })?;

    let refined = RefinedSvd {
        left_singular_vectors: q.dot(&u_r),
        singular_values: svd.s,
        right_singular_vectors: vt.t().to_owned(),
    };
    info!("Refined SVD of A·V ({} x {}) in {:?}", numrows, numeigs, start_time.elapsed());
    Ok(refined)
}
