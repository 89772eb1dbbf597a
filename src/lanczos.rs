// src/lanczos.rs

//! Reverse-communication eigensolver for the dominant eigenpairs of a symmetric operator.
//!
//! The solver never sees the operator. Each call to [`ReverseCommSolver::step`] either
//! asks the caller to apply the operator to the vector stored at `workd[ipntr[0]..]`,
//! writing the product to `workd[ipntr[1]..]`, or reports that it is done. The status
//! left in [`ReverseCommSolver::info`] says whether the requested eigenpairs converged.
//!
//! [`ThickRestartLanczos`] keeps an orthonormal basis `V` and its images `W = A V`.
//! When the basis is full it solves the projected problem `Vᵀ W`, tests the true Ritz
//! residuals `‖W y - θ V y‖`, and restarts from the best Ritz vectors plus the last
//! residual direction.

use crate::linalg_backends::{BackendEigh, EighOutput, LinAlgBackendProvider};
use crate::ThreadSafeStdError;
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// First operator request after initialization.
pub const IDO_FIRST_REQUEST: i32 = -1;
/// Operator request during the iteration.
pub const IDO_APPLY_OPERATOR: i32 = 1;
/// The solver has finished; see `info`.
pub const IDO_DONE: i32 = 99;

// Classical Gram-Schmidt is repeated while a pass removes more than ~30% of the norm.
const DGKS_RATIO: f64 = 0.717;
const MAX_REFINEMENTS: usize = 2;
const MAX_RANDOM_RESTARTS: usize = 3;
// Multiple of `n * eps * |θ_max|` accepted as converged for small Ritz values.
const ROUNDOFF_SCALE: f64 = 4.0;

/// One request from the solver to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseCommStep {
    pub ido: i32,
    /// Offsets into `workd`: `[input, output]`, each the start of a `dimension`-long slice.
    pub ipntr: [usize; 2],
}

/// Outcome of a solve, mirroring the integer `info` convention of ARPACK-style solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverStatus {
    Converged,
    MaxIterations,
    NoExpansion,
    InvalidDimension,
    InvalidEigenCount,
    InvalidSubspaceSize,
    InvalidMaxIterations,
    InvalidStartVector,
    ProjectedEigFailed,
    Other(i32),
}

impl SolverStatus {
    pub fn from_info(info: i32) -> Self {
        match info {
            0 => SolverStatus::Converged,
            1 => SolverStatus::MaxIterations,
            3 => SolverStatus::NoExpansion,
            -1 => SolverStatus::InvalidDimension,
            -2 => SolverStatus::InvalidEigenCount,
            -3 => SolverStatus::InvalidSubspaceSize,
            -4 => SolverStatus::InvalidMaxIterations,
            -9 => SolverStatus::InvalidStartVector,
            -9999 => SolverStatus::ProjectedEigFailed,
            other => SolverStatus::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            SolverStatus::Converged => 0,
            SolverStatus::MaxIterations => 1,
            SolverStatus::NoExpansion => 3,
            SolverStatus::InvalidDimension => -1,
            SolverStatus::InvalidEigenCount => -2,
            SolverStatus::InvalidSubspaceSize => -3,
            SolverStatus::InvalidMaxIterations => -4,
            SolverStatus::InvalidStartVector => -9,
            SolverStatus::ProjectedEigFailed => -9999,
            SolverStatus::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SolverStatus::Converged)
    }

    /// The solve ran but stopped short of the requested pairs. Every other non-success
    /// status is a failure of the solver or of its parameters.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, SolverStatus::MaxIterations | SolverStatus::NoExpansion)
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            SolverStatus::Converged => "normal exit",
            SolverStatus::MaxIterations => "maximum number of iterations taken",
            SolverStatus::NoExpansion => "no direction left to expand the Krylov basis",
            SolverStatus::InvalidDimension => "operator dimension must be positive",
            SolverStatus::InvalidEigenCount => "number of eigenpairs must satisfy 0 < nev < n",
            SolverStatus::InvalidSubspaceSize => "subspace size must satisfy nev < ncv <= n",
            SolverStatus::InvalidMaxIterations => "iteration budget must be positive",
            SolverStatus::InvalidStartVector => "starting vector is zero or has the wrong length",
            SolverStatus::ProjectedEigFailed => "projected eigenproblem could not be solved",
            SolverStatus::Other(_) => "unrecognized status",
        };
        write!(f, "info={} ({})", self.code(), description)
    }
}

/// Converged Ritz pairs in the solver's own convention.
#[derive(Debug, Clone, PartialEq)]
pub struct RitzPairs {
    /// Eigenvalues in ascending order.
    pub values: Array1<f64>,
    /// One eigenvector per row (`nev x n`), row `i` pairing with `values[i]`.
    pub vectors: Array2<f64>,
}

/// Parameters of the iterative solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigensolverConfig {
    /// Budget of restart cycles.
    pub max_iterations: usize,
    /// Relative residual tolerance. Values `<= 0` mean machine precision.
    pub tolerance: f64,
    /// Basis size `ncv`. Defaults to `2 * nev`, and is clamped to the operator dimension.
    pub subspace_size: Option<usize>,
    /// Seed for the starting vector and for basis refills after a breakdown.
    pub random_seed: u64,
    /// Explicit starting vector; a seeded Gaussian vector is used otherwise.
    pub start_vector: Option<Vec<f64>>,
}

impl Default for EigensolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            tolerance: 1e-13,
            subspace_size: None,
            random_seed: 2025,
            start_vector: None,
        }
    }
}

impl EigensolverConfig {
    /// Subspace size actually used for an operator of dimension `n` and `nev` eigenpairs.
    pub fn resolved_subspace_size(&self, n: usize, nev: usize) -> usize {
        self.subspace_size.unwrap_or(2 * nev).min(n)
    }
}

/// A symmetric eigensolver driven through reverse communication.
pub trait ReverseCommSolver {
    /// Length of the vectors the operator acts on.
    fn dimension(&self) -> usize;
    fn requested(&self) -> usize;
    fn step(&mut self) -> ReverseCommStep;
    fn workd(&self) -> &[f64];
    fn workd_mut(&mut self) -> &mut [f64];
    fn info(&self) -> i32;
    fn status(&self) -> SolverStatus {
        SolverStatus::from_info(self.info())
    }
    fn iterations(&self) -> usize;
    fn converged(&self) -> usize;
    fn operator_applications(&self) -> usize;
    /// Companion extraction. Only succeeds after a converged solve, and does not change
    /// solver state, so repeated calls return identical pairs.
    fn extract(&self) -> Result<RitzPairs, SolverStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    AwaitingProduct,
    Finished,
}

struct RitzAnalysis {
    order: Vec<usize>,
    eigenvectors: Array2<f64>,
    values: Array1<f64>,
    vectors: Array2<f64>,
    residuals: Vec<f64>,
}

fn norm(v: ArrayView1<f64>) -> f64 {
    v.dot(&v).sqrt()
}

/// Component of `w` orthogonal to the columns of `basis`, with its norm.
/// Returns `None` when `w` lies numerically inside their span.
fn orthogonalize(basis: ArrayView2<f64>, w: &Array1<f64>) -> Option<(Array1<f64>, f64)> {
    let mut previous = norm(w.view());
    if previous == 0.0 || !previous.is_finite() {
        return None;
    }
    let mut f = w.clone();
    for _ in 0..=MAX_REFINEMENTS {
        let coefficients = basis.t().dot(&f);
        f -= &basis.dot(&coefficients);
        let current = norm(f.view());
        if current > DGKS_RATIO * previous {
            return Some((f, current));
        }
        previous = current;
    }
    None
}

/// Thick-restart Lanczos with full reorthogonalization, for the `nev` eigenvalues of
/// largest magnitude.
pub struct ThickRestartLanczos {
    n: usize,
    nev: usize,
    ncv: usize,
    max_iterations: usize,
    tolerance: f64,
    start_vector: Option<Vec<f64>>,
    phase: Phase,
    basis: Array2<f64>,
    products: Array2<f64>,
    /// Columns of `basis` whose products are stored in `products`.
    active: usize,
    residual: Array1<f64>,
    residual_norm: f64,
    workd: Vec<f64>,
    info: i32,
    iterations: usize,
    converged: usize,
    operator_applications: usize,
    rng: ChaCha8Rng,
    ritz_values: Array1<f64>,
    ritz_vectors: Array2<f64>,
    backend: LinAlgBackendProvider,
}

impl ThickRestartLanczos {
    /// Parameters are validated on the first [`ReverseCommSolver::step`], which finishes
    /// immediately with a negative `info` when they are unusable.
    pub fn new(n: usize, nev: usize, config: &EigensolverConfig) -> Self {
        let ncv = config.resolved_subspace_size(n, nev);
        let tolerance = if config.tolerance > 0.0 { config.tolerance } else { f64::EPSILON };
        Self {
            n,
            nev,
            ncv,
            max_iterations: config.max_iterations,
            tolerance,
            start_vector: config.start_vector.clone(),
            phase: Phase::Init,
            basis: Array2::zeros((n, ncv)),
            products: Array2::zeros((n, ncv)),
            active: 0,
            residual: Array1::zeros(n),
            residual_norm: 0.0,
            workd: vec![0.0; 2 * n],
            info: 0,
            iterations: 0,
            converged: 0,
            operator_applications: 0,
            rng: ChaCha8Rng::seed_from_u64(config.random_seed),
            ritz_values: Array1::zeros(0),
            ritz_vectors: Array2::zeros((n, 0)),
            backend: LinAlgBackendProvider::new(),
        }
    }

    pub fn subspace_size(&self) -> usize {
        self.ncv
    }

    fn validate(&self) -> Result<(), SolverStatus> {
        if self.n == 0 {
            return Err(SolverStatus::InvalidDimension);
        }
        if self.nev == 0 || self.nev >= self.n {
            return Err(SolverStatus::InvalidEigenCount);
        }
        if self.ncv <= self.nev {
            return Err(SolverStatus::InvalidSubspaceSize);
        }
        if self.max_iterations == 0 {
            return Err(SolverStatus::InvalidMaxIterations);
        }
        Ok(())
    }

    fn initial_vector(&mut self) -> Result<Array1<f64>, SolverStatus> {
        let candidate = match self.start_vector.take() {
            Some(v) if v.len() == self.n => Array1::from(v),
            Some(_) => return Err(SolverStatus::InvalidStartVector),
            None => {
                let rng = &mut self.rng;
                Array1::from_shape_fn(self.n, |_| rng.sample(StandardNormal))
            }
        };
        let length = norm(candidate.view());
        if !(length > 0.0 && length.is_finite()) {
            return Err(SolverStatus::InvalidStartVector);
        }
        Ok(candidate / length)
    }

    fn start(&mut self) -> ReverseCommStep {
        if let Err(status) = self.validate() {
            return self.finish(status);
        }
        match self.initial_vector() {
            Ok(v0) => {
                debug!(
                    "Lanczos start: n={}, nev={}, ncv={}, maxiter={}, tol={:e}",
                    self.n, self.nev, self.ncv, self.max_iterations, self.tolerance
                );
                self.basis.column_mut(0).assign(&v0);
                self.active = 0;
                self.request(IDO_FIRST_REQUEST)
            }
            Err(status) => self.finish(status),
        }
    }

    /// Copies basis column `active` into the input slot and asks for its product.
    fn request(&mut self, ido: i32) -> ReverseCommStep {
        let n = self.n;
        self.workd[..n]
            .iter_mut()
            .zip(self.basis.column(self.active).iter())
            .for_each(|(slot, x)| *slot = *x);
        self.phase = Phase::AwaitingProduct;
        ReverseCommStep { ido, ipntr: [0, n] }
    }

    fn finish(&mut self, status: SolverStatus) -> ReverseCommStep {
        self.info = status.code();
        self.phase = Phase::Finished;
        if status.is_success() {
            info!(
                "Lanczos converged: {} eigenpairs after {} iterations and {} operator applications",
                self.converged, self.iterations, self.operator_applications
            );
        } else {
            warn!(
                "Lanczos stopped with {}: {} of {} eigenpairs converged after {} iterations",
                status, self.converged, self.nev, self.iterations
            );
        }
        ReverseCommStep { ido: IDO_DONE, ipntr: [0, 0] }
    }

    fn absorb_product(&mut self) -> ReverseCommStep {
        let n = self.n;
        let column = self.active;
        let product = ArrayView1::from(&self.workd[n..2 * n]);
        if product.iter().any(|x| !x.is_finite()) {
            warn!("Operator returned a non-finite product for basis column {}", column);
            return self.finish(SolverStatus::ProjectedEigFailed);
        }
        self.products.column_mut(column).assign(&product);
        self.operator_applications += 1;
        self.active += 1;

        let w = self.products.column(column).to_owned();
        match orthogonalize(self.basis.slice(s![.., ..self.active]), &w) {
            Some((f, length)) => {
                self.residual = f;
                self.residual_norm = length;
            }
            None => {
                self.residual.fill(0.0);
                self.residual_norm = 0.0;
            }
        }

        if self.active == self.ncv {
            return self.evaluate();
        }
        if let Err(status) = self.extend_basis() {
            return self.finish(status);
        }
        self.request(IDO_APPLY_OPERATOR)
    }

    /// Fills basis column `active` from the residual direction, or a random direction
    /// when the basis spans an invariant subspace.
    fn extend_basis(&mut self) -> Result<(), SolverStatus> {
        let k = self.active;
        let next = if self.residual_norm > 0.0 {
            orthogonalize(self.basis.slice(s![.., ..k]), &self.residual)
        } else {
            None
        };
        let next = match next {
            Some((f, length)) => f / length,
            None => {
                debug!("Lanczos breakdown at basis size {}; refilling with a random direction", k);
                self.random_direction(k).ok_or(SolverStatus::NoExpansion)?
            }
        };
        self.basis.column_mut(k).assign(&next);
        Ok(())
    }

    fn random_direction(&mut self, k: usize) -> Option<Array1<f64>> {
        for _ in 0..MAX_RANDOM_RESTARTS {
            let rng = &mut self.rng;
            let candidate: Array1<f64> = Array1::from_shape_fn(self.n, |_| rng.sample(StandardNormal));
            if let Some((f, length)) = orthogonalize(self.basis.slice(s![.., ..k]), &candidate) {
                return Some(f / length);
            }
        }
        None
    }

    /// Residual a Ritz pair must reach. The relative part scales with `|θ|`; the floor is
    /// the round-off left by applying an operator of norm `theta_max`, which no residual of a
    /// small Ritz value can get below.
    fn convergence_threshold(&self, theta: f64, theta_max: f64) -> f64 {
        let relative = self.tolerance * theta.abs().max(f64::EPSILON.powf(2.0 / 3.0));
        let roundoff = ROUNDOFF_SCALE * self.n as f64 * f64::EPSILON * theta_max.abs();
        relative.max(roundoff)
    }

    fn analyze(&self) -> Result<RitzAnalysis, ThreadSafeStdError> {
        let m = self.active;
        let vm = self.basis.slice(s![.., ..m]);
        let wm = self.products.slice(s![.., ..m]);
        let projected = vm.t().dot(&wm);
        let symmetric = (&projected + &projected.t()) * 0.5;
        let EighOutput { eigenvalues, eigenvectors } = self.backend.eigh_upper(&symmetric)?;

        let mut order: Vec<usize> = (0..m).collect();
        order.sort_by(|&a, &b| eigenvalues[b].abs().total_cmp(&eigenvalues[a].abs()));

        let wanted = &order[..self.nev];
        let y = eigenvectors.select(Axis(1), wanted);
        let vectors = vm.dot(&y);
        let values: Array1<f64> = wanted.iter().map(|&i| eigenvalues[i]).collect();

        // A basis spanning the whole space makes the Rayleigh-Ritz pairs exact.
        let residuals = if m == self.n {
            vec![0.0; self.nev]
        } else {
            let images = wm.dot(&y);
            values
                .iter()
                .enumerate()
                .map(|(j, &theta)| {
                    let r = &images.column(j) - &(&vectors.column(j) * theta);
                    norm(r.view())
                })
                .collect()
        };

        Ok(RitzAnalysis { order, eigenvectors, values, vectors, residuals })
    }

    fn evaluate(&mut self) -> ReverseCommStep {
        self.iterations += 1;
        let analysis = match self.analyze() {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Projected eigenproblem failed at iteration {}: {}", self.iterations, e);
                return self.finish(SolverStatus::ProjectedEigFailed);
            }
        };

        let theta_max = analysis.values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()));
        let nconv = analysis
            .residuals
            .iter()
            .zip(analysis.values.iter())
            .filter(|(r, theta)| **r <= self.convergence_threshold(**theta, theta_max))
            .count();
        self.converged = nconv;
        debug!(
            "Lanczos iteration {}: {}/{} Ritz pairs converged, max residual {:.3e}, leading Ritz value {:.6e}",
            self.iterations,
            nconv,
            self.nev,
            analysis.residuals.iter().cloned().fold(0.0, f64::max),
            analysis.values.first().copied().unwrap_or(0.0)
        );

        if nconv >= self.nev || self.iterations >= self.max_iterations {
            let status = if nconv >= self.nev { SolverStatus::Converged } else { SolverStatus::MaxIterations };
            self.ritz_values = analysis.values;
            self.ritz_vectors = analysis.vectors;
            return self.finish(status);
        }

        self.restart(&analysis, nconv);
        if let Err(status) = self.extend_basis() {
            return self.finish(status);
        }
        self.request(IDO_APPLY_OPERATOR)
    }

    /// Compresses the basis to the leading Ritz vectors, keeping a few extra
    /// converged ones to shield the wanted pairs.
    fn restart(&mut self, analysis: &RitzAnalysis, nconv: usize) {
        let m = self.active;
        let keep = (self.nev + nconv.min((self.ncv - self.nev) / 2)).min(m - 1);
        let rotation = analysis.eigenvectors.select(Axis(1), &analysis.order[..keep]);
        let basis = self.basis.slice(s![.., ..m]).dot(&rotation);
        let products = self.products.slice(s![.., ..m]).dot(&rotation);
        self.basis.slice_mut(s![.., ..keep]).assign(&basis);
        self.products.slice_mut(s![.., ..keep]).assign(&products);
        self.active = keep;
        debug!("Lanczos restart {}: kept {} of {} basis vectors", self.iterations, keep, m);
    }
}

impl ReverseCommSolver for ThickRestartLanczos {
    fn dimension(&self) -> usize {
        self.n
    }

    fn requested(&self) -> usize {
        self.nev
    }

    fn step(&mut self) -> ReverseCommStep {
        match self.phase {
            Phase::Init => self.start(),
            Phase::AwaitingProduct => self.absorb_product(),
            Phase::Finished => ReverseCommStep { ido: IDO_DONE, ipntr: [0, 0] },
        }
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
        self.iterations
    }

    fn converged(&self) -> usize {
        self.converged
    }

    fn operator_applications(&self) -> usize {
        self.operator_applications
    }

    fn extract(&self) -> Result<RitzPairs, SolverStatus> {
        let status = self.status();
        if self.phase != Phase::Finished || !status.is_success() {
            return Err(status);
        }
        let mut order: Vec<usize> = (0..self.ritz_values.len()).collect();
        order.sort_by(|&a, &b| self.ritz_values[a].total_cmp(&self.ritz_values[b]));
        let values: Array1<f64> = order.iter().map(|&i| self.ritz_values[i]).collect();
        let vectors = Array2::from_shape_fn((order.len(), self.n), |(i, j)| self.ritz_vectors[[j, order[i]]]);
        Ok(RitzPairs { values, vectors })
    }
}
