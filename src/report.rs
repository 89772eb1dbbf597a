//! Human-readable job report.

use crate::job::{ConvergenceDiagnostics, ResultSet};
use crate::partition::Partition;
use ndarray::ArrayView2;
use std::io::{self, Write};

/// One line per rank: `Rank r: assigned n rows, first--last`.
pub fn write_partition_table<W: Write>(out: &mut W, partitions: &[Partition]) -> io::Result<()> {
    for p in partitions {
        writeln!(
            out,
            "Rank {}: assigned {} rows, {}--{}",
            p.rank,
            p.localrows,
            p.startingrow,
            p.rows().end.saturating_sub(1)
        )?;
    }
    Ok(())
}

pub fn write_diagnostics<W: Write>(
    out: &mut W,
    diagnostics: &ConvergenceDiagnostics,
    requested: usize,
) -> io::Result<()> {
    writeln!(out, "Solver status: {}", diagnostics.status)?;
    writeln!(out, "Iterations: {}", diagnostics.iterations)?;
    writeln!(out, "Converged eigenpairs: {} of {}", diagnostics.converged, requested)?;
    writeln!(out, "Gramian applications: {}", diagnostics.operator_applications)
}

fn write_matrix<W: Write>(out: &mut W, title: &str, matrix: ArrayView2<'_, f64>) -> io::Result<()> {
    writeln!(out, "{} ({} x {}):", title, matrix.nrows(), matrix.ncols())?;
    for row in matrix.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{:>14.6e}", v)).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    Ok(())
}

/// Writes the converged results. Factor matrices are included when `factors` is set.
pub fn write_results<W: Write>(out: &mut W, results: &ResultSet, factors: bool) -> io::Result<()> {
    write_diagnostics(out, &results.diagnostics, results.singular_values.len())?;
    writeln!(out, "Singular values:")?;
    for (i, (sigma, lambda)) in results.singular_values.iter().zip(results.eigenvalues.iter()).enumerate() {
        writeln!(out, "  sigma[{}] = {:.12e}  (eigenvalue {:.12e})", i + 1, sigma, lambda)?;
    }
    if let Some(approximation) = &results.low_rank_approximation {
        write_matrix(out, "Low-rank approximation A·V·Vᵗ", approximation.view())?;
    }
    if factors {
        write_matrix(out, "Left singular vectors U", results.left_singular_vectors.view())?;
        write_matrix(out, "Right singular vectors V·W", results.right_singular_vectors.view())?;
        write_matrix(out, "Refinement right factor W", results.refined_right_factor.view())?;
    }
    Ok(())
}
