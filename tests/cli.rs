use distributed_pca::{write_container, ResultSet, SolverStatus};
use ndarray::{array, Array1, Array2};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::{tempdir, TempDir};

const EXIT_FAILURE: i32 = 1;
const EXIT_NOT_CONVERGED: i32 = 2;

fn distributed_pca(input: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_distributed-pca"))
        .arg(input)
        .args(args)
        .args(["--log-level", "error"])
        .env_remove("DPCA_PROCESSES")
        .env_remove("DPCA_LOG_LEVEL")
        .output()
        .expect("failed to launch distributed-pca")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// A container with a small well-conditioned matrix `A` and a 40x30 diagonal matrix
/// `clustered` whose singular values all lie within 3% of each other.
fn container() -> (TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("input.dpca");
    let a = array![[3.0, 1.0, 1.0], [-1.0, 3.0, 1.0], [1.0, 1.0, 4.0], [2.0, 0.0, 1.0]];
    let mut clustered = Array2::zeros((40, 30));
    clustered
        .diag_mut()
        .assign(&Array1::from_shape_fn(30, |i| 1.0 - 0.001 * i as f64));
    write_container(&path, &[("A", a.view()), ("clustered", clustered.view())]).unwrap();
    (dir, path)
}

#[test]
fn converged_run_prints_partition_table_and_singular_values() {
    let (dir, path) = container();
    let saved = dir.path().join("results.bin");
    let output = distributed_pca(
        &path,
        &["A", "4", "3", "2", "-p", "2", "--save-results", saved.to_str().unwrap()],
    );

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Rank 0: assigned 2 rows, 0--1"), "{}", stdout);
    assert!(stdout.contains("Rank 1: assigned 2 rows, 2--3"), "{}", stdout);
    assert!(stdout.contains("Solver status: info=0"), "{}", stdout);
    assert!(stdout.contains("sigma[1] = "), "{}", stdout);
    assert!(stdout.contains("sigma[2] = "), "{}", stdout);
    assert!(!stdout.contains("No results"), "{}", stdout);

    let results = ResultSet::load(&saved).unwrap();
    assert_eq!(results.diagnostics.status, SolverStatus::Converged);
    assert_eq!(results.singular_values.len(), 2);
}

#[test]
fn exhausted_budget_exits_with_the_not_converged_code() {
    let (_dir, path) = container();
    let output = distributed_pca(
        &path,
        &["clustered", "40", "30", "2", "-p", "2", "--max-iterations", "1", "--subspace-size", "4"],
    );

    assert_eq!(output.status.code(), Some(EXIT_NOT_CONVERGED));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Solver status: info=1"), "{}", stdout);
    assert!(stdout.contains("Converged eigenpairs: "), "{}", stdout);
    assert!(stdout.contains("No results: the eigensolver did not converge"), "{}", stdout);
    assert!(!stdout.contains("sigma["), "{}", stdout);
}

#[test]
fn rejected_subspace_size_exits_with_the_failure_code() {
    let (_dir, path) = container();
    let output = distributed_pca(&path, &["A", "4", "3", "2", "--subspace-size", "2"]);

    assert_eq!(output.status.code(), Some(EXIT_FAILURE));
    let stdout = stdout_of(&output);
    assert!(!stdout.contains("No results"), "{}", stdout);
    assert!(!stdout.contains("sigma["), "{}", stdout);
    assert!(String::from_utf8_lossy(&output.stderr).contains("eigensolver failed"));
}

#[test]
fn missing_dataset_exits_with_the_failure_code() {
    let (_dir, path) = container();
    let output = distributed_pca(&path, &["missing", "4", "3", "2"]);

    assert_eq!(output.status.code(), Some(EXIT_FAILURE));
    assert!(!stdout_of(&output).contains("Rank 0: assigned"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing"));
}

#[test]
fn invalid_shape_exits_with_the_failure_code() {
    let (_dir, path) = container();
    let output = distributed_pca(&path, &["A", "4", "3", "3"]);
    assert_eq!(output.status.code(), Some(EXIT_FAILURE));
}
