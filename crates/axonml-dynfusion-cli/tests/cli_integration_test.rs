//! End-to-end integration tests for the dynfusion CLI.
//!
//! These tests invoke the binary on the graph descriptions shipped in
//! `graphs/` and on graphs written to temporary directories.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// Get a Command for the dynfusion binary
fn dynfusion_cmd() -> Command {
    let mut cmd = Command::cargo_bin("dynfusion").unwrap();
    cmd.env("NO_COLOR", "1").env_remove("RUST_LOG");
    cmd
}

fn graph(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("graphs").join(name)
}

// =============================================================================
// Help and Version
// =============================================================================

#[test]
fn test_cli_help() {
    dynfusion_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_cli_version() {
    dynfusion_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dynfusion"));
}

// =============================================================================
// Build
// =============================================================================

#[test]
fn test_build_emits_fused_kernel() {
    dynfusion_cmd()
        .arg("build")
        .arg(graph("conv_add_mul.toml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("direct_conv2d___eltwise_add___eltwise_mul"))
        .stdout(predicate::str::contains("__kernel void"));
}

#[test]
fn test_build_without_fusion() {
    dynfusion_cmd()
        .arg("build")
        .arg(graph("conv_add_mul.toml"))
        .arg("--no-fusion")
        .assert()
        .success()
        .stdout(predicate::str::contains("// unit ").count(3));
}

#[test]
fn test_build_json_to_file() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("workload.json");

    dynfusion_cmd()
        .arg("build")
        .arg(graph("pointwise_gemm.toml"))
        .arg("--json")
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 2 unit workloads"));

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(json["unit_workloads"].as_object().unwrap().len(), 2);
    assert!(json["op_tensor_id_lut"].is_object());
}

#[test]
fn test_build_invalid_graph_fails() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("graph.toml");
    fs::write(
        &path,
        r#"
[[tensors]]
name = "a"
shape = [1, 4, 4, 2]
dtype = "qasymm8"

[[tensors]]
name = "w"
shape = [1, 1, 2, 2]
dtype = "qasymm8"

[[tensors]]
name = "dst"

[[operators]]
type = "conv2d"
input = "a"
weights = "w"
dst = "dst"
"#,
    )
    .unwrap();

    dynfusion_cmd()
        .arg("build")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_missing_graph_file() {
    dynfusion_cmd()
        .arg("build")
        .arg("does-not-exist.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Graph file not found"));
}

// =============================================================================
// Inspect
// =============================================================================

#[test]
fn test_inspect_gemm_graph() {
    dynfusion_cmd()
        .arg("inspect")
        .arg(graph("pointwise_gemm.toml"))
        .arg("--detailed")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 prepare, 1 run"))
        .stdout(predicate::str::contains("reshape_weights"))
        .stdout(predicate::str::contains("gemm_conv2d___eltwise_add"));
}

#[test]
fn test_inspect_target_override() {
    dynfusion_cmd()
        .arg("inspect")
        .arg(graph("conv_add_mul.toml"))
        .arg("--target")
        .arg("g71")
        .assert()
        .success()
        .stdout(predicate::str::contains("g71"));
}

// =============================================================================
// Run
// =============================================================================

#[test]
fn test_run_prints_output_statistics() {
    dynfusion_cmd()
        .arg("run")
        .arg(graph("conv_add_mul.toml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Executed 1 unit workloads"))
        .stdout(predicate::str::contains("shape [1, 16, 16, 4]"));
}

#[test]
fn test_run_is_deterministic_across_fusion() {
    let fused = dynfusion_cmd()
        .arg("run")
        .arg(graph("conv_add_mul.toml"))
        .arg("--seed")
        .arg("7")
        .output()
        .unwrap();
    let unfused = dynfusion_cmd()
        .arg("run")
        .arg(graph("conv_add_mul.toml"))
        .arg("--seed")
        .arg("7")
        .arg("--no-fusion")
        .output()
        .unwrap();
    assert!(fused.status.success());
    assert!(unfused.status.success());

    let outputs = |stdout: &[u8]| {
        let text = String::from_utf8_lossy(stdout).to_string();
        text.lines()
            .filter(|line| line.contains("shape ["))
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    let fused_outputs = outputs(&fused.stdout);
    assert_eq!(fused_outputs.len(), 1);
    assert_eq!(fused_outputs, outputs(&unfused.stdout));
}

#[test]
fn test_run_rejects_zero_iterations() {
    dynfusion_cmd()
        .arg("run")
        .arg(graph("pointwise_gemm.toml"))
        .arg("-n")
        .arg("0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("iterations"));
}
