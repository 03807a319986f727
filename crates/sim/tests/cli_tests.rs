//! CLI integration tests

use std::process::Command;

fn node_sim(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "node-sim", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = node_sim(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Elastic Node"), "Should show app name");
    assert!(stdout.contains("run"), "Should show run command");
    assert!(stdout.contains("static"), "Should show static command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = node_sim(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("node-sim"), "Should show binary name");
}

/// Test run subcommand help
#[test]
fn test_run_help() {
    let output = node_sim(&["run", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Run help should succeed");
    assert!(stdout.contains("--requests"), "Should show requests option");
    assert!(stdout.contains("--service"), "Should show service option");
    assert!(stdout.contains("--open-loop"), "Should show open-loop option");
}

/// Test static allocation output
#[test]
fn test_static_allocation() {
    let output = node_sim(&[
        "static",
        "--inter-arrival-ms",
        "100",
        "--target-rt-ms",
        "120",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Static should succeed");
    assert_eq!(stdout.trim(), "3");
}

/// Test static allocation as JSON when the target cannot be met
#[test]
fn test_static_allocation_unreachable_json() {
    let output = node_sim(&[
        "--format",
        "json",
        "static",
        "--inter-arrival-ms",
        "0.01",
        "--target-rt-ms",
        "120",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Static should succeed");
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert!(value["allocation"].is_null());
}

/// Test a short run writes the allocation log
#[test]
fn test_short_run_writes_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("run.log");
    let log_path = log.to_str().unwrap();

    let output = node_sim(&[
        "run",
        "--steady",
        "5",
        "--requests",
        "6",
        "--period-ms",
        "100",
        "--service",
        "a:128:20:1",
        "--log-file",
        log_path,
    ]);

    assert!(output.status.success(), "Run should succeed");
    let content = std::fs::read_to_string(&log).unwrap();
    assert!(content.starts_with("nId,ts,sId,sla,rt,rq,al"));
}
