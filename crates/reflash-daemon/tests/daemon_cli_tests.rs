use assert_cmd::Command;
use predicates::prelude::*;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;

// Helper to create reflashd command using the non-deprecated macro approach
fn reflashd_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("reflashd"))
}

#[test]
fn test_help_lists_the_daemon_surface() {
    reflashd_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--watch"))
        .stdout(predicate::str::contains("--commands-port"))
        .stdout(predicate::str::contains("--monitor"))
        .stdout(predicate::str::contains("--signing-identity"))
        .stdout(predicate::str::contains("--derived-logs"));
}

#[test]
fn test_version_uses_the_binary_name() {
    reflashd_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("reflashd"));
}

#[test]
fn test_unknown_flag_is_rejected() {
    reflashd_cmd()
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}

#[test]
fn test_port_must_be_numeric() {
    reflashd_cmd()
        .args(["--port", "none"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

/// The daemon is a server: started on ephemeral ports it must bind both
/// listeners and then stay up until killed.
#[test]
fn test_daemon_binds_and_stays_up() {
    let temp_dir = TempDir::new().unwrap();
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin!("reflashd"))
        .args(["--port", "0", "--commands-port", "0"])
        .arg("--cache-dir")
        .arg(temp_dir.path().join("cache"))
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(800));
    assert!(
        child.try_wait().unwrap().is_none(),
        "daemon exited instead of serving"
    );

    child.kill().unwrap();
    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Listening for clients"), "stderr: {stderr}");
    assert!(
        stderr.contains("Listening for intercepted builds"),
        "stderr: {stderr}"
    );
    assert!(stderr.contains("daemon ready"), "stderr: {stderr}");
}
