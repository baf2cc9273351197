use assert_cmd::Command;
use predicates::prelude::*;

fn vmward() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("vmward").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    vmward().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    vmward()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vmward"));
}

#[test]
fn test_no_args_shows_usage() {
    vmward()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    vmward()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = vmward().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["serve", "status", "snapshots", "revert", "connect"] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_revert_help_shows_required_args() {
    vmward()
        .args(["revert", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--vm"))
        .stdout(predicate::str::contains("--snapshot"));
}

#[test]
fn test_connect_requires_vm() {
    vmward()
        .arg("connect")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--vm"));
}

#[test]
fn test_bad_config_path_fails_cleanly() {
    vmward()
        .args(["status", "--config", "/definitely/not/a/file.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}
