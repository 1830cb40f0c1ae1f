use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    cargo_bin_cmd!("kiln")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run-task"))
        .stdout(predicate::str::contains("sandbox"))
        .stdout(predicate::str::contains("tasks"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("--root"));
}

#[test]
fn test_sandbox_help_lists_lifecycle() {
    cargo_bin_cmd!("kiln")
        .args(["sandbox", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("restart"))
        .stdout(predicate::str::contains("logs"));
}

#[test]
fn test_command_flag_rejects_subcommand() {
    let dir = tempfile::tempdir().unwrap();

    cargo_bin_cmd!("kiln")
        .env("KILN_HOME", dir.path())
        .args(["-c", ":root", "tasks", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be combined"));
}
