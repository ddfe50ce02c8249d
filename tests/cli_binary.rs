use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_server_and_agent_verbs() {
    Command::cargo_bin("arv")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("report"))
        .stdout(predicate::str::contains("opinion"))
        .stdout(predicate::str::contains("fix-complete"));
}

#[test]
fn report_requires_its_fields() {
    Command::cargo_bin("arv")
        .unwrap()
        .args(["report", "--title", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--severity"));
}

#[test]
fn unreachable_server_exits_with_server_error_code() {
    // Port 1 refuses connections; transport failures are exit code 2.
    Command::cargo_bin("arv")
        .unwrap()
        .args(["sessions", "--host", "http://127.0.0.1:1"])
        .env_remove("ARV_HOST")
        .env_remove("ARV_BASE")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_subcommand_is_rejected() {
    Command::cargo_bin("arv")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized"));
}
