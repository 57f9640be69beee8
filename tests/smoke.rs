//! Smoke tests -- verify the binary runs and the one-shot commands work
//! against throwaway databases.

use assert_cmd::Command;
use predicates::prelude::*;

fn healrun(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("healrun").unwrap();
    cmd.env_remove("HEALRUN_CONFIG")
        .env_remove("RUST_LOG")
        .env("DATABASE_URL", dir.path().join("healrun.db"))
        .env("QUEUE_URL", dir.path().join("queue.db"));
    cmd
}

fn stdout_line(output: &[u8]) -> String {
    String::from_utf8_lossy(output).trim().to_string()
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("healrun")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Self-healing browser test-run worker"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("healrun")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("healrun"));
}

#[test]
fn test_work_subcommand_exists() {
    Command::cargo_bin("healrun")
        .unwrap()
        .args(["work", "--help"])
        .assert()
        .success();
}

#[test]
fn test_memory_list_subcommand_exists() {
    Command::cargo_bin("healrun")
        .unwrap()
        .args(["memory", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_bad_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    healrun(&dir)
        .env("STUCK_RUN_TIMEOUT_MINUTES", "soon")
        .arg("sweep")
        .assert()
        .failure()
        .stderr(predicates::str::contains("STUCK_RUN_TIMEOUT_MINUTES"));
}

#[test]
fn test_add_enqueue_and_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let definition = dir.path().join("login.json");
    std::fs::write(
        &definition,
        r#"{
            "name": "login",
            "url": "https://app.example.com/login",
            "steps": [
                {"action": "navigate"},
                {"action": "click", "instruction": "Click the Sign in button"}
            ]
        }"#,
    )
    .unwrap();

    let added = healrun(&dir)
        .args(["add-test", "--file"])
        .arg(&definition)
        .assert()
        .success();
    let test_id = stdout_line(&added.get_output().stdout);
    assert_eq!(test_id.len(), 36);

    let enqueued = healrun(&dir)
        .args(["enqueue", "--test-id", &test_id])
        .assert()
        .success();
    let run_id = stdout_line(&enqueued.get_output().stdout);

    healrun(&dir)
        .args(["status", "--run-id", &run_id])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"status\": \"queued\""));

    healrun(&dir)
        .args(["events", "--run-id", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    healrun(&dir)
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicates::str::contains("0 stuck run(s) failed"));
}

#[test]
fn test_enqueue_unknown_test_fails() {
    let dir = tempfile::tempdir().unwrap();
    healrun(&dir)
        .args(["enqueue", "--test-id", "00000000-0000-0000-0000-000000000000"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("does not exist"));
}

#[test]
fn test_config_file_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("healrun.toml");
    std::fs::write(&config, "[logging]\nfilter = \"info\"\n").unwrap();

    healrun(&dir)
        .arg("--config")
        .arg(&config)
        .args(["memory", "list"])
        .assert()
        .success()
        .stderr(predicates::str::contains("loaded worker configuration"))
        .stderr(predicates::str::contains("healrun.toml"));
}
