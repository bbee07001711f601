use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn cmd(state_dir: &std::path::Path, db_path: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("architect").expect("binary");
    cmd.arg("--db-path").arg(db_path);
    cmd.arg("--state-dir").arg(state_dir);
    cmd
}

#[test]
fn submit_then_status_reports_one_pending_task() {
    let td = tempdir().expect("tempdir");
    let db_path = td.path().join("architect.db");
    let state_dir = td.path().join("state");

    cmd(&state_dir, &db_path)
        .args(["submit", "build", "--payload", r#"{"target":"release"}"#])
        .assert()
        .success()
        .stdout(contains("\"task_type\": \"build\""));

    cmd(&state_dir, &db_path)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("pending    1"));
}

#[test]
fn claim_complete_round_trip_updates_status_counts() {
    let td = tempdir().expect("tempdir");
    let db_path = td.path().join("architect.db");
    let state_dir = td.path().join("state");

    cmd(&state_dir, &db_path).args(["submit", "lint"]).assert().success();

    let claim_output = cmd(&state_dir, &db_path)
        .args(["claim", "worker-1"])
        .output()
        .expect("claim");
    assert!(claim_output.status.success());
    let claimed: serde_json::Value =
        serde_json::from_slice(&claim_output.stdout).expect("valid JSON");
    let id = claimed["id"].as_i64().expect("id");

    cmd(&state_dir, &db_path)
        .args(["complete", &id.to_string()])
        .assert()
        .success()
        .stdout(contains("\"status\": \"completed\""));

    cmd(&state_dir, &db_path)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("completed  1"));
}

#[test]
fn claim_against_empty_queue_exits_not_running() {
    let td = tempdir().expect("tempdir");
    let db_path = td.path().join("architect.db");
    let state_dir = td.path().join("state");

    cmd(&state_dir, &db_path)
        .args(["claim", "worker-1"])
        .assert()
        .code(2)
        .stdout(contains("null"));
}

#[test]
fn fail_without_retries_remaining_marks_task_failed() {
    let td = tempdir().expect("tempdir");
    let db_path = td.path().join("architect.db");
    let state_dir = td.path().join("state");

    cmd(&state_dir, &db_path)
        .args(["submit", "flaky", "--max-retries", "1"])
        .assert()
        .success();
    cmd(&state_dir, &db_path).args(["claim", "worker-1"]).assert().success();

    cmd(&state_dir, &db_path)
        .args(["fail", "1", "boom"])
        .assert()
        .success()
        .stdout(contains("\"status\": \"failed\""));
}

#[test]
fn prioritize_with_increment_adds_to_current_priority() {
    let td = tempdir().expect("tempdir");
    let db_path = td.path().join("architect.db");
    let state_dir = td.path().join("state");

    cmd(&state_dir, &db_path)
        .args(["submit", "build", "--priority", "3"])
        .assert()
        .success();

    cmd(&state_dir, &db_path)
        .args(["prioritize", "1", "2", "--increment"])
        .assert()
        .success()
        .stdout(contains("\"priority\": 5"));
}

#[test]
fn doctor_reports_environment_without_panicking() {
    let td = tempdir().expect("tempdir");
    let db_path = td.path().join("architect.db");
    let state_dir = td.path().join("state");

    cmd(&state_dir, &db_path)
        .arg("doctor")
        .assert()
        .success()
        .stdout(contains("storage: ok"));
}

#[test]
fn dispatcher_status_reports_not_running_when_no_pid_file() {
    let td = tempdir().expect("tempdir");
    let db_path = td.path().join("architect.db");
    let state_dir = td.path().join("state");

    cmd(&state_dir, &db_path)
        .args(["dispatcher", "status"])
        .assert()
        .code(2)
        .stdout(contains("not running"));
}
