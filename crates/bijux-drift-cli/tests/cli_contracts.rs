// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;

const SPEC: &str = r#"
openapi: 3.0.0
paths:
  /reports:
    get:
      operationId: getReports
      responses:
        '200':
          content:
            application/json:
              schema:
                type: object
                properties:
                  total: { type: integer }
"#;

const ROUTER: &str = r#"use axum::{routing::get, Router};

pub fn app() -> Router {
    Router::new()
        .route("/reports", get(not_implemented))
}
"#;

const HANDLERS: &str = r#"use axum::{http::StatusCode, Json};

#[derive(Serialize)]
pub struct Report {
    pub total: u64,
}

pub async fn get_reports() -> Json<Report> {
    Json(Report { total: 0 })
}

pub async fn not_implemented() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}
"#;

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, text).expect("write");
}

fn drift(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bijux-drift"));
    cmd.current_dir(root)
        .env("DRIFT_LOG_JSON", "false")
        .env("DRIFT_CONFIG", root.join("absent.toml"))
        .env("DRIFT_STORE", root.join("issues.sqlite"))
        .env("DRIFT_ARTIFACTS_DIR", root.join("artifacts"))
        .env("RUST_LOG", "warn");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

#[test]
fn help_lists_the_operator_commands() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = drift(tmp.path()).arg("--help").output().expect("help");
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout).expect("utf8");
    for command in ["run", "issues", "ticket", "approve"] {
        assert!(text.contains(command), "missing {command} in help");
    }
}

#[test]
fn unknown_flag_is_a_usage_error_with_machine_payload() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = drift(tmp.path())
        .args(["--json", "--no-such-flag"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let err: Value = serde_json::from_slice(&output.stderr).expect("machine error");
    assert_eq!(err["code"], "usage_error");
}

#[test]
fn empty_store_lists_no_records() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = drift(tmp.path())
        .args(["--json", "issues", "list"])
        .output()
        .expect("run");
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), Value::Array(Vec::new()));
}

#[test]
fn resolving_an_unknown_issue_fails_validation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = drift(tmp.path())
        .args(["--json", "issues", "resolve", "ISS-000042"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(3));
    let err: Value = serde_json::from_slice(&output.stderr).expect("machine error");
    assert_eq!(err["code"], "not_found");
    assert_eq!(err["details"]["issue_id"], "ISS-000042");
}

#[test]
fn invalid_config_is_rejected_before_running() {
    let tmp = tempfile::tempdir().expect("tempdir");
    write(tmp.path(), "drift.toml", "max_concurrency = 0\n");
    let output = drift(tmp.path())
        .args(["--json", "--config", "drift.toml", "run"])
        .args(["--spec", "spec.yaml", "--client", "client", "--server", "server"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(3));
    let err: Value = serde_json::from_slice(&output.stderr).expect("machine error");
    assert_eq!(err["code"], "invalid_config");
}

#[test]
fn open_regression_run_then_operator_follow_up() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    write(root, "spec.yaml", SPEC);
    fs::create_dir_all(root.join("client")).expect("client");
    write(root, "server/src/router.rs", ROUTER);
    write(root, "server/src/handlers.rs", HANDLERS);

    let run = drift(root)
        .args(["--json", "run", "--run-id", "cli_run"])
        .args(["--spec", "spec.yaml", "--client", "client", "--server", "server"])
        .output()
        .expect("run");
    // no generation marker: the broken route stays an unconfirmed regression
    assert_eq!(run.status.code(), Some(5));
    let body = stdout_json(&run);
    assert_eq!(body["run_id"], "cli_run");
    assert_eq!(body["final_state"], "done");
    assert!(body["counts"]["regressions_open"].as_u64().expect("count") > 0);
    assert!(root.join("artifacts/cli_run/report.json").exists());
    assert_eq!(fs::read_to_string(root.join("server/src/router.rs")).expect("router"), ROUTER);

    let listed = drift(root)
        .args(["--json", "issues", "list", "--status", "tracked"])
        .output()
        .expect("list");
    assert!(listed.status.success());
    let records = stdout_json(&listed);
    let records = records.as_array().expect("records");
    assert!(!records.is_empty());
    let id = records[0]["id"].as_str().expect("id").to_string();
    let mismatch = records[0]["mismatch_id"].as_str().expect("mismatch").to_string();
    assert!(records[0]["ticket"].as_str().expect("ticket").starts_with("DRY-"));

    let resolved = drift(root)
        .args(["--json", "issues", "resolve", &id])
        .output()
        .expect("resolve");
    assert!(resolved.status.success());
    assert_eq!(stdout_json(&resolved)[0]["status"], "resolved");

    let forced = drift(root)
        .args(["--json", "ticket", "create", "--mismatch", &mismatch])
        .output()
        .expect("ticket");
    // a resolved record no longer accepts tickets
    assert_eq!(forced.status.code(), Some(3));
}

#[test]
fn approve_against_a_closed_port_is_a_dependency_failure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = drift(tmp.path())
        .args(["--json", "approve", "--url", "http://127.0.0.1:9"])
        .args(["--run-id", "nightly", "--decision", "accept"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(4));
}
