mod support;

use predicates::prelude::*;
use predicates::str::contains;
use serde_json::{json, Value};

use support::{taskboard_cmd, Workspace};

fn seed_records() -> Value {
    json!([
        {"id": 1, "title": "Water plants", "due_date": "2024-06-03", "is_completed": false,
         "assigned_to": {"id": "u1", "email": "amy@example.com"}},
        {"id": 2, "title": "Pay rent", "due_date": "2024-06-01", "is_completed": null,
         "assigned_to": "u2"},
        {"id": 10, "title": "Someday", "due_date": null, "assigned_to": null}
    ])
}

#[test]
fn help_lists_commands() {
    taskboard_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("replay"))
        .stdout(contains("normalize"))
        .stdout(contains("calendar"));
}

#[test]
fn subcommand_help_works() {
    for cmd in ["replay", "normalize", "calendar"] {
        taskboard_cmd().arg(cmd).arg("--help").assert().success();
    }
}

#[test]
fn replay_prints_tasks_in_due_order() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;
    let feed = ws.write_feed(&[
        r#"{"type": "INSERT", "new": {"id": 3, "title": "Buy milk", "due_date": "2024-06-02"}}"#,
    ])?;

    let output = taskboard_cmd()
        .current_dir(ws.path())
        .args(["replay", "--seed"])
        .arg(&seed)
        .arg("--feed")
        .arg(&feed)
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let order: Vec<usize> = ["Pay rent", "Buy milk", "Water plants", "Someday"]
        .iter()
        .map(|title| stdout.find(title).expect("title printed"))
        .collect();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{stdout}");
    assert!(stdout.contains("(amy@example.com)"));
    Ok(())
}

#[test]
fn replay_json_envelope() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;
    let feed = ws.write_feed(&[
        r#"{"eventType": "UPDATE", "new": {"id": 1, "title": "Water plants", "due_date": "2024-06-03", "is_completed": true, "assigned_to": "u1"}, "old": {"id": 1}}"#,
        r#"{"eventType": "DELETE", "old": {"id": 10}}"#,
        r#"{"eventType": "DELETE", "old": {"id": 99}}"#,
    ])?;

    let output = taskboard_cmd()
        .current_dir(ws.path())
        .args(["--json", "replay", "--today", "2024-06-02", "--seed"])
        .arg(&seed)
        .arg("--feed")
        .arg(&feed)
        .output()?;
    assert!(output.status.success());

    let payload: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(payload["schema_version"], "taskboard.v1");
    assert_eq!(payload["command"], "replay");
    assert_eq!(payload["status"], "success");

    let data = &payload["data"];
    assert_eq!(data["view"], "all");
    assert_eq!(data["seeded"], 3);
    assert_eq!(data["applied"], 2);
    assert_eq!(data["unchanged"], 1);
    let ids: Vec<&str> = data["tasks"]
        .as_array()
        .expect("tasks")
        .iter()
        .map(|task| task["id"].as_str().expect("id"))
        .collect();
    assert_eq!(ids, vec!["2", "1"]);
    assert_eq!(data["tasks"][1]["is_completed"], true);
    assert_eq!(data["tasks"][1]["assigned_to"]["email"], "amy@example.com");
    assert_eq!(data["past_due"], json!(["2"]));
    Ok(())
}

#[test]
fn replay_mine_uses_user_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;

    let output = taskboard_cmd()
        .current_dir(ws.path())
        .env("TASKBOARD_USER", "u2")
        .args(["--json", "replay", "--view", "mine", "--seed"])
        .arg(&seed)
        .output()?;
    assert!(output.status.success());

    let payload: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(payload["data"]["user"], "u2");
    assert_eq!(payload["data"]["tasks"].as_array().map(Vec::len), Some(1));
    assert_eq!(payload["data"]["tasks"][0]["id"], "2");
    Ok(())
}

#[test]
fn replay_mine_without_user_is_a_user_error() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;

    taskboard_cmd()
        .current_dir(ws.path())
        .args(["replay", "--view", "mine", "--seed"])
        .arg(&seed)
        .assert()
        .code(2)
        .stderr(contains("needs a user"));
    Ok(())
}

#[test]
fn replay_day_view_uses_config_default() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;
    ws.write_config("[views]\ndefault = \"day\"\n")?;

    let output = taskboard_cmd()
        .current_dir(ws.path())
        .args(["--json", "replay", "--day", "2024-06-01", "--seed"])
        .arg(&seed)
        .output()?;
    assert!(output.status.success());

    let payload: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(payload["data"]["view"], "day");
    assert_eq!(payload["data"]["day"], "2024-06-01");
    assert_eq!(payload["data"]["tasks"][0]["title"], "Pay rent");
    Ok(())
}

#[test]
fn invalid_config_is_a_user_error() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;
    ws.write_config("[store]\nbuffer_limit = 0\n")?;

    let output = taskboard_cmd()
        .current_dir(ws.path())
        .args(["--json", "replay", "--seed"])
        .arg(&seed)
        .output()?;
    assert_eq!(output.status.code(), Some(2));

    let payload: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["error"]["kind"], "user_error");
    assert!(payload["error"]["message"]
        .as_str()
        .unwrap_or_default()
        .contains("buffer_limit"));
    Ok(())
}

#[test]
fn bad_seed_record_fails_with_record_number() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&json!([{"id": 1, "title": "ok"}, {"title": "no id"}]))?;

    taskboard_cmd()
        .current_dir(ws.path())
        .args(["replay", "--seed"])
        .arg(&seed)
        .assert()
        .code(2)
        .stderr(contains("record 2"));
    Ok(())
}

#[test]
fn normalize_reports_dropped_lines_without_failing() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let feed = ws.write_feed(&[
        "# recorded feed",
        r#"{"type": "INSERT", "new": {"id": 7, "title": "kept"}}"#,
        "not json",
        r#"{"type": "DELETE", "old": {}}"#,
        "",
        r#"{"type": "UPDATE", "new": {"title": "renamed"}, "old": {"id": 7}}"#,
    ])?;

    let output = taskboard_cmd()
        .current_dir(ws.path())
        .args(["--json", "normalize", "--feed"])
        .arg(&feed)
        .output()?;
    assert!(output.status.success());

    let payload: Value = serde_json::from_slice(&output.stdout)?;
    let events = payload["data"]["events"].as_array().expect("events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["line"], 2);
    assert_eq!(events[0]["event"], "created");
    assert_eq!(events[1]["event"], "patched");
    assert_eq!(events[1]["record"]["title"], "renamed");
    assert_eq!(events[1]["record"]["id"], "7");

    let dropped: Vec<u64> = payload["data"]["dropped"]
        .as_array()
        .expect("dropped")
        .iter()
        .filter_map(|line| line["line"].as_u64())
        .collect();
    assert_eq!(dropped, vec![3, 4]);
    assert_eq!(payload["warnings"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn calendar_marks_days_with_tasks() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;

    taskboard_cmd()
        .current_dir(ws.path())
        .args(["calendar", "--month", "2024-06", "--seed"])
        .arg(&seed)
        .assert()
        .success()
        .stdout(contains("2 marked day(s)"))
        .stdout(contains("2024-06-01 (1 task(s))"))
        .stdout(contains("2024-06-03 (1 task(s))"))
        .stdout(contains("Someday").not());
    Ok(())
}

#[test]
fn calendar_rejects_bad_month() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;

    taskboard_cmd()
        .current_dir(ws.path())
        .args(["calendar", "--month", "June", "--seed"])
        .arg(&seed)
        .assert()
        .code(2)
        .stderr(contains("--month"));
    Ok(())
}

#[test]
fn quiet_suppresses_human_output() -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::init()?;
    let seed = ws.write_seed(&seed_records())?;

    taskboard_cmd()
        .current_dir(ws.path())
        .args(["-q", "replay", "--seed"])
        .arg(&seed)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    Ok(())
}
