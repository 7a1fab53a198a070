use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_tl<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_tl"))
        .args(args)
        .env_remove("TL_USER_ID")
        .env_remove("TL_ROLE")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute tl binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tl(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "tl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

/// Run a command expected to be rejected by the ledger and return its stderr error body.
fn run_rejected<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tl(args);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(3), "stderr:\n{stderr}");

    let start = stderr
        .find("{\n")
        .unwrap_or_else(|| panic!("stderr carries no JSON error body:\n{stderr}"));
    serde_json::from_str(&stderr[start..])
        .unwrap_or_else(|err| panic!("stderr is not valid JSON: {err}\nstderr:\n{stderr}"))
}

fn pointer_i64(value: &Value, pointer: &str) -> i64 {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

fn pointer_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_draft(dir: &Path, name: &str, effective_from: &str) -> PathBuf {
    let draft = serde_json::json!({
        "title": "morning routine",
        "description": "read and hydrate",
        "effective_from": effective_from,
        "requirement": {
            "title": "routine done",
            "type": "condition",
            "operator": "AND",
            "operands": [
                {
                    "title": "minutes read",
                    "type": "atom",
                    "data_type": "duration",
                    "operator": ">=",
                    "target_value": "20m",
                    "sort_order": 1
                },
                {
                    "title": "glasses of water",
                    "type": "atom",
                    "data_type": "int",
                    "operator": ">=",
                    "target_value": "2",
                    "sort_order": 2
                }
            ]
        }
    });
    let path = dir.join(name);
    fs::write(&path, draft.to_string())
        .unwrap_or_else(|err| panic!("failed to write draft {}: {err}", path.display()));
    path
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_migrate_integrity_backup_restore() {
    let dir = unique_temp_dir("tl-cli-db");
    let db = dir.join("ledger.sqlite3");
    let backup = dir.join("backup.sqlite3");

    let planned = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(planned["contract_version"], "cli.v1");
    assert_eq!(planned["would_apply_versions"], serde_json::json!([1]));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(applied["after_version"], 1);
    assert_eq!(applied["up_to_date"], true);

    let schema = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(schema["current_version"], 1);
    assert_eq!(schema["up_to_date"], true);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity["ok"], true);

    let backed_up =
        run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(backed_up["status"], "ok");
    assert!(backup.exists());

    let restored = run_json(["--db", path_str(&db), "db", "restore", "--in", path_str(&backup)]);
    assert_eq!(restored["status"], "ok");
    assert_eq!(restored["current_version"], 1);

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn task_create_entry_upsert_and_day_status_flow() {
    let dir = unique_temp_dir("tl-cli-flow");
    let db = dir.join("ledger.sqlite3");
    let draft = write_draft(&dir, "draft.json", "2025-03-01");
    let owner = ["--db", path_str(&db), "--user-id", "7"];

    let created = run_json(owner.iter().copied().chain(["task", "create", "--file", path_str(&draft)]));
    let task_id = pointer_i64(&created, "/task/id").to_string();
    let reading = pointer_i64(&created, "/requirements/children/0/skeleton_id").to_string();
    let water = pointer_i64(&created, "/requirements/children/1/skeleton_id").to_string();
    assert_eq!(pointer_str(&created, "/snapshot/title"), "morning routine");

    let first = run_json(owner.iter().copied().chain([
        "entry", "upsert", "--requirement-id", reading.as_str(), "--date", "2025-03-04", "--value", "25m",
    ]));
    assert_eq!(pointer_str(&first, "/updated/0/value"), "25m");
    assert_eq!(pointer_str(&first, "/updated/1/value"), "false");

    let second = run_json(owner.iter().copied().chain([
        "entry", "upsert", "--requirement-id", water.as_str(), "--date", "2025-03-04", "--value", "3",
    ]));
    assert_eq!(pointer_str(&second, "/updated/1/value"), "true");

    let day = run_json(owner.iter().copied().chain([
        "task", "day", "--task-id", task_id.as_str(), "--date", "2025-03-04",
    ]));
    assert_eq!(day["satisfied"], true);

    let listed = run_json(owner.iter().copied().chain([
        "entry", "list", "--requirement-id", water.as_str(), "--start", "2025-03-01", "--end", "2025-03-31",
    ]));
    assert_eq!(pointer_str(&listed, "/payload/0/value"), "3");

    let tasks = run_json(owner.iter().copied().chain(["task", "list"]));
    assert_eq!(tasks["payload"].as_array().map(Vec::len), Some(1));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn task_revisions_can_be_staged_switched_and_archived() {
    let dir = unique_temp_dir("tl-cli-revise");
    let db = dir.join("ledger.sqlite3");
    let first = write_draft(&dir, "first.json", "2025-03-01");
    let second = write_draft(&dir, "second.json", "2025-04-01");
    let owner = ["--db", path_str(&db), "--user-id", "7"];

    let created = run_json(owner.iter().copied().chain(["task", "create", "--file", path_str(&first)]));
    let task_id = pointer_i64(&created, "/task/id").to_string();

    let staged = run_json(owner.iter().copied().chain([
        "task", "revise", "--task-id", task_id.as_str(), "--file", path_str(&second), "--make-current",
        "false",
    ]));
    assert_eq!(staged["snapshot"]["is_current"], false);
    let staged_revision = pointer_str(&staged, "/snapshot/revision_id").to_string();

    let revisions =
        run_json(owner.iter().copied().chain(["task", "revisions", "--task-id", task_id.as_str()]));
    assert_eq!(revisions["payload"].as_array().map(Vec::len), Some(2));

    let switched = run_json(owner.iter().copied().chain([
        "task", "set-current", "--task-id", task_id.as_str(), "--revision-id", staged_revision.as_str(),
    ]));
    assert_eq!(switched["is_current"], true);

    let as_of = run_json(owner.iter().copied().chain([
        "task", "show", "--task-id", task_id.as_str(), "--as-of", "2025-03-15",
    ]));
    assert_ne!(pointer_str(&as_of, "/snapshot/revision_id"), staged_revision);

    let archived = run_json(owner.iter().copied().chain([
        "task", "status", "--task-id", task_id.as_str(), "--status", "archived",
    ]));
    assert_eq!(archived["status"], "archived");
    let active = run_json(owner.iter().copied().chain(["task", "list"]));
    assert_eq!(active["payload"].as_array().map(Vec::len), Some(0));

    let deleted = run_json(owner.iter().copied().chain(["task", "delete", "--task-id", task_id.as_str()]));
    assert_eq!(deleted["deleted"], true);

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-004
#[test]
fn ledger_rejections_exit_with_coded_errors() {
    let dir = unique_temp_dir("tl-cli-errors");
    let db = dir.join("ledger.sqlite3");
    let draft = write_draft(&dir, "draft.json", "2025-03-01");
    let owner = ["--db", path_str(&db), "--user-id", "7"];

    let created = run_json(owner.iter().copied().chain(["task", "create", "--file", path_str(&draft)]));
    let task_id = pointer_i64(&created, "/task/id").to_string();
    let root = pointer_i64(&created, "/requirements/skeleton_id").to_string();
    let reading = pointer_i64(&created, "/requirements/children/0/skeleton_id").to_string();

    let condition_write = run_rejected(owner.iter().copied().chain([
        "entry", "upsert", "--requirement-id", root.as_str(), "--date", "2025-03-04", "--value", "true",
    ]));
    assert_eq!(pointer_str(&condition_write, "/error/code"), "invalid_operation");

    let stranger = run_rejected([
        "--db", path_str(&db), "--user-id", "8", "entry", "upsert", "--requirement-id", reading.as_str(),
        "--date", "2025-03-04", "--value", "25m",
    ]);
    assert_eq!(pointer_str(&stranger, "/error/code"), "forbidden");

    let hidden = run_rejected([
        "--db", path_str(&db), "--user-id", "8", "task", "show", "--task-id", task_id.as_str(),
    ]);
    assert_eq!(pointer_str(&hidden, "/error/code"), "not_found");

    let malformed = run_rejected(owner.iter().copied().chain([
        "entry", "upsert", "--requirement-id", reading.as_str(), "--date", "2025-03-04", "--value",
        "twenty",
    ]));
    assert_eq!(pointer_str(&malformed, "/error/code"), "validation_error");

    let admin = run_json([
        "--db", path_str(&db), "--user-id", "1", "--role", "admin", "task", "show", "--task-id",
        task_id.as_str(),
    ]);
    assert_eq!(pointer_i64(&admin, "/task/owner_id"), 7);

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-005
#[test]
fn task_commands_require_an_acting_user() {
    let dir = unique_temp_dir("tl-cli-identity");
    let db = dir.join("ledger.sqlite3");

    let output = run_tl(["--db", path_str(&db), "task", "list"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--user-id"), "stderr:\n{stderr}");

    let _ = fs::remove_dir_all(&dir);
}
