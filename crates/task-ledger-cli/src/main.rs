use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use task_ledger_api::{
    ledger_error, ReviseTaskRequest, SetCurrentRevisionRequest, SetStatusRequest, TaskLedgerApi,
    UpsertEntryRequest, DEFAULT_REQUEST_TIMEOUT,
};
use task_ledger_core::{
    parse_date, Actor, RequirementId, RevisionId, Role, TaskDraft, TaskFilter, TaskId, TaskStatus,
    UserId,
};
use task_ledger_store_sqlite::SqliteStore;
use time::Date;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const EXIT_LEDGER_ERROR: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "tl")]
#[command(about = "Task ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./task_ledger.sqlite3")]
    db: PathBuf,

    /// Acting user for task and entry commands.
    #[arg(long, env = "TL_USER_ID", global = true)]
    user_id: Option<i64>,

    #[arg(long, env = "TL_ROLE", default_value = "user", value_parser = parse_role, global = true)]
    role: Role,

    #[arg(long = "request-timeout-ms", global = true)]
    request_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
    Entry {
        #[command(subcommand)]
        command: EntryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    /// Create a task from a JSON task draft.
    Create(TaskFileArgs),
    /// Append a revision from a JSON task draft.
    Revise(TaskReviseArgs),
    Show(TaskShowArgs),
    List(TaskListArgs),
    Revisions(TaskIdArgs),
    SetCurrent(TaskSetCurrentArgs),
    Status(TaskStatusArgs),
    Delete(TaskIdArgs),
    /// Report whether the task's root requirement is satisfied on a date.
    Day(TaskDayArgs),
}

#[derive(Debug, Args)]
struct TaskFileArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct TaskIdArgs {
    #[arg(long)]
    task_id: i64,
}

#[derive(Debug, Args)]
struct TaskReviseArgs {
    #[arg(long)]
    task_id: i64,
    #[arg(long)]
    file: PathBuf,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    make_current: bool,
}

#[derive(Debug, Args)]
struct TaskShowArgs {
    #[arg(long)]
    task_id: i64,
    #[arg(long, value_parser = parse_date_arg)]
    as_of: Option<Date>,
}

#[derive(Debug, Args)]
struct TaskListArgs {
    #[arg(long, default_value_t = false)]
    active: bool,
    #[arg(long, default_value_t = false)]
    archived: bool,
}

#[derive(Debug, Args)]
struct TaskSetCurrentArgs {
    #[arg(long)]
    task_id: i64,
    #[arg(long, value_parser = parse_revision_arg)]
    revision_id: RevisionId,
}

#[derive(Debug, Args)]
struct TaskStatusArgs {
    #[arg(long)]
    task_id: i64,
    #[arg(long, value_parser = parse_status_arg)]
    status: TaskStatus,
}

#[derive(Debug, Args)]
struct TaskDayArgs {
    #[arg(long)]
    task_id: i64,
    #[arg(long, value_parser = parse_date_arg)]
    date: Date,
}

#[derive(Debug, Subcommand)]
enum EntryCommand {
    /// Record a leaf value and recompute every ancestor condition.
    Upsert(EntryUpsertArgs),
    List(EntryListArgs),
}

#[derive(Debug, Args)]
struct EntryUpsertArgs {
    #[arg(long)]
    requirement_id: i64,
    #[arg(long, value_parser = parse_date_arg)]
    date: Date,
    #[arg(long)]
    value: String,
}

#[derive(Debug, Args)]
struct EntryListArgs {
    #[arg(long)]
    requirement_id: i64,
    #[arg(long, value_parser = parse_date_arg)]
    start: Date,
    #[arg(long, value_parser = parse_date_arg)]
    end: Date,
}

fn parse_role(raw: &str) -> Result<Role, String> {
    Role::parse(raw).ok_or_else(|| format!("unknown role `{raw}`; expected admin, user or guest"))
}

fn parse_date_arg(raw: &str) -> Result<Date, String> {
    parse_date(raw).map_err(|err| err.to_string())
}

fn parse_revision_arg(raw: &str) -> Result<RevisionId, String> {
    Ulid::from_string(raw.trim())
        .map(RevisionId)
        .map_err(|err| format!("invalid revision id `{raw}`: {err}"))
}

fn parse_status_arg(raw: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(raw)
        .ok_or_else(|| format!("unknown status `{raw}`; expected active or archived"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(data: &T) -> Result<()> {
    emit_json(serde_json::to_value(data).context("failed to encode command output")?)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_failure(&err),
    }
}

/// Ledger rejections are machine-readable on stderr; anything else is an unexpected failure.
fn report_failure(err: &anyhow::Error) -> ExitCode {
    let Some(kind) = ledger_error(err) else {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    };
    let body = with_contract_version(serde_json::json!({
        "error": {
            "code": kind.code(),
            "message": kind.to_string(),
        }
    }));
    match serde_json::to_string_pretty(&body) {
        Ok(text) => eprintln!("{text}"),
        Err(_) => eprintln!("error: {kind}"),
    }
    ExitCode::from(EXIT_LEDGER_ERROR)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Task { command } => {
            let actor = acting_user(cli.user_id, cli.role)?;
            run_task(*command, &ledger_api(&cli.db, cli.request_timeout_ms), &actor)
        }
        Command::Entry { command } => {
            let actor = acting_user(cli.user_id, cli.role)?;
            run_entry(command, &ledger_api(&cli.db, cli.request_timeout_ms), &actor)
        }
    }
}

fn acting_user(user_id: Option<i64>, role: Role) -> Result<Actor> {
    let user_id = user_id.ok_or_else(|| anyhow!("--user-id (or TL_USER_ID) is required"))?;
    Ok(Actor::new(UserId(user_id), role))
}

fn ledger_api(db: &Path, request_timeout_ms: Option<u64>) -> TaskLedgerApi {
    let timeout = request_timeout_ms.map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);
    TaskLedgerApi::new(db.to_path_buf()).with_request_timeout(timeout)
}

fn read_draft(path: &Path) -> Result<TaskDraft> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read task draft {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse task draft {}", path.display()))
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "status": "ok"
    }))
}

fn run_db_integrity_check(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let report = store.integrity_check()?;
    emit_json(serde_json::json!({
        "ok": report.quick_check_ok && report.foreign_key_violations.is_empty(),
        "report": report
    }))
}

fn run_task(command: TaskCommand, api: &TaskLedgerApi, actor: &Actor) -> Result<()> {
    debug!(user_id = %actor.user_id, role = actor.role.as_str(), "running task command");
    match command {
        TaskCommand::Create(args) => emit(&api.create_task(actor, &read_draft(&args.file)?)?),
        TaskCommand::Revise(args) => {
            let draft = read_draft(&args.file)?;
            let request = ReviseTaskRequest { draft, make_current: args.make_current };
            emit(&api.revise_task(actor, TaskId(args.task_id), &request)?)
        }
        TaskCommand::Show(args) => emit(&api.get_task(actor, TaskId(args.task_id), args.as_of)?),
        TaskCommand::List(args) => {
            let filter = TaskFilter { active: args.active, archived: args.archived };
            emit(&api.list_tasks(actor, filter)?)
        }
        TaskCommand::Revisions(args) => emit(&api.list_revisions(actor, TaskId(args.task_id))?),
        TaskCommand::SetCurrent(args) => {
            let request = SetCurrentRevisionRequest { revision_id: args.revision_id };
            emit(&api.set_current_revision(actor, TaskId(args.task_id), request)?)
        }
        TaskCommand::Status(args) => {
            let request = SetStatusRequest { status: args.status };
            emit(&api.set_task_status(actor, TaskId(args.task_id), request)?)
        }
        TaskCommand::Delete(args) => emit(&api.delete_task(actor, TaskId(args.task_id))?),
        TaskCommand::Day(args) => {
            emit(&api.task_day_status(actor, TaskId(args.task_id), args.date)?)
        }
    }
}

fn run_entry(command: EntryCommand, api: &TaskLedgerApi, actor: &Actor) -> Result<()> {
    match command {
        EntryCommand::Upsert(args) => {
            let request = UpsertEntryRequest { entry_date: args.date, value: args.value };
            emit(&api.upsert_entry(actor, RequirementId(args.requirement_id), request)?)
        }
        EntryCommand::List(args) => emit(&api.list_entries(
            actor,
            RequirementId(args.requirement_id),
            args.start,
            args.end,
        )?),
    }
}
