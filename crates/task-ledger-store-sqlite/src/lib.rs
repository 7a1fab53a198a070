use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use rusqlite::{
    params, Connection, DatabaseName, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use task_ledger_core::{
    build_tree, derived_flag, evaluate_atom, flatten_draft, format_date, governing_revision,
    parse_date, resolve_revision, validate_revision, AccessScope, Actor, DataType, EntryDraft,
    EntryId, LedgerError, Operator, RequirementDraft, RequirementEntry, RequirementId,
    RequirementKind, RequirementLedger, RequirementSkeleton, RequirementSnapshot, RevisionId,
    TaskDayStatus, TaskDetails, TaskDraft, TaskFilter, TaskId, TaskSkeleton, TaskSnapshot,
    TaskStatus, TaskSummary, UserId,
};
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// `SQLite` VM instructions between deadline checks.
const DEADLINE_CHECK_INTERVAL: i32 = 1_000;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS task_skeletons (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_id INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active', 'archived')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_snapshots (
  revision_id TEXT NOT NULL,
  skeleton_id INTEGER NOT NULL REFERENCES task_skeletons(id) ON DELETE CASCADE,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  created_at TEXT NOT NULL,
  effective_from TEXT NOT NULL,
  is_current INTEGER NOT NULL DEFAULT 0 CHECK (is_current IN (0, 1)),
  activated_at TEXT,
  PRIMARY KEY (revision_id, skeleton_id),
  UNIQUE (revision_id)
);

CREATE TABLE IF NOT EXISTS requirement_skeletons (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id INTEGER NOT NULL REFERENCES task_skeletons(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS requirement_snapshots (
  revision_id TEXT NOT NULL REFERENCES task_snapshots(revision_id) ON DELETE CASCADE,
  skeleton_id INTEGER NOT NULL REFERENCES requirement_skeletons(id) ON DELETE CASCADE,
  parent_id INTEGER,
  title TEXT NOT NULL,
  type TEXT NOT NULL CHECK (type IN ('atom', 'condition')),
  data_type TEXT NOT NULL
    CHECK (data_type IN ('bool', 'int', 'float', 'duration', 'string', 'none')),
  operator TEXT NOT NULL
    CHECK (operator IN ('==', '>=', '>', '<', '<=', 'AND', 'OR', 'NAND', 'NOR')),
  target_value TEXT,
  sort_order INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (revision_id, skeleton_id),
  FOREIGN KEY (revision_id, parent_id)
    REFERENCES requirement_snapshots(revision_id, skeleton_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS requirement_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  requirement_id INTEGER NOT NULL REFERENCES requirement_skeletons(id) ON DELETE CASCADE,
  revision_id TEXT NOT NULL,
  entry_date TEXT NOT NULL,
  value TEXT NOT NULL,
  UNIQUE (requirement_id, entry_date),
  FOREIGN KEY (revision_id, requirement_id)
    REFERENCES requirement_snapshots(revision_id, skeleton_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_task_skeletons_owner ON task_skeletons(owner_id, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_task_snapshots_current
  ON task_snapshots(skeleton_id) WHERE is_current = 1;
CREATE INDEX IF NOT EXISTS idx_task_snapshots_effective
  ON task_snapshots(skeleton_id, effective_from);
CREATE INDEX IF NOT EXISTS idx_requirement_skeletons_task ON requirement_skeletons(task_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_requirement_snapshots_root
  ON requirement_snapshots(revision_id) WHERE parent_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_requirement_snapshots_parent
  ON requirement_snapshots(revision_id, parent_id);
CREATE INDEX IF NOT EXISTS idx_requirement_entries_revision_date
  ON requirement_entries(revision_id, entry_date);
";

const TASK_SNAPSHOT_COLUMNS: &str =
    "revision_id, skeleton_id, title, description, created_at, effective_from, is_current, \
     activated_at";

const REQUIREMENT_SNAPSHOT_COLUMNS: &str =
    "revision_id, skeleton_id, parent_id, title, type, data_type, operator, target_value, \
     sort_order";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed task ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Interrupt any statement still running once `deadline` has passed.
    ///
    /// Interrupted statements fail with `SQLITE_INTERRUPT`, which [`classify_error`] reports
    /// as [`LedgerError::DeadlineExceeded`]. The open transaction is rolled back.
    pub fn set_deadline(&self, deadline: Instant) {
        self.conn
            .progress_handler(DEADLINE_CHECK_INTERVAL, Some(move || Instant::now() >= deadline));
    }

    pub fn clear_deadline(&self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or a migration fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            info!(version = 1, "applied schema migration");
        }

        Ok(())
    }

    /// Create a task owned by `actor` with its first revision, marked current.
    ///
    /// # Errors
    /// Returns [`LedgerError::Forbidden`] for guests, [`LedgerError::Validation`] for a
    /// malformed draft, and storage errors from the write transaction.
    pub fn create_task(&mut self, actor: &Actor, draft: &TaskDraft) -> Result<TaskDetails> {
        let details = self.write("create_task", |tx| {
            actor.scope().authorize_create()?;
            draft.validate()?;

            let created_at = OffsetDateTime::now_utc();
            tx.execute(
                "INSERT INTO task_skeletons(owner_id, status, created_at) VALUES (?1, ?2, ?3)",
                params![actor.user_id.0, TaskStatus::Active.as_str(), rfc3339(created_at)?],
            )
            .context("failed to insert task skeleton")?;
            let task = TaskSkeleton {
                id: TaskId(tx.last_insert_rowid()),
                owner_id: actor.user_id,
                status: TaskStatus::Active,
            };

            insert_revision(tx, task, draft, created_at, true)
        })?;

        info!(
            task_id = %details.task.id,
            revision_id = %details.snapshot.revision_id,
            owner_id = %details.task.owner_id,
            "created task"
        );
        Ok(details)
    }

    /// Append a new revision to an existing task.
    ///
    /// Draft nodes that carry an `id` continue that requirement skeleton; nodes without
    /// one get a fresh skeleton.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for unknown tasks, [`LedgerError::Forbidden`] when
    /// the actor does not own the task, and [`LedgerError::Validation`] for malformed drafts
    /// or ids that belong to another task.
    pub fn revise_task(
        &mut self,
        actor: &Actor,
        task_id: TaskId,
        draft: &TaskDraft,
        make_current: bool,
    ) -> Result<TaskDetails> {
        let details = self.write("revise_task", |tx| {
            let task = owned_task(tx, actor, task_id)?;
            draft.validate()?;
            insert_revision(tx, task, draft, OffsetDateTime::now_utc(), make_current)
        })?;

        info!(
            task_id = %details.task.id,
            revision_id = %details.snapshot.revision_id,
            effective_from = %format_date(details.snapshot.effective_from),
            is_current = details.snapshot.is_current,
            "revised task"
        );
        Ok(details)
    }

    /// Move the current-revision flag of a task to `revision_id`.
    ///
    /// The revision is stamped as activated, so from here on it governs the days from
    /// its `effective_from` that are not already pinned by recorded entries.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the revision does not belong to the task and
    /// [`LedgerError::Forbidden`] when the actor does not own it.
    pub fn set_current_revision(
        &mut self,
        actor: &Actor,
        task_id: TaskId,
        revision_id: RevisionId,
    ) -> Result<TaskSnapshot> {
        let snapshot = self.write("set_current_revision", |tx| {
            let task = owned_task(tx, actor, task_id)?;
            let Some(mut snapshot) = load_task_snapshot(tx, task.id, revision_id)? else {
                return Err(LedgerError::NotFound(format!(
                    "revision {revision_id} does not belong to task {task_id}"
                ))
                .into());
            };

            tx.execute(
                "UPDATE task_snapshots SET is_current = 0
                 WHERE skeleton_id = ?1 AND is_current = 1",
                params![task.id.0],
            )
            .context("failed to clear current revision flag")?;
            let activated_at = OffsetDateTime::now_utc();
            tx.execute(
                "UPDATE task_snapshots SET is_current = 1, activated_at = ?3
                 WHERE skeleton_id = ?1 AND revision_id = ?2",
                params![task.id.0, revision_id.to_string(), rfc3339(activated_at)?],
            )
            .context("failed to set current revision flag")?;

            snapshot.is_current = true;
            snapshot.activated_at = Some(activated_at);
            Ok(snapshot)
        })?;

        info!(task_id = %task_id, revision_id = %revision_id, "moved current revision");
        Ok(snapshot)
    }

    /// Archive or reactivate a task.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] or [`LedgerError::Forbidden`] as for other writes.
    pub fn set_task_status(
        &mut self,
        actor: &Actor,
        task_id: TaskId,
        status: TaskStatus,
    ) -> Result<TaskSkeleton> {
        self.write("set_task_status", |tx| {
            let mut task = owned_task(tx, actor, task_id)?;
            tx.execute(
                "UPDATE task_skeletons SET status = ?1 WHERE id = ?2",
                params![status.as_str(), task.id.0],
            )
            .context("failed to update task status")?;
            task.status = status;
            debug!(task_id = %task.id, status = status.as_str(), "updated task status");
            Ok(task)
        })
    }

    /// Delete a task with every revision, requirement and entry under it.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] or [`LedgerError::Forbidden`] as for other writes.
    pub fn delete_task(&mut self, actor: &Actor, task_id: TaskId) -> Result<()> {
        self.write("delete_task", |tx| {
            let task = owned_task(tx, actor, task_id)?;
            tx.execute("DELETE FROM task_skeletons WHERE id = ?1", params![task.id.0])
                .context("failed to delete task")?;
            Ok(())
        })?;
        info!(task_id = %task_id, "deleted task");
        Ok(())
    }

    /// Record a leaf value and recompute its ancestors, all in one immediate transaction.
    ///
    /// Returns the written entries, leaf first and root last.
    ///
    /// # Errors
    /// Returns the typed [`LedgerError`] raised by the propagation walk, or a storage error.
    /// Nothing is written on failure.
    pub fn upsert_leaf_entry(
        &mut self,
        actor: &Actor,
        draft: &EntryDraft,
    ) -> Result<Vec<RequirementEntry>> {
        let updated = self.write("upsert_leaf_entry", |tx| {
            task_ledger_core::upsert_leaf_entry(&mut LedgerTx { conn: tx }, actor, draft)
        })?;

        info!(
            requirement_id = %draft.requirement_id,
            entry_date = %format_date(draft.entry_date),
            updated_nodes = updated.len(),
            "recorded leaf entry"
        );
        Ok(updated)
    }

    /// Load a task with the revision governing `as_of`, or the current revision.
    ///
    /// Tasks outside the actor's scope are reported as missing.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the task is missing or not visible.
    pub fn get_task(
        &self,
        actor: &Actor,
        task_id: TaskId,
        as_of: Option<Date>,
    ) -> Result<TaskDetails> {
        let task = visible_task(&self.conn, actor, task_id)?;
        let revisions = load_task_snapshots(&self.conn, task.id)?;
        let governing = match as_of {
            Some(date) => resolve_revision(&revisions, date),
            None => revisions.iter().find(|snapshot| snapshot.is_current).or_else(|| {
                resolve_revision(&revisions, OffsetDateTime::now_utc().date())
            }),
        };
        let Some(snapshot) = governing.cloned() else {
            return Err(LedgerError::NotFound(format!("task {task_id} has no revisions")).into());
        };

        let snapshots = load_revision_requirements(&self.conn, snapshot.revision_id)?;
        let requirements = build_tree(snapshots)?;
        debug!(task_id = %task.id, revision_id = %snapshot.revision_id, "loaded task");
        Ok(TaskDetails { task, snapshot, requirements })
    }

    /// List tasks visible to `actor` with their current revisions.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tasks(&self, actor: &Actor, filter: TaskFilter) -> Result<Vec<TaskSummary>> {
        let owner = match actor.scope() {
            AccessScope::All => None,
            AccessScope::Owner(user_id) => Some(user_id.0),
            AccessScope::Nothing => return Ok(Vec::new()),
        };
        let statuses = filter.statuses();

        let mut stmt = self.conn.prepare(
            "SELECT
                t.id, t.owner_id, t.status,
                s.revision_id, s.skeleton_id, s.title, s.description, s.created_at,
                s.effective_from, s.is_current, s.activated_at
             FROM task_skeletons t
             JOIN task_snapshots s ON s.skeleton_id = t.id AND s.is_current = 1
             WHERE (?1 IS NULL OR t.owner_id = ?1)
             ORDER BY t.id ASC",
        )?;
        let mut rows = stmt.query(params![owner])?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            let task = task_skeleton_from_row(row)?;
            if !statuses.contains(&task.status) {
                continue;
            }
            tasks.push(TaskSummary { task, current: task_snapshot_from_row(row, 3)? });
        }

        Ok(tasks)
    }

    /// All revisions of a task, oldest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the task is missing or not visible.
    pub fn list_revisions(&self, actor: &Actor, task_id: TaskId) -> Result<Vec<TaskSnapshot>> {
        let task = visible_task(&self.conn, actor, task_id)?;
        let mut revisions = load_task_snapshots(&self.conn, task.id)?;
        revisions.sort_by(|lhs, rhs| {
            lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.revision_id.cmp(&rhs.revision_id))
        });
        Ok(revisions)
    }

    /// Entries of one requirement between `start` and `end`, both inclusive.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `start` is after `end` and
    /// [`LedgerError::NotFound`] when the requirement is missing or not visible.
    pub fn list_entries(
        &self,
        actor: &Actor,
        requirement_id: RequirementId,
        start: Date,
        end: Date,
    ) -> Result<Vec<RequirementEntry>> {
        if start > end {
            return Err(LedgerError::Validation(format!(
                "start date {} is after end date {}",
                format_date(start),
                format_date(end)
            ))
            .into());
        }
        let not_found = || LedgerError::NotFound(format!("requirement {requirement_id} not found"));
        let requirement =
            load_requirement_skeleton(&self.conn, requirement_id)?.ok_or_else(not_found)?;
        let visible = load_task_skeleton(&self.conn, requirement.task_id)?
            .is_some_and(|task| actor.scope().permits(task.owner_id));
        if !visible {
            return Err(not_found().into());
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, requirement_id, revision_id, entry_date, value
             FROM requirement_entries
             WHERE requirement_id = ?1 AND entry_date BETWEEN ?2 AND ?3
             ORDER BY entry_date ASC",
        )?;
        let mut rows =
            stmt.query(params![requirement.id.0, format_date(start), format_date(end)])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    /// Whether a task was satisfied on `date`, with every node's entry for that day.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the task is missing, not visible or has no
    /// revisions.
    pub fn task_day_status(
        &self,
        actor: &Actor,
        task_id: TaskId,
        date: Date,
    ) -> Result<TaskDayStatus> {
        let task = visible_task(&self.conn, actor, task_id)?;
        let revisions = load_task_snapshots(&self.conn, task.id)?;
        let pinned = load_pinned_revision(&self.conn, task.id, date)?;
        let Some(governing) = governing_revision(&revisions, pinned, date) else {
            return Err(LedgerError::NotFound(format!("task {task_id} has no revisions")).into());
        };
        let revision_id = governing.revision_id;

        let requirements = load_revision_requirements(&self.conn, revision_id)?;
        let root_id = validate_revision(&requirements)?;
        let ids = requirements.iter().map(|snapshot| snapshot.skeleton_id).collect::<Vec<_>>();
        let entries = load_entries_on(&self.conn, revision_id, &ids, date)?;

        let root = requirements.iter().find(|snapshot| snapshot.skeleton_id == root_id);
        let root_entry = entries.iter().find(|entry| entry.requirement_id == root_id);
        let satisfied = match (root, root_entry) {
            (Some(snapshot), Some(entry)) if snapshot.kind == RequirementKind::Atom => {
                evaluate_atom(snapshot, entry).map_err(LedgerError::from)?
            }
            (Some(_), Some(entry)) => derived_flag(entry)?,
            _ => false,
        };

        Ok(TaskDayStatus { task_id: task.id, revision_id, date, satisfied, entries })
    }

    /// One requirement definition as it stood in `revision_id`.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn requirement_snapshot(
        &self,
        revision_id: RevisionId,
        requirement_id: RequirementId,
    ) -> Result<Option<RequirementSnapshot>> {
        load_requirement_snapshot(&self.conn, revision_id, requirement_id)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))?;
        info!(path = %out_file.display(), "wrote database backup");
        Ok(())
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;
        info!(path = %in_file.display(), "restored database backup");

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn write<T, F>(&mut self, operation: &'static str, body: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start {operation} transaction"))?;

        let value = match body(&tx) {
            Ok(value) => value,
            Err(err) => {
                if let Some(rejection) = err.downcast_ref::<LedgerError>() {
                    warn!(operation, code = rejection.code(), error = %rejection, "rejected write");
                }
                return Err(err);
            }
        };

        tx.commit().with_context(|| format!("failed to commit {operation} transaction"))?;
        Ok(value)
    }
}

/// Surface interrupted statements and unique-key collisions as typed ledger errors.
///
/// Errors that already carry a [`LedgerError`] and unrelated failures pass through.
#[must_use]
pub fn classify_error(err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<LedgerError>().is_some() {
        return err;
    }
    let Some(rusqlite::Error::SqliteFailure(failure, _)) =
        err.chain().find_map(|cause| cause.downcast_ref::<rusqlite::Error>())
    else {
        return err;
    };
    let (code, extended_code) = (failure.code, failure.extended_code);

    match code {
        ErrorCode::OperationInterrupted => {
            LedgerError::DeadlineExceeded(format!("{err:#}")).into()
        }
        ErrorCode::ConstraintViolation
            if extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            LedgerError::Duplicate(format!("{err:#}")).into()
        }
        _ => err,
    }
}

/// The propagation walk's view of one open write transaction.
struct LedgerTx<'a> {
    conn: &'a Connection,
}

impl RequirementLedger for LedgerTx<'_> {
    type Error = anyhow::Error;

    fn requirement_skeleton(&self, id: RequirementId) -> Result<Option<RequirementSkeleton>> {
        load_requirement_skeleton(self.conn, id)
    }

    fn task_skeleton(&self, id: TaskId) -> Result<Option<TaskSkeleton>> {
        load_task_skeleton(self.conn, id)
    }

    fn task_revisions(&self, task_id: TaskId) -> Result<Vec<TaskSnapshot>> {
        load_task_snapshots(self.conn, task_id)
    }

    fn pinned_revision(&self, task_id: TaskId, date: Date) -> Result<Option<RevisionId>> {
        load_pinned_revision(self.conn, task_id, date)
    }

    fn requirement_snapshot(
        &self,
        revision_id: RevisionId,
        id: RequirementId,
    ) -> Result<Option<RequirementSnapshot>> {
        load_requirement_snapshot(self.conn, revision_id, id)
    }

    fn children(
        &self,
        revision_id: RevisionId,
        parent_id: RequirementId,
    ) -> Result<Vec<RequirementSnapshot>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {REQUIREMENT_SNAPSHOT_COLUMNS} FROM requirement_snapshots
             WHERE revision_id = ?1 AND parent_id = ?2
             ORDER BY sort_order ASC, skeleton_id ASC"
        ))?;
        let mut rows = stmt.query(params![revision_id.to_string(), parent_id.0])?;
        let mut children = Vec::new();
        while let Some(row) = rows.next()? {
            children.push(requirement_snapshot_from_row(row)?);
        }
        Ok(children)
    }

    fn entries_on(
        &self,
        revision_id: RevisionId,
        ids: &[RequirementId],
        date: Date,
    ) -> Result<Vec<RequirementEntry>> {
        load_entries_on(self.conn, revision_id, ids, date)
    }

    fn upsert_entry(
        &mut self,
        revision_id: RevisionId,
        requirement_id: RequirementId,
        date: Date,
        value: &str,
    ) -> Result<RequirementEntry> {
        let (id, stored_requirement, stored_revision, stored_date, stored_value) = self
            .conn
            .query_row(
                "INSERT INTO requirement_entries(requirement_id, revision_id, entry_date, value)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(requirement_id, entry_date) DO UPDATE SET
                   revision_id = excluded.revision_id,
                   value = excluded.value
                 RETURNING id, requirement_id, revision_id, entry_date, value",
                params![requirement_id.0, revision_id.to_string(), format_date(date), value],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .with_context(|| format!("failed to upsert entry for requirement {requirement_id}"))?;

        debug!(requirement_id = %requirement_id, entry_id = id, value, "upserted entry");
        Ok(RequirementEntry {
            id: EntryId(id),
            requirement_id: RequirementId(stored_requirement),
            revision_id: parse_revision_id(&stored_revision)?,
            entry_date: parse_stored_date(&stored_date)?,
            value: stored_value,
        })
    }
}

fn insert_revision(
    tx: &Transaction<'_>,
    task: TaskSkeleton,
    draft: &TaskDraft,
    created_at: OffsetDateTime,
    make_current: bool,
) -> Result<TaskDetails> {
    let revision_id = RevisionId::new();
    let snapshot = TaskSnapshot {
        revision_id,
        skeleton_id: task.id,
        title: draft.title.trim().to_string(),
        description: draft.description.clone(),
        created_at,
        effective_from: draft.effective_from.unwrap_or_else(|| created_at.date()),
        is_current: make_current,
        activated_at: make_current.then_some(created_at),
    };

    if make_current {
        tx.execute(
            "UPDATE task_snapshots SET is_current = 0 WHERE skeleton_id = ?1 AND is_current = 1",
            params![task.id.0],
        )
        .context("failed to clear current revision flag")?;
    }
    tx.execute(
        &format!(
            "INSERT INTO task_snapshots({TASK_SNAPSHOT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            revision_id.to_string(),
            task.id.0,
            snapshot.title,
            snapshot.description,
            rfc3339(created_at)?,
            format_date(snapshot.effective_from),
            snapshot.is_current,
            snapshot.activated_at.map(rfc3339).transpose()?,
        ],
    )
    .context("failed to insert task snapshot")?;

    let requirements = flatten_draft(&draft.requirement, revision_id, |node| {
        assign_requirement_skeleton(tx, task.id, node)
    })?;
    validate_revision(&requirements)?;

    for requirement in &requirements {
        tx.execute(
            &format!(
                "INSERT INTO requirement_snapshots({REQUIREMENT_SNAPSHOT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                revision_id.to_string(),
                requirement.skeleton_id.0,
                requirement.parent_id.map(|id| id.0),
                requirement.title,
                requirement.kind.as_str(),
                requirement.data_type.as_str(),
                requirement.operator.as_str(),
                requirement.target_value,
                requirement.sort_order,
            ],
        )
        .with_context(|| {
            format!("failed to insert snapshot of requirement {}", requirement.skeleton_id)
        })?;
    }
    debug!(
        task_id = %task.id,
        revision_id = %revision_id,
        requirements = requirements.len(),
        "inserted task revision"
    );

    Ok(TaskDetails { task, snapshot, requirements: build_tree(requirements)? })
}

fn assign_requirement_skeleton(
    conn: &Connection,
    task_id: TaskId,
    node: &RequirementDraft,
) -> Result<RequirementId> {
    if let Some(id) = node.id {
        return match load_requirement_skeleton(conn, id)? {
            Some(skeleton) if skeleton.task_id == task_id => Ok(skeleton.id),
            _ => Err(LedgerError::Validation(format!(
                "requirement {id} does not belong to task {task_id}"
            ))
            .into()),
        };
    }

    conn.execute("INSERT INTO requirement_skeletons(task_id) VALUES (?1)", params![task_id.0])
        .context("failed to insert requirement skeleton")?;
    Ok(RequirementId(conn.last_insert_rowid()))
}

fn owned_task(conn: &Connection, actor: &Actor, task_id: TaskId) -> Result<TaskSkeleton> {
    let Some(task) = load_task_skeleton(conn, task_id)? else {
        return Err(LedgerError::NotFound(format!("task {task_id} not found")).into());
    };
    actor.scope().authorize(task.owner_id)?;
    Ok(task)
}

fn visible_task(conn: &Connection, actor: &Actor, task_id: TaskId) -> Result<TaskSkeleton> {
    match load_task_skeleton(conn, task_id)? {
        Some(task) if actor.scope().permits(task.owner_id) => Ok(task),
        _ => Err(LedgerError::NotFound(format!("task {task_id} not found")).into()),
    }
}

fn load_task_skeleton(conn: &Connection, id: TaskId) -> Result<Option<TaskSkeleton>> {
    let mut stmt =
        conn.prepare_cached("SELECT id, owner_id, status FROM task_skeletons WHERE id = ?1")?;
    let mut rows = stmt.query(params![id.0])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    task_skeleton_from_row(row).map(Some)
}

fn load_task_snapshots(conn: &Connection, task_id: TaskId) -> Result<Vec<TaskSnapshot>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_SNAPSHOT_COLUMNS} FROM task_snapshots
         WHERE skeleton_id = ?1
         ORDER BY effective_from ASC, revision_id ASC"
    ))?;
    let mut rows = stmt.query(params![task_id.0])?;
    let mut snapshots = Vec::new();
    while let Some(row) = rows.next()? {
        snapshots.push(task_snapshot_from_row(row, 0)?);
    }
    Ok(snapshots)
}

fn load_task_snapshot(
    conn: &Connection,
    task_id: TaskId,
    revision_id: RevisionId,
) -> Result<Option<TaskSnapshot>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_SNAPSHOT_COLUMNS} FROM task_snapshots
         WHERE skeleton_id = ?1 AND revision_id = ?2"
    ))?;
    let mut rows = stmt.query(params![task_id.0, revision_id.to_string()])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    task_snapshot_from_row(row, 0).map(Some)
}

/// Revision under which the task's entries for `date` were recorded.
fn load_pinned_revision(
    conn: &Connection,
    task_id: TaskId,
    date: Date,
) -> Result<Option<RevisionId>> {
    let revision = conn
        .prepare_cached(
            "SELECT e.revision_id
             FROM requirement_entries e
             JOIN requirement_skeletons s ON s.id = e.requirement_id
             WHERE s.task_id = ?1 AND e.entry_date = ?2
             ORDER BY e.id ASC
             LIMIT 1",
        )?
        .query_row(params![task_id.0, format_date(date)], |row| row.get::<_, String>(0))
        .optional()
        .with_context(|| format!("failed to load pinned revision of task {task_id}"))?;
    revision.as_deref().map(parse_revision_id).transpose()
}

fn load_requirement_skeleton(
    conn: &Connection,
    id: RequirementId,
) -> Result<Option<RequirementSkeleton>> {
    conn.prepare_cached("SELECT id, task_id FROM requirement_skeletons WHERE id = ?1")?
        .query_row(params![id.0], |row| {
            Ok(RequirementSkeleton { id: RequirementId(row.get(0)?), task_id: TaskId(row.get(1)?) })
        })
        .optional()
        .with_context(|| format!("failed to load requirement skeleton {id}"))
}

fn load_requirement_snapshot(
    conn: &Connection,
    revision_id: RevisionId,
    id: RequirementId,
) -> Result<Option<RequirementSnapshot>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REQUIREMENT_SNAPSHOT_COLUMNS} FROM requirement_snapshots
         WHERE revision_id = ?1 AND skeleton_id = ?2"
    ))?;
    let mut rows = stmt.query(params![revision_id.to_string(), id.0])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    requirement_snapshot_from_row(row).map(Some)
}

fn load_revision_requirements(
    conn: &Connection,
    revision_id: RevisionId,
) -> Result<Vec<RequirementSnapshot>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REQUIREMENT_SNAPSHOT_COLUMNS} FROM requirement_snapshots
         WHERE revision_id = ?1
         ORDER BY skeleton_id ASC"
    ))?;
    let mut rows = stmt.query(params![revision_id.to_string()])?;
    let mut snapshots = Vec::new();
    while let Some(row) = rows.next()? {
        snapshots.push(requirement_snapshot_from_row(row)?);
    }
    Ok(snapshots)
}

fn load_entries_on(
    conn: &Connection,
    revision_id: RevisionId,
    ids: &[RequirementId],
    date: Date,
) -> Result<Vec<RequirementEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, requirement_id, revision_id, entry_date, value
         FROM requirement_entries
         WHERE requirement_id = ?1 AND revision_id = ?2 AND entry_date = ?3",
    )?;
    let revision = revision_id.to_string();
    let day = format_date(date);

    let mut entries = Vec::new();
    for id in ids {
        let mut rows = stmt.query(params![id.0, revision, day])?;
        if let Some(row) = rows.next()? {
            entries.push(entry_from_row(row)?);
        }
    }
    Ok(entries)
}

fn task_skeleton_from_row(row: &Row<'_>) -> Result<TaskSkeleton> {
    let status_raw: String = row.get(2)?;
    Ok(TaskSkeleton {
        id: TaskId(row.get(0)?),
        owner_id: UserId(row.get(1)?),
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown task status: {status_raw}"))?,
    })
}

fn task_snapshot_from_row(row: &Row<'_>, offset: usize) -> Result<TaskSnapshot> {
    Ok(TaskSnapshot {
        revision_id: parse_revision_id(&row.get::<_, String>(offset)?)?,
        skeleton_id: TaskId(row.get(offset + 1)?),
        title: row.get(offset + 2)?,
        description: row.get(offset + 3)?,
        created_at: parse_rfc3339(&row.get::<_, String>(offset + 4)?)?,
        effective_from: parse_stored_date(&row.get::<_, String>(offset + 5)?)?,
        is_current: row.get(offset + 6)?,
        activated_at: row
            .get::<_, Option<String>>(offset + 7)?
            .as_deref()
            .map(parse_rfc3339)
            .transpose()?,
    })
}

fn requirement_snapshot_from_row(row: &Row<'_>) -> Result<RequirementSnapshot> {
    let kind_raw: String = row.get(4)?;
    let data_type_raw: String = row.get(5)?;
    let operator_raw: String = row.get(6)?;
    Ok(RequirementSnapshot {
        revision_id: parse_revision_id(&row.get::<_, String>(0)?)?,
        skeleton_id: RequirementId(row.get(1)?),
        parent_id: row.get::<_, Option<i64>>(2)?.map(RequirementId),
        title: row.get(3)?,
        kind: RequirementKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown requirement type: {kind_raw}"))?,
        data_type: DataType::parse(&data_type_raw)
            .ok_or_else(|| anyhow!("unknown data type: {data_type_raw}"))?,
        operator: Operator::parse(&operator_raw)
            .ok_or_else(|| anyhow!("unknown operator: {operator_raw}"))?,
        target_value: row.get(7)?,
        sort_order: row.get(8)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> Result<RequirementEntry> {
    Ok(RequirementEntry {
        id: EntryId(row.get(0)?),
        requirement_id: RequirementId(row.get(1)?),
        revision_id: parse_revision_id(&row.get::<_, String>(2)?)?,
        entry_date: parse_stored_date(&row.get::<_, String>(3)?)?,
        value: row.get(4)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_revision_id(raw: &str) -> Result<RevisionId> {
    let id = Ulid::from_string(raw).with_context(|| format!("invalid revision id: {raw}"))?;
    Ok(RevisionId(id))
}

// Stored dates are trusted; a bad one is corruption, not a caller mistake.
fn parse_stored_date(raw: &str) -> Result<Date> {
    parse_date(raw).map_err(|err| anyhow!("corrupt stored date {raw:?}: {err}"))
}
