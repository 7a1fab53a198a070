use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use task_ledger_core::{
    iso_date, Actor, EntryDraft, LedgerError, RequirementEntry, RequirementId, RevisionId,
    TaskDayStatus, TaskDetails, TaskDraft, TaskFilter, TaskId, TaskSkeleton, TaskSnapshot,
    TaskStatus, TaskSummary,
};
use task_ledger_store_sqlite::{classify_error, SchemaStatus, SqliteStore};
use time::Date;
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviseTaskRequest {
    #[serde(flatten)]
    pub draft: TaskDraft,
    #[serde(default = "default_make_current")]
    pub make_current: bool,
}

fn default_make_current() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetCurrentRevisionRequest {
    pub revision_id: RevisionId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetStatusRequest {
    pub status: TaskStatus,
}

/// A leaf measurement addressed to the requirement named in the path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertEntryRequest {
    #[serde(with = "iso_date")]
    pub entry_date: Date,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertEntryResult {
    pub requirement_id: RequirementId,
    /// Written entries, leaf first and root last.
    pub updated: Vec<RequirementEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteTaskResult {
    pub task_id: TaskId,
    pub deleted: bool,
}

/// Recover the typed ledger failure carried by an API error, if any.
#[must_use]
pub fn ledger_error(err: &anyhow::Error) -> Option<&LedgerError> {
    err.downcast_ref::<LedgerError>()
}

#[derive(Debug, Clone)]
pub struct TaskLedgerApi {
    db_path: PathBuf,
    request_timeout: Duration,
}

impl TaskLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let store = SqliteStore::open(&self.db_path)?;
        store.set_deadline(Instant::now() + self.request_timeout);
        Ok(store)
    }

    fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteStore) -> Result<T>,
    {
        debug!(operation, db = %self.db_path.display(), "api call");
        let outcome = self.open_store().and_then(|mut store| {
            store.migrate()?;
            call(&mut store)
        });
        outcome.map_err(classify_error)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status().map_err(classify_error)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate().map_err(classify_error)?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create a task owned by `actor`.
    ///
    /// # Errors
    /// Returns `Forbidden` for guests, `Validation` for malformed drafts, or storage errors.
    pub fn create_task(&self, actor: &Actor, draft: &TaskDraft) -> Result<TaskDetails> {
        self.run("create_task", |store| store.create_task(actor, draft))
    }

    /// Append a revision to a task the actor owns.
    ///
    /// # Errors
    /// Returns `NotFound`, `Forbidden` or `Validation` as typed [`LedgerError`] values.
    pub fn revise_task(
        &self,
        actor: &Actor,
        task_id: TaskId,
        request: &ReviseTaskRequest,
    ) -> Result<TaskDetails> {
        self.run("revise_task", |store| {
            store.revise_task(actor, task_id, &request.draft, request.make_current)
        })
    }

    /// Load one task as of a date, or at its current revision.
    ///
    /// # Errors
    /// Returns `NotFound` when the task does not exist or is outside the actor's scope.
    pub fn get_task(
        &self,
        actor: &Actor,
        task_id: TaskId,
        as_of: Option<Date>,
    ) -> Result<TaskDetails> {
        self.run("get_task", |store| store.get_task(actor, task_id, as_of))
    }

    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_tasks(&self, actor: &Actor, filter: TaskFilter) -> Result<Vec<TaskSummary>> {
        self.run("list_tasks", |store| store.list_tasks(actor, filter))
    }

    /// # Errors
    /// Returns `NotFound` when the task is missing or not visible.
    pub fn list_revisions(&self, actor: &Actor, task_id: TaskId) -> Result<Vec<TaskSnapshot>> {
        self.run("list_revisions", |store| store.list_revisions(actor, task_id))
    }

    /// # Errors
    /// Returns `NotFound` for revisions of other tasks and `Forbidden` for non-owners.
    pub fn set_current_revision(
        &self,
        actor: &Actor,
        task_id: TaskId,
        request: SetCurrentRevisionRequest,
    ) -> Result<TaskSnapshot> {
        self.run("set_current_revision", |store| {
            store.set_current_revision(actor, task_id, request.revision_id)
        })
    }

    /// # Errors
    /// Returns `NotFound` or `Forbidden` as typed [`LedgerError`] values.
    pub fn set_task_status(
        &self,
        actor: &Actor,
        task_id: TaskId,
        request: SetStatusRequest,
    ) -> Result<TaskSkeleton> {
        self.run("set_task_status", |store| store.set_task_status(actor, task_id, request.status))
    }

    /// # Errors
    /// Returns `NotFound` or `Forbidden` as typed [`LedgerError`] values.
    pub fn delete_task(&self, actor: &Actor, task_id: TaskId) -> Result<DeleteTaskResult> {
        self.run("delete_task", |store| store.delete_task(actor, task_id))?;
        Ok(DeleteTaskResult { task_id, deleted: true })
    }

    /// # Errors
    /// Returns `NotFound` when the task is missing, not visible, or has no revisions.
    pub fn task_day_status(
        &self,
        actor: &Actor,
        task_id: TaskId,
        date: Date,
    ) -> Result<TaskDayStatus> {
        self.run("task_day_status", |store| store.task_day_status(actor, task_id, date))
    }

    /// Record a leaf measurement and propagate it up the requirement tree.
    ///
    /// # Errors
    /// Returns the typed [`LedgerError`] raised by the write path, or a storage error.
    pub fn upsert_entry(
        &self,
        actor: &Actor,
        requirement_id: RequirementId,
        request: UpsertEntryRequest,
    ) -> Result<UpsertEntryResult> {
        let draft =
            EntryDraft { requirement_id, entry_date: request.entry_date, value: request.value };
        let updated = self.run("upsert_entry", |store| store.upsert_leaf_entry(actor, &draft))?;
        Ok(UpsertEntryResult { requirement_id, updated })
    }

    /// # Errors
    /// Returns `Validation` for reversed ranges and `NotFound` for invisible requirements.
    pub fn list_entries(
        &self,
        actor: &Actor,
        requirement_id: RequirementId,
        start: Date,
        end: Date,
    ) -> Result<Vec<RequirementEntry>> {
        self.run("list_entries", |store| store.list_entries(actor, requirement_id, start, end))
    }
}
