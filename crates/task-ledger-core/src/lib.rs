use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

mod access;
mod eval;
mod propagate;
mod revision;
mod tree;
mod value;

pub use access::{AccessScope, Actor, Role};
pub use eval::{evaluate, evaluate_atom, evaluate_named, EvalError};
pub use propagate::{
    derived_flag, recompute_condition, upsert_leaf_entry, RequirementLedger,
    MAX_PROPAGATION_DEPTH,
};
pub use revision::{governing_revision, resolve_revision};
pub use tree::{
    build_tree, flatten_draft, validate_revision, RequirementDraft, RequirementNode, MAX_TREE_DEPTH,
};
pub use value::{
    normalize_duration, parse_bool, parse_duration, parse_value, validate_value,
    validate_value_named, TypeError, Value,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("evaluation error: {0}")]
    Eval(#[from] EvalError),
    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Stable machine-readable error code used by the service and CLI envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Validation(_) => "validation_error",
            Self::Duplicate(_) => "duplicate",
            Self::Eval(_) => "eval_error",
            Self::UnsupportedDataType(_) => "unsupported_data_type",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<TypeError> for LedgerError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::UnsupportedDataType(name) => Self::UnsupportedDataType(name),
            malformed @ TypeError::Malformed { .. } => Self::Validation(malformed.to_string()),
        }
    }
}

macro_rules! integer_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(TaskId);
integer_id!(RequirementId);
integer_id!(UserId);
integer_id!(EntryId);

/// Groups one task snapshot with the requirement snapshots defined alongside it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RevisionId(pub Ulid);

impl RevisionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RevisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RevisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Archived,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Atom,
    Condition,
}

impl RequirementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Atom => "atom",
            Self::Condition => "condition",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "atom" => Some(Self::Atom),
            "condition" => Some(Self::Condition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int,
    Float,
    Duration,
    String,
    None,
}

impl DataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Duration => "duration",
            Self::String => "string",
            Self::None => "none",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bool" => Some(Self::Bool),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "duration" => Some(Self::Duration),
            "string" => Some(Self::String),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Whether `>=`, `>`, `<` and `<=` are defined over values of this type.
    #[must_use]
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Int | Self::Duration)
    }
}

/// The closed operator set. Boolean operators parse case-insensitively.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    Eq,
    Ge,
    Gt,
    Lt,
    Le,
    And,
    Or,
    Nand,
    Nor,
}

impl Operator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Nand => "NAND",
            Self::Nor => "NOR",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "==" => Some(Self::Eq),
            ">=" => Some(Self::Ge),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "AND" => Some(Self::And),
            "OR" => Some(Self::Or),
            "NAND" => Some(Self::Nand),
            "NOR" => Some(Self::Nor),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_boolean(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Nand | Self::Nor)
    }

    #[must_use]
    pub fn is_comparison(self) -> bool {
        !self.is_boolean()
    }

    #[must_use]
    pub fn is_ordering(self) -> bool {
        matches!(self, Self::Ge | Self::Gt | Self::Lt | Self::Le)
    }
}

impl TryFrom<String> for Operator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unsupported operator: {value}"))
    }
}

impl From<Operator> for String {
    fn from(value: Operator) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskSkeleton {
    pub id: TaskId,
    pub owner_id: UserId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskSnapshot {
    pub revision_id: RevisionId,
    pub skeleton_id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// First calendar day this revision governs.
    #[serde(with = "iso_date")]
    pub effective_from: Date,
    pub is_current: bool,
    /// When this revision was last made current. Staged revisions that were never
    /// made current carry `None` and govern no day.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub activated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequirementSkeleton {
    pub id: RequirementId,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequirementSnapshot {
    pub revision_id: RevisionId,
    pub skeleton_id: RequirementId,
    pub parent_id: Option<RequirementId>,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: RequirementKind,
    pub data_type: DataType,
    pub operator: Operator,
    pub target_value: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequirementEntry {
    pub id: EntryId,
    pub requirement_id: RequirementId,
    pub revision_id: RevisionId,
    #[serde(with = "iso_date")]
    pub entry_date: Date,
    pub value: String,
}

/// A leaf measurement as submitted, before the governing revision is stamped on it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntryDraft {
    pub requirement_id: RequirementId,
    #[serde(with = "iso_date")]
    pub entry_date: Date,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, with = "iso_date::option")]
    pub effective_from: Option<Date>,
    pub requirement: RequirementDraft,
}

impl TaskDraft {
    /// Validate the task-level fields and the full requirement tree.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the title is blank or the tree is malformed.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.title.trim().is_empty() {
            return Err(LedgerError::Validation("task title MUST be non-empty".to_string()));
        }
        self.requirement.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDetails {
    pub task: TaskSkeleton,
    pub snapshot: TaskSnapshot,
    pub requirements: RequirementNode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSummary {
    pub task: TaskSkeleton,
    pub current: TaskSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TaskFilter {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub archived: bool,
}

impl TaskFilter {
    /// Statuses selected by this filter; an empty filter selects active tasks.
    #[must_use]
    pub fn statuses(self) -> Vec<TaskStatus> {
        let mut statuses = Vec::new();
        if self.active || !self.archived {
            statuses.push(TaskStatus::Active);
        }
        if self.archived {
            statuses.push(TaskStatus::Archived);
        }
        statuses
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDayStatus {
    pub task_id: TaskId,
    pub revision_id: RevisionId,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub satisfied: bool,
    pub entries: Vec<RequirementEntry>,
}

/// Parse a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the input is not a valid calendar date.
pub fn parse_date(raw: &str) -> Result<Date, LedgerError> {
    Date::parse(raw.trim(), time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|err| LedgerError::Validation(format!("invalid date {raw:?}: {err}")))
}

#[must_use]
pub fn format_date(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Serde adapter for `YYYY-MM-DD` dates.
pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S>(date: &Date, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_date(*date))
    }

    /// # Errors
    /// Fails when the input is not a `YYYY-MM-DD` string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Date, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        /// # Errors
        /// Propagates serializer failures.
        pub fn serialize<S>(date: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match date {
                Some(date) => serializer.serialize_some(&crate::format_date(*date)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Fails when a present value is not a `YYYY-MM-DD` string.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Date>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| crate::parse_date(&value).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
