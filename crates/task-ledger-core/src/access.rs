use serde::{Deserialize, Serialize};

use crate::{LedgerError, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Guest,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Guest => "guest",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }
}

/// The authenticated principal a request acts on behalf of.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    #[must_use]
    pub fn scope(&self) -> AccessScope {
        match self.role {
            Role::Admin => AccessScope::All,
            Role::User => AccessScope::Owner(self.user_id),
            Role::Guest => AccessScope::Nothing,
        }
    }
}

/// Rows an actor may see or change, expressed once for both read filters and write checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "owner_id", rename_all = "snake_case")]
pub enum AccessScope {
    All,
    Owner(UserId),
    Nothing,
}

impl AccessScope {
    #[must_use]
    pub fn permits(self, owner_id: UserId) -> bool {
        match self {
            Self::All => true,
            Self::Owner(user_id) => user_id == owner_id,
            Self::Nothing => false,
        }
    }

    /// Gate a mutation of a row owned by `owner_id`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Forbidden`] when the scope does not cover the owner.
    pub fn authorize(self, owner_id: UserId) -> Result<(), LedgerError> {
        if self.permits(owner_id) {
            return Ok(());
        }
        Err(LedgerError::Forbidden(match self {
            Self::Nothing => "guests cannot modify tasks".to_string(),
            _ => format!("user doesn't own this task (owner {owner_id})"),
        }))
    }

    /// Gate creation of new rows.
    ///
    /// # Errors
    /// Returns [`LedgerError::Forbidden`] for the empty scope.
    pub fn authorize_create(self) -> Result<(), LedgerError> {
        if self == Self::Nothing {
            return Err(LedgerError::Forbidden("guests cannot create tasks".to_string()));
        }
        Ok(())
    }
}
