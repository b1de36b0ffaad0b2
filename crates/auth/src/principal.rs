use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored user account, identified by its immutable `name`.
#[derive(Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl core::fmt::Debug for Principal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Principal")
            .field("name", &self.name)
            .field("full_name", &self.full_name)
            .field("email", &self.email)
            .field("password_changed_at", &self.password_changed_at)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Principal as shown to clients (no password hash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalProfile {
    pub name: String,
    pub full_name: String,
    pub email: String,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&Principal> for PrincipalProfile {
    fn from(value: &Principal) -> Self {
        Self {
            name: value.name.clone(),
            full_name: value.full_name.clone(),
            email: value.email.clone(),
            password_changed_at: value.password_changed_at,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPrincipal {
    pub name: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalUpdate {
    pub name: String,
    pub hashed_password: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub full_name: Option<String>,
    pub email: Option<String>,
}
