//! In-memory storage collaborators for tests and local development.
//!
//! Mirrors the relational constraints the Postgres adapter relies on: the
//! principal name is the primary key, emails are unique, and a session must
//! reference an existing principal.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use snipstash_auth::{
    ConstraintViolation, NewPrincipal, NewSession, Principal, PrincipalStore, PrincipalUpdate,
    Session, SessionStore, StoreError,
};
use snipstash_core::SessionId;

const USERS_PKEY: &str = "users_pkey";
const USERS_EMAIL_KEY: &str = "users_email_key";
const SESSIONS_PKEY: &str = "sessions_pkey";
const SESSIONS_NAME_FKEY: &str = "sessions_name_fkey";

#[derive(Debug, Default)]
pub struct InMemoryStore {
    principals: RwLock<HashMap<String, Principal>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn session_count(&self) -> Result<usize, StoreError> {
        Ok(read(&self.sessions)?.len())
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
}

#[async_trait]
impl PrincipalStore for InMemoryStore {
    async fn get_principal_by_name(&self, name: &str) -> Result<Principal, StoreError> {
        read(&self.principals)?
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_principal(&self, principal: NewPrincipal) -> Result<Principal, StoreError> {
        let mut principals = write(&self.principals)?;
        if principals.contains_key(&principal.name) {
            return Err(ConstraintViolation::unique(USERS_PKEY).into());
        }
        if principals.values().any(|p| p.email == principal.email) {
            return Err(ConstraintViolation::unique(USERS_EMAIL_KEY).into());
        }

        let now = Utc::now();
        let stored = Principal {
            name: principal.name,
            hashed_password: principal.hashed_password,
            full_name: principal.full_name,
            email: principal.email,
            password_changed_at: now,
            created_at: now,
        };
        principals.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_principal(&self, update: PrincipalUpdate) -> Result<Principal, StoreError> {
        let mut principals = write(&self.principals)?;
        if let Some(email) = &update.email {
            if principals
                .values()
                .any(|p| p.name != update.name && &p.email == email)
            {
                return Err(ConstraintViolation::unique(USERS_EMAIL_KEY).into());
            }
        }

        let stored = principals.get_mut(&update.name).ok_or(StoreError::NotFound)?;
        if let Some(hashed_password) = update.hashed_password {
            stored.hashed_password = hashed_password;
        }
        if let Some(changed_at) = update.password_changed_at {
            stored.password_changed_at = changed_at;
        }
        if let Some(full_name) = update.full_name {
            stored.full_name = full_name;
        }
        if let Some(email) = update.email {
            stored.email = email;
        }
        Ok(stored.clone())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, session: NewSession) -> Result<Session, StoreError> {
        // Lock order: principals before sessions.
        let principals = read(&self.principals)?;
        let mut sessions = write(&self.sessions)?;

        if !principals.contains_key(&session.subject) {
            return Err(ConstraintViolation::foreign_key(SESSIONS_NAME_FKEY).into());
        }
        if sessions.contains_key(&session.id) {
            return Err(ConstraintViolation::unique(SESSIONS_PKEY).into());
        }

        let stored = Session {
            id: session.id,
            subject: session.subject,
            refresh_token: session.refresh_token,
            user_agent: session.metadata.user_agent,
            client_ip: session.metadata.client_ip,
            is_blocked: false,
            expires_at: session.expires_at,
            created_at: Utc::now(),
        };
        sessions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_session(&self, id: SessionId) -> Result<Session, StoreError> {
        read(&self.sessions)?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn block_session(&self, id: SessionId) -> Result<Session, StoreError> {
        let mut sessions = write(&self.sessions)?;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound)?;
        session.is_blocked = true;
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use snipstash_auth::{ClientMetadata, ConstraintKind};

    use super::*;

    fn new_principal(name: &str, email: &str) -> NewPrincipal {
        NewPrincipal {
            name: name.to_string(),
            hashed_password: "$argon2id$stub".to_string(),
            full_name: "Ada Lovelace".to_string(),
            email: email.to_string(),
        }
    }

    fn new_session(subject: &str) -> NewSession {
        NewSession {
            id: SessionId::new(),
            subject: subject.to_string(),
            refresh_token: "v2.local.refresh".to_string(),
            metadata: ClientMetadata {
                user_agent: "curl/8".to_string(),
                client_ip: "10.0.0.1".to_string(),
            },
            expires_at: Utc::now() + Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn principal_roundtrip() {
        let store = InMemoryStore::new();
        let created = store.create_principal(new_principal("ada", "ada@example.com")).await.unwrap();

        let loaded = store.get_principal_by_name("ada").await.unwrap();
        assert_eq!(created, loaded);
        assert_eq!(
            store.get_principal_by_name("bob").await.unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn duplicate_name_and_email_are_unique_violations() {
        let store = InMemoryStore::new();
        store.create_principal(new_principal("ada", "ada@example.com")).await.unwrap();

        let err = store
            .create_principal(new_principal("ada", "other@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(c) if c.kind == ConstraintKind::Unique));

        let err = store
            .create_principal(new_principal("grace", "ada@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Constraint(ConstraintViolation::unique(USERS_EMAIL_KEY)));
    }

    #[tokio::test]
    async fn update_only_touches_given_fields() {
        let store = InMemoryStore::new();
        let created = store.create_principal(new_principal("ada", "ada@example.com")).await.unwrap();

        let updated = store
            .update_principal(PrincipalUpdate {
                name: "ada".to_string(),
                full_name: Some("Ada King".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.full_name, "Ada King");
        assert_eq!(updated.email, created.email);
        assert_eq!(updated.hashed_password, created.hashed_password);

        let missing = store
            .update_principal(PrincipalUpdate {
                name: "nobody".to_string(),
                ..Default::default()
            })
            .await;
        assert_eq!(missing.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn session_requires_existing_principal() {
        let store = InMemoryStore::new();
        let err = store.create_session(new_session("ghost")).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Constraint(ConstraintViolation::foreign_key(SESSIONS_NAME_FKEY))
        );
    }

    #[tokio::test]
    async fn block_session_is_sticky() {
        let store = InMemoryStore::new();
        store.create_principal(new_principal("ada", "ada@example.com")).await.unwrap();
        let session = store.create_session(new_session("ada")).await.unwrap();
        assert!(!session.is_blocked);
        assert_eq!(session.user_agent, "curl/8");

        store.block_session(session.id).await.unwrap();
        assert!(store.get_session(session.id).await.unwrap().is_blocked);
        assert_eq!(store.session_count().unwrap(), 1);

        assert_eq!(
            store.block_session(SessionId::new()).await.unwrap_err(),
            StoreError::NotFound
        );
    }
}
