//! Storage collaborator contracts.
//!
//! Adapters translate driver-specific failures into [`StoreError`] once, at
//! the boundary, so the service never inspects driver error internals.

use async_trait::async_trait;
use thiserror::Error;

use snipstash_core::SessionId;

use crate::{NewPrincipal, NewSession, Principal, PrincipalUpdate, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind:?} constraint violated: {constraint}")]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    pub constraint: String,
}

impl ConstraintViolation {
    pub fn unique(constraint: impl Into<String>) -> Self {
        Self {
            kind: ConstraintKind::Unique,
            constraint: constraint.into(),
        }
    }

    pub fn foreign_key(constraint: impl Into<String>) -> Self {
        Self {
            kind: ConstraintKind::ForeignKey,
            constraint: constraint.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),

    /// The caller's deadline elapsed before the store answered.
    #[error("storage call cancelled")]
    Cancelled,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn get_principal_by_name(&self, name: &str) -> Result<Principal, StoreError>;

    async fn create_principal(&self, principal: NewPrincipal) -> Result<Principal, StoreError>;

    async fn update_principal(&self, update: PrincipalUpdate) -> Result<Principal, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: NewSession) -> Result<Session, StoreError>;

    async fn get_session(&self, id: SessionId) -> Result<Session, StoreError>;

    /// Administrative revocation. Renewal is refused for the session afterwards.
    async fn block_session(&self, id: SessionId) -> Result<Session, StoreError>;
}
