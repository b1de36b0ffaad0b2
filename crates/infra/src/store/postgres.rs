//! Postgres storage collaborators (sqlx).
//!
//! Queries are plain runtime-checked `sqlx::query` calls so the crate builds
//! without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use snipstash_auth::{
    ConstraintViolation, NewPrincipal, NewSession, Principal, PrincipalStore, PrincipalUpdate,
    Session, SessionStore, StoreError,
};
use snipstash_core::SessionId;

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        name TEXT PRIMARY KEY,
        hashed_password TEXT NOT NULL,
        full_name TEXT NOT NULL,
        email TEXT NOT NULL,
        password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '0001-01-01 00:00:00Z',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT users_email_key UNIQUE (email)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        user_agent TEXT NOT NULL,
        client_ip TEXT NOT NULL,
        is_blocked BOOLEAN NOT NULL DEFAULT false,
        expires_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT sessions_name_fkey FOREIGN KEY (name) REFERENCES users (name)
    )
    "#,
];

const USER_COLUMNS: &str = "name, hashed_password, full_name, email, password_changed_at, created_at";
const SESSION_COLUMNS: &str =
    "id, name, refresh_token, user_agent, client_ip, is_blocked, expires_at, created_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(translate)?;
        Ok(Self::new(pool))
    }

    /// Create the tables when missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(translate)?;
        }
        Ok(())
    }
}

/// Translate driver errors into the storage boundary taxonomy.
fn translate(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) => {
            let constraint = db.constraint().unwrap_or_default().to_string();
            match db.code().as_deref() {
                Some("23505") => ConstraintViolation::unique(constraint).into(),
                Some("23503") => ConstraintViolation::foreign_key(constraint).into(),
                _ => StoreError::Unavailable(db.to_string()),
            }
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn principal_from_row(row: &PgRow) -> Result<Principal, sqlx::Error> {
    Ok(Principal {
        name: row.try_get("name")?,
        hashed_password: row.try_get("hashed_password")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        password_changed_at: row.try_get::<DateTime<Utc>, _>("password_changed_at")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session, sqlx::Error> {
    Ok(Session {
        id: SessionId::from_uuid(row.try_get::<Uuid, _>("id")?),
        subject: row.try_get("name")?,
        refresh_token: row.try_get("refresh_token")?,
        user_agent: row.try_get("user_agent")?,
        client_ip: row.try_get("client_ip")?,
        is_blocked: row.try_get("is_blocked")?,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl PrincipalStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn get_principal_by_name(&self, name: &str) -> Result<Principal, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE name = $1"))
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(translate)?;
        principal_from_row(&row).map_err(translate)
    }

    #[instrument(skip_all, fields(name = %principal.name), err)]
    async fn create_principal(&self, principal: NewPrincipal) -> Result<Principal, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (name, hashed_password, full_name, email) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&principal.name)
        .bind(&principal.hashed_password)
        .bind(&principal.full_name)
        .bind(&principal.email)
        .fetch_one(&self.pool)
        .await
        .map_err(translate)?;
        principal_from_row(&row).map_err(translate)
    }

    #[instrument(skip_all, fields(name = %update.name), err)]
    async fn update_principal(&self, update: PrincipalUpdate) -> Result<Principal, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET \
                hashed_password = COALESCE($2, hashed_password), \
                password_changed_at = COALESCE($3, password_changed_at), \
                full_name = COALESCE($4, full_name), \
                email = COALESCE($5, email) \
             WHERE name = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(&update.name)
        .bind(update.hashed_password.as_deref())
        .bind(update.password_changed_at)
        .bind(update.full_name.as_deref())
        .bind(update.email.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(translate)?;
        principal_from_row(&row).map_err(translate)
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    #[instrument(skip_all, fields(session_id = %session.id, subject = %session.subject), err)]
    async fn create_session(&self, session: NewSession) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO sessions (id, name, refresh_token, user_agent, client_ip, is_blocked, expires_at) \
             VALUES ($1, $2, $3, $4, $5, false, $6) RETURNING {SESSION_COLUMNS}"
        ))
        .bind(*session.id.as_uuid())
        .bind(&session.subject)
        .bind(&session.refresh_token)
        .bind(&session.metadata.user_agent)
        .bind(&session.metadata.client_ip)
        .bind(session.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(translate)?;
        session_from_row(&row).map_err(translate)
    }

    #[instrument(skip(self), err)]
    async fn get_session(&self, id: SessionId) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(translate)?;
        session_from_row(&row).map_err(translate)
    }

    #[instrument(skip(self), err)]
    async fn block_session(&self, id: SessionId) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE sessions SET is_blocked = true WHERE id = $1 RETURNING {SESSION_COLUMNS}"
        ))
        .bind(*id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(translate)?;
        session_from_row(&row).map_err(translate)
    }
}
