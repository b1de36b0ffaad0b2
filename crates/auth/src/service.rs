//! Login, renewal and account orchestration.
//!
//! Every step is explicit and sequential: storage calls run under the request
//! deadline, side effects (session row, verification job) happen after the
//! step they depend on succeeded, and each has its own error handling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use snipstash_core::validation::{validate_email, validate_full_name, validate_name, validate_password};
use snipstash_core::{Clock, SessionId, SystemClock, Violations};

use crate::{
    AuthError, ConstraintKind, NewPrincipal, NewSession, NotificationDispatcher, PasswordError,
    PasswordHasher, Payload, PrincipalProfile, PrincipalStore, PrincipalUpdate, RequestContext,
    SessionStore, StoreError, TokenMaker,
};

#[derive(Debug, Clone, Copy)]
pub struct AuthConfig {
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    /// Upper bound for a single storage call when the caller has no tighter deadline.
    pub store_timeout: StdDuration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::minutes(15),
            refresh_token_ttl: Duration::hours(24),
            store_timeout: StdDuration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub session_id: SessionId,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub user: PrincipalProfile,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewAccessTokenResponse {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub password: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub name: String,
    pub password: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

/// Stateless-per-call auth orchestration; cheap to clone and share.
#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
    maker: Arc<dyn TokenMaker>,
    hasher: Arc<dyn PasswordHasher>,
    principals: Arc<dyn PrincipalStore>,
    sessions: Arc<dyn SessionStore>,
    notifier: Option<Arc<dyn NotificationDispatcher>>,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    pub fn new(
        config: AuthConfig,
        maker: Arc<dyn TokenMaker>,
        hasher: Arc<dyn PasswordHasher>,
        principals: Arc<dyn PrincipalStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            maker,
            hasher,
            principals,
            sessions,
            notifier: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Must be the same clock the token maker reads.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Authenticate with name and password; issues both tokens and persists a session.
    ///
    /// Unknown names and wrong passwords both fail with `Unauthenticated` after
    /// the same amount of hashing work; only the log line tells them apart.
    #[instrument(skip_all, fields(subject = %subject))]
    pub async fn login(
        &self,
        ctx: &RequestContext,
        subject: &str,
        password: &str,
    ) -> Result<LoginResponse, AuthError> {
        let principal = match self.call(ctx, self.principals.get_principal_by_name(subject)).await {
            Ok(principal) => principal,
            Err(StoreError::NotFound) => {
                let plaintext = password.to_owned();
                let _ = self.run_hasher(move |hasher| hasher.hash(&plaintext)).await?;
                warn!("login rejected: unknown subject");
                return Err(AuthError::Unauthenticated);
            }
            Err(e) => return Err(store_failure("load principal", e)),
        };

        let plaintext = password.to_owned();
        let stored = principal.hashed_password.clone();
        match self
            .run_hasher(move |hasher| hasher.verify(&plaintext, &stored))
            .await?
        {
            Ok(()) => {}
            Err(PasswordError::Mismatch) => {
                warn!("login rejected: password mismatch");
                return Err(AuthError::Unauthenticated);
            }
            Err(e) => {
                error!(error = %e, "password verification failed");
                return Err(AuthError::Internal("password verification failed".to_string()));
            }
        }

        let (access_token, access_payload) = self
            .maker
            .create_token(&principal.name, self.config.access_token_ttl)?;
        let (refresh_token, refresh_payload) = self
            .maker
            .create_token(&principal.name, self.config.refresh_token_ttl)?;

        let new_session = NewSession {
            id: refresh_payload.id.into(),
            subject: principal.name.clone(),
            refresh_token: refresh_token.clone(),
            metadata: ctx.metadata().clone(),
            expires_at: refresh_payload.expired_at,
        };
        let session = self
            .call(ctx, self.sessions.create_session(new_session))
            .await
            .map_err(|e| store_failure("create session", e))?;

        info!(session_id = %session.id, "login succeeded");

        Ok(LoginResponse {
            session_id: session.id,
            access_token,
            access_token_expires_at: access_payload.expired_at,
            refresh_token,
            refresh_token_expires_at: refresh_payload.expired_at,
            user: PrincipalProfile::from(&principal),
        })
    }

    /// Mint a new access token from a refresh token.
    ///
    /// Neither the refresh token nor the session is rotated; concurrent
    /// renewals for one session all succeed.
    #[instrument(skip_all)]
    pub async fn renew_access_token(
        &self,
        ctx: &RequestContext,
        refresh_token: &str,
    ) -> Result<RenewAccessTokenResponse, AuthError> {
        let payload = self.maker.verify_token(refresh_token)?;

        let session = match self.call(ctx, self.sessions.get_session(payload.id.into())).await {
            Ok(session) => session,
            Err(StoreError::NotFound) => {
                warn!(token_id = %payload.id, "renewal rejected: no session for token");
                return Err(AuthError::NotFound);
            }
            Err(e) => return Err(store_failure("load session", e)),
        };

        if session.is_blocked {
            warn!(session_id = %session.id, "renewal rejected: session blocked");
            return Err(AuthError::PermissionDenied);
        }
        if session.subject != payload.subject {
            warn!(session_id = %session.id, "renewal rejected: subject mismatch");
            return Err(AuthError::Unauthenticated);
        }
        if session.refresh_token != refresh_token {
            warn!(session_id = %session.id, "renewal rejected: refresh token mismatch");
            return Err(AuthError::Unauthenticated);
        }
        if session.is_expired(self.clock.now()) {
            warn!(session_id = %session.id, "renewal rejected: session expired");
            return Err(AuthError::ExpiredToken);
        }

        let (access_token, access_payload) = self
            .maker
            .create_token(&payload.subject, self.config.access_token_ttl)?;

        Ok(RenewAccessTokenResponse {
            access_token,
            access_token_expires_at: access_payload.expired_at,
        })
    }

    /// Stateless check used by request-authorizing middleware.
    pub fn verify_access_token(&self, token: &str) -> Result<Payload, AuthError> {
        self.maker.verify_token(token).map_err(AuthError::from)
    }

    /// Register a principal, then schedule its verification mail.
    #[instrument(skip_all, fields(name = %req.name))]
    pub async fn create_user(
        &self,
        ctx: &RequestContext,
        req: CreateUserRequest,
    ) -> Result<PrincipalProfile, AuthError> {
        let mut violations = Violations::new();
        violations
            .check("name", validate_name(&req.name))
            .check("password", validate_password(&req.password))
            .check("full_name", validate_full_name(&req.full_name))
            .check("email", validate_email(&req.email));
        violations.finish()?;

        let hashed_password = self.hash_password(&req.password).await?;
        let new_principal = NewPrincipal {
            name: req.name,
            hashed_password,
            full_name: req.full_name,
            email: req.email,
        };

        let principal = match self.call(ctx, self.principals.create_principal(new_principal)).await {
            Ok(principal) => principal,
            Err(StoreError::Constraint(c)) if c.kind == ConstraintKind::Unique => {
                info!(constraint = %c.constraint, "registration rejected: already exists");
                return Err(AuthError::AlreadyExists);
            }
            Err(e) => return Err(store_failure("create principal", e)),
        };

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.dispatch_verify_email(&principal.name).await {
                error!(error = %e, "failed to schedule verification email");
                return Err(AuthError::Internal(
                    "failed to schedule verification email".to_string(),
                ));
            }
        }

        info!("user created");
        Ok(PrincipalProfile::from(&principal))
    }

    /// Update the caller's own account.
    #[instrument(skip_all, fields(name = %req.name))]
    pub async fn update_user(
        &self,
        ctx: &RequestContext,
        caller: &Payload,
        req: UpdateUserRequest,
    ) -> Result<PrincipalProfile, AuthError> {
        if caller.subject != req.name {
            warn!(caller = %caller.subject, "update rejected: not the account owner");
            return Err(AuthError::PermissionDenied);
        }

        let mut violations = Violations::new();
        violations.check("name", validate_name(&req.name));
        if let Some(password) = &req.password {
            violations.check("password", validate_password(password));
        }
        if let Some(full_name) = &req.full_name {
            violations.check("full_name", validate_full_name(full_name));
        }
        if let Some(email) = &req.email {
            violations.check("email", validate_email(email));
        }
        violations.finish()?;

        let mut update = PrincipalUpdate {
            name: req.name,
            full_name: req.full_name,
            email: req.email,
            ..Default::default()
        };
        if let Some(password) = &req.password {
            update.hashed_password = Some(self.hash_password(password).await?);
            update.password_changed_at = Some(self.clock.now());
        }

        let principal = match self.call(ctx, self.principals.update_principal(update)).await {
            Ok(principal) => principal,
            Err(StoreError::NotFound) => return Err(AuthError::NotFound),
            Err(StoreError::Constraint(c)) if c.kind == ConstraintKind::Unique => {
                return Err(AuthError::AlreadyExists);
            }
            Err(e) => return Err(store_failure("update principal", e)),
        };

        Ok(PrincipalProfile::from(&principal))
    }

    pub async fn get_user(&self, ctx: &RequestContext, name: &str) -> Result<PrincipalProfile, AuthError> {
        match self.call(ctx, self.principals.get_principal_by_name(name)).await {
            Ok(principal) => Ok(PrincipalProfile::from(&principal)),
            Err(StoreError::NotFound) => Err(AuthError::NotFound),
            Err(e) => Err(store_failure("load principal", e)),
        }
    }

    async fn call<T, F>(&self, ctx: &RequestContext, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        ctx.run(self.config.store_timeout, call).await
    }

    async fn hash_password(&self, plaintext: &str) -> Result<String, AuthError> {
        let plaintext = plaintext.to_owned();
        self.run_hasher(move |hasher| hasher.hash(&plaintext))
            .await?
            .map_err(|e| {
                error!(error = %e, "password hashing failed");
                AuthError::Internal("failed to hash password".to_string())
            })
    }

    /// Run hasher work on the blocking pool so it never stalls the executor.
    async fn run_hasher<T, F>(&self, work: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PasswordHasher) -> T + Send + 'static,
    {
        let hasher = Arc::clone(&self.hasher);
        tokio::task::spawn_blocking(move || work(&*hasher))
            .await
            .map_err(|e| {
                error!(error = %e, "password hashing task failed");
                AuthError::Internal("password hashing task failed".to_string())
            })
    }
}

fn store_failure(operation: &'static str, err: StoreError) -> AuthError {
    match err {
        StoreError::Cancelled => {
            warn!(operation, "storage call cancelled");
            AuthError::Cancelled
        }
        other => {
            error!(operation, error = %other, "storage call failed");
            AuthError::Internal(format!("{operation} failed"))
        }
    }
}
