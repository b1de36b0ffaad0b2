use std::time::Instant;

use axum::{
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use tracing::{debug, info};

use snipstash_auth::AuthError;

use crate::app::{AppState, errors};

/// Verify the bearer access token and expose its payload to handlers as an extension.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let verified = extract_bearer(req.headers()).and_then(|token| state.auth.verify_access_token(token));

    match verified {
        Ok(payload) => {
            req.extensions_mut().insert(payload);
            next.run(req).await
        }
        Err(e) => {
            debug!(error = %e, "bearer rejected");
            errors::auth_error_to_response(e)
        }
    }
}

pub async fn log_request(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let res = next.run(req).await;

    info!(
        %method,
        %path,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    res
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthError::Unauthenticated)?;

    let header = header.to_str().map_err(|_| AuthError::Unauthenticated)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::Unauthenticated)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(AuthError::Unauthenticated);
    }

    Ok(token)
}
