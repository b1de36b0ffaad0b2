use axum::{
    Router,
    routing::{get, patch, post},
};

use super::AppState;

pub mod system;
pub mod tokens;
pub mod users;

/// Endpoints reachable without a bearer token.
pub fn public() -> Router<AppState> {
    Router::new()
        .route("/users", post(users::create_user))
        .route("/users/login", post(users::login_user))
        .route("/tokens/renew_access", post(tokens::renew_access))
}

/// Endpoints that run behind `middleware::require_bearer`.
pub fn protected() -> Router<AppState> {
    Router::new()
        .route("/users", patch(users::update_user))
        .route("/users/me", get(users::me))
}
