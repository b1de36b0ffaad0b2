//! HTTP API application wiring (Axum router + shared state).
//!
//! - `routes/`: HTTP handlers (one file per resource)
//! - `dto.rs`: request/response bodies that are not auth-crate types
//! - `errors.rs`: consistent `{ "error", "message" }` responses

use axum::{Router, routing::get};
use tower::ServiceBuilder;

use snipstash_auth::AuthService;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

/// Shared by every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
}

impl AppState {
    pub fn new(auth: AuthService) -> Self {
        Self { auth }
    }
}

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(state: AppState) -> Router {
    // Protected routes: the bearer access token must verify.
    let protected = routes::protected().route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::require_bearer,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::public())
        .merge(protected)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(middleware::log_request)))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use snipstash_auth::{Argon2Hasher, AuthConfig, PasetoMaker};
    use snipstash_infra::InMemoryStore;

    use super::*;

    fn app() -> Router {
        let store = InMemoryStore::arc();
        let auth = AuthService::new(
            AuthConfig {
                store_timeout: Duration::from_secs(1),
                ..AuthConfig::default()
            },
            Arc::new(PasetoMaker::new(&[7u8; 32]).unwrap()),
            Arc::new(Argon2Hasher::new(8, 1, 1).unwrap()),
            store.clone(),
            store,
        );
        build_app(AppState::new(auth))
    }

    #[tokio::test]
    async fn health_is_public() {
        let res = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn me_requires_bearer() {
        let res = app()
            .oneshot(Request::get("/users/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_bearer_is_rejected() {
        let res = app()
            .oneshot(
                Request::patch("/users")
                    .header("authorization", "Bearer v2.local.garbage")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"ada"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn users_path_routes_post_publicly_and_patch_behind_bearer() {
        let app = app();

        let res = app
            .clone()
            .oneshot(
                Request::post("/users")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .oneshot(
                Request::patch("/users")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"ada"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
