use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use snipstash_auth::{CreateUserRequest, Payload, UpdateUserRequest};

use crate::app::{AppState, dto, errors};
use crate::context::ApiContext;

pub async fn create_user(
    State(state): State<AppState>,
    ApiContext(ctx): ApiContext,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Response {
    let body = match errors::json_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match state.auth.create_user(&ctx, body).await {
        Ok(user) => (StatusCode::CREATED, Json(dto::UserResponse { user })).into_response(),
        Err(e) => errors::auth_error_to_response(e),
    }
}

pub async fn login_user(
    State(state): State<AppState>,
    ApiContext(ctx): ApiContext,
    body: Result<Json<dto::LoginRequest>, JsonRejection>,
) -> Response {
    let body = match errors::json_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match state.auth.login(&ctx, &body.name, &body.password).await {
        Ok(res) => Json(res).into_response(),
        Err(e) => errors::auth_error_to_response(e),
    }
}

pub async fn me(
    State(state): State<AppState>,
    ApiContext(ctx): ApiContext,
    Extension(caller): Extension<Payload>,
) -> Response {
    match state.auth.get_user(&ctx, &caller.subject).await {
        Ok(user) => Json(dto::UserResponse { user }).into_response(),
        Err(e) => errors::auth_error_to_response(e),
    }
}

pub async fn update_user(
    State(state): State<AppState>,
    ApiContext(ctx): ApiContext,
    Extension(caller): Extension<Payload>,
    body: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Response {
    let body = match errors::json_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match state.auth.update_user(&ctx, &caller, body).await {
        Ok(user) => Json(dto::UserResponse { user }).into_response(),
        Err(e) => errors::auth_error_to_response(e),
    }
}
