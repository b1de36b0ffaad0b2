use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::{IntoResponse, Response},
};

use crate::app::{AppState, dto, errors};
use crate::context::ApiContext;

pub async fn renew_access(
    State(state): State<AppState>,
    ApiContext(ctx): ApiContext,
    body: Result<Json<dto::RenewAccessTokenRequest>, JsonRejection>,
) -> Response {
    let body = match errors::json_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match state.auth.renew_access_token(&ctx, &body.refresh_token).await {
        Ok(res) => Json(res).into_response(),
        Err(e) => errors::auth_error_to_response(e),
    }
}
