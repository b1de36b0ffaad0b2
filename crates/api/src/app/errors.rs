use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use snipstash_auth::AuthError;

pub fn status_for(err: &AuthError) -> StatusCode {
    match err {
        AuthError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        AuthError::InvalidToken | AuthError::ExpiredToken | AuthError::Unauthenticated => {
            StatusCode::UNAUTHORIZED
        }
        AuthError::PermissionDenied => StatusCode::FORBIDDEN,
        AuthError::NotFound => StatusCode::NOT_FOUND,
        AuthError::AlreadyExists => StatusCode::CONFLICT,
        AuthError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn auth_error_to_response(err: AuthError) -> Response {
    let status = status_for(&err);
    let message = match &err {
        AuthError::InvalidArgument(violations) => violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
        AuthError::Internal(detail) => {
            // Details stay in the log.
            error!(detail = %detail, "request failed with internal error");
            err.to_string()
        }
        other => other.to_string(),
    };
    json_error(status, err.code(), message)
}

/// Unwrap a JSON body, answering malformed input with a 400 in the usual error shape.
pub fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected request body");
            Err(json_error(
                StatusCode::BAD_REQUEST,
                "invalid_argument",
                rejection.body_text(),
            ))
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use snipstash_core::FieldViolation;

    use super::*;

    #[test]
    fn every_kind_has_its_status() {
        let cases = [
            (AuthError::InvalidArgument(Vec::new()), StatusCode::BAD_REQUEST),
            (AuthError::InvalidToken, StatusCode::UNAUTHORIZED),
            (AuthError::ExpiredToken, StatusCode::UNAUTHORIZED),
            (AuthError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AuthError::PermissionDenied, StatusCode::FORBIDDEN),
            (AuthError::NotFound, StatusCode::NOT_FOUND),
            (AuthError::AlreadyExists, StatusCode::CONFLICT),
            (AuthError::Cancelled, StatusCode::GATEWAY_TIMEOUT),
            (AuthError::Internal("db down".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err:?}");
        }
    }

    #[tokio::test]
    async fn internal_details_are_not_returned() {
        let res = auth_error_to_response(AuthError::Internal("password=hunter2".to_string()));
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "internal");
        assert!(!body["message"].as_str().unwrap().contains("hunter2"));
    }

    #[tokio::test]
    async fn violations_are_listed_in_the_message() {
        let res = auth_error_to_response(AuthError::InvalidArgument(vec![
            FieldViolation::new("name", "too short"),
            FieldViolation::new("email", "missing @"),
        ]));
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "invalid_argument");
        let message = body["message"].as_str().unwrap();
        assert!(message.contains("name: too short"));
        assert!(message.contains("email: missing @"));
    }
}
