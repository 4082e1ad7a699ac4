//! Central error type for the account API and its HTTP mapping.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid_credentials() -> Self {
        AppError::Auth("invalid credentials".into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::StoreUnavailable(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to hand to any caller.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(m)
            | AppError::Conflict(m)
            | AppError::Auth(m)
            | AppError::Forbidden(m)
            | AppError::NotFound(m) => m.clone(),
            AppError::StoreUnavailable(_) => "database error".into(),
            AppError::Internal(_) => "internal server error".into(),
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            AppError::StoreUnavailable(d) | AppError::Internal(d) => Some(d.as_str()),
            _ => None,
        }
    }

    pub fn exposing_detail(self, expose_detail: bool) -> ApiError {
        ApiError {
            error: self,
            expose_detail,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(_) => AppError::Conflict("email already in use".into()),
            StoreError::Missing(_) => AppError::NotFound("user not found".into()),
            StoreError::Unavailable(d) => AppError::StoreUnavailable(d),
            StoreError::Corrupt(d) => AppError::Internal(d),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(format!("{e:#}"))
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

fn render(err: &AppError, with_detail: bool) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        error!(error = %err, %status, "request failed");
    }
    let body = ErrorBody {
        error: err.public_message(),
        detail: if with_detail { err.detail() } else { None },
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        render(&self, false)
    }
}

/// Handler error that knows whether the deployment exposes internal details.
pub struct ApiError {
    pub error: AppError,
    pub expose_detail: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        render(&self.error, self.expose_detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(AppError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::invalid_credentials().status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::StoreUnavailable("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn store_conflict_maps_to_email_in_use() {
        let err: AppError = StoreError::Conflict("EMAIL#a@b.com".into()).into();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "email already in use"));
    }

    #[test]
    fn missing_record_maps_to_not_found() {
        let err: AppError = StoreError::Missing("USER#x".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.public_message(), "user not found");
    }

    #[tokio::test]
    async fn internal_detail_hidden_by_default() {
        let resp = AppError::StoreUnavailable("connection refused".into()).into_response();
        let json = body_json(resp).await;
        assert_eq!(json["error"], "database error");
        assert!(json.get("detail").is_none());
    }

    #[tokio::test]
    async fn internal_detail_shown_when_enabled() {
        let resp = AppError::StoreUnavailable("connection refused".into())
            .exposing_detail(true)
            .into_response();
        let json = body_json(resp).await;
        assert_eq!(json["detail"], "connection refused");
    }

    #[tokio::test]
    async fn client_errors_never_carry_detail() {
        let resp = ApiError {
            error: AppError::invalid_credentials(),
            expose_detail: true,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!({ "error": "invalid credentials" }));
    }
}
