use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use super::{
    dto::{
        CompleteRequest, CompleteResponse, DownloadQuery, DownloadResponse, PresignRequest,
        PresignResponse,
    },
    services::{presign_download, presign_upload, register_upload},
};
use crate::{
    auth::extractors::AuthUser,
    error::{ApiError, AppError},
    state::AppState,
};

pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/uploads/presign", post(presign))
        .route("/uploads/complete", post(complete))
        .route("/uploads/download", get(download))
}

fn invalid_body(state: &AppState, body_text: String) -> ApiError {
    state.api_error(AppError::Validation(format!("invalid body: {body_text}")))
}

/// POST /uploads/presign { filename, contentType, size } → presigned PUT url
#[instrument(skip_all)]
pub async fn presign(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<PresignRequest>, JsonRejection>,
) -> Result<Json<PresignResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| invalid_body(&state, e.body_text()))?;

    let upload = presign_upload(
        &state,
        user.user_id,
        body.filename.as_deref(),
        body.content_type.as_deref(),
        body.size,
    )
    .await
    .map_err(|e| state.api_error(e))?;

    Ok(Json(PresignResponse {
        url: upload.url,
        key: upload.key,
        expires_in: upload.expires_in,
        max_bytes: upload.max_bytes,
    }))
}

/// POST /uploads/complete { key } → records the upload, returns a download url
#[instrument(skip_all)]
pub async fn complete(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| invalid_body(&state, e.body_text()))?;

    let registered = register_upload(&state, &user, body.key.as_deref())
        .await
        .map_err(|e| state.api_error(e))?;

    Ok(Json(CompleteResponse {
        ok: true,
        s3_key: registered.key,
        size: registered.size,
        download_url: registered.download_url,
        expires_in: registered.expires_in,
    }))
}

#[instrument(skip_all)]
pub async fn download(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let Query(query) = query.map_err(|e| invalid_body(&state, e.body_text()))?;

    let download = presign_download(&state, user.user_id, query.key.as_deref())
        .await
        .map_err(|e| state.api_error(e))?;

    Ok(Json(DownloadResponse {
        url: download.url,
        key: download.key,
        expires_in: download.expires_in,
    }))
}
