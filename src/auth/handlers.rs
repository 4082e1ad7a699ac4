use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{LoginRequest, LoginResponse, MeResponse, RegisterRequest, RegisterResponse},
        extractors::AuthUser,
    },
    error::{ApiError, AppError},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn bad_body(state: &AppState, rejection: JsonRejection) -> ApiError {
    warn!(error = %rejection.body_text(), "unreadable request body");
    state.api_error(AppError::Validation("email and password required".into()))
}

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Json(payload) = payload.map_err(|e| bad_body(&state, e))?;

    let registered = state
        .accounts
        .register(
            payload.email.as_deref(),
            payload.password.as_deref(),
            payload.display_name.as_deref(),
        )
        .await
        .map_err(|e| state.api_error(e))?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "registered successfully".into(),
            user_id: registered.user_id,
            email: registered.email,
        }),
    ))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(payload) = payload.map_err(|e| bad_body(&state, e))?;

    let outcome = state
        .accounts
        .login(payload.email.as_deref(), payload.password.as_deref())
        .await
        .map_err(|e| state.api_error(e))?;

    Ok(Json(LoginResponse {
        token: outcome.token,
        user: outcome.user,
    }))
}

#[instrument(skip_all)]
pub async fn get_me(AuthUser(user): AuthUser) -> Json<MeResponse> {
    Json(MeResponse { user })
}
