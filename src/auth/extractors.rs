use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::{auth::repo_types::UserProfile, error::ApiError, state::AppState};

/// Resolves the bearer token on the request to the stored user.
pub struct AuthUser(pub UserProfile);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok());

        state
            .sessions
            .resolve(header)
            .await
            .map(AuthUser)
            .map_err(|e| state.api_error(e))
    }
}
