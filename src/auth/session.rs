use std::{sync::Arc, time::Duration};

use tracing::{debug, instrument, warn};

use crate::{
    auth::{
        jwt::JwtKeys,
        repo_types::{UserProfile, UserRecord},
    },
    error::AppError,
    store::{with_deadline, UserStore},
};

/// Pulls the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(authorization: Option<&str>) -> Result<&str, AppError> {
    let no_token = || AppError::Auth("no token".into());
    let (scheme, token) = authorization
        .map(str::trim)
        .and_then(|h| h.split_once(' '))
        .ok_or_else(no_token)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(no_token());
    }
    Ok(token)
}

/// Resolves bearer tokens back to the stored user.
pub struct SessionVerifier {
    users: Arc<dyn UserStore>,
    keys: Arc<JwtKeys>,
    store_timeout: Duration,
}

impl SessionVerifier {
    pub fn new(users: Arc<dyn UserStore>, keys: Arc<JwtKeys>, store_timeout: Duration) -> Self {
        Self {
            users,
            keys,
            store_timeout,
        }
    }

    #[instrument(skip_all)]
    pub async fn resolve(&self, authorization: Option<&str>) -> Result<UserProfile, AppError> {
        let token = bearer_token(authorization)?;

        let claims = self.keys.verify(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            AppError::Auth("invalid token".into())
        })?;

        let pk = UserRecord::primary_key(claims.sub);
        let user = with_deadline(self.store_timeout, self.users.find_by_pk(&pk))
            .await?
            .ok_or_else(|| {
                warn!(user_id = %claims.sub, "token subject has no record");
                AppError::NotFound("user not found".into())
            })?;

        debug!(user_id = %user.user_id, "session resolved");
        Ok(UserProfile::from(user))
    }
}
