use anyhow::Context;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::repo_types::UserProfile,
    error::AppError,
    state::AppState,
    store::with_deadline,
};

const MAX_FILENAME_LEN: usize = 128;

#[derive(Debug)]
pub struct PresignedUpload {
    pub url: String,
    pub key: String,
    pub expires_in: u64,
    pub max_bytes: u64,
}

#[derive(Debug)]
pub struct RegisteredUpload {
    pub key: String,
    pub size: u64,
    pub download_url: String,
    pub expires_in: u64,
}

#[derive(Debug)]
pub struct PresignedDownload {
    pub url: String,
    pub key: String,
    pub expires_in: u64,
}

/// Keeps ASCII letters, digits, `.`, `-` and `_`; everything else becomes `_`.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();
    if cleaned.trim_matches(['.', '_']).is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

fn is_valid_content_type(ct: &str) -> bool {
    match ct.split_once('/') {
        Some((kind, sub)) => !kind.is_empty() && !sub.is_empty() && !ct.contains(char::is_whitespace),
        None => false,
    }
}

fn user_prefix(user_id: Uuid) -> String {
    format!("users/{user_id}/")
}

/// Object keys always live under the caller's own prefix.
fn object_key(user_id: Uuid, filename: &str, now: OffsetDateTime) -> String {
    format!(
        "{}{}_{}_{}",
        user_prefix(user_id),
        now.unix_timestamp(),
        Uuid::new_v4().simple(),
        sanitize_filename(filename)
    )
}

// Generated keys never nest below the user prefix.
fn owns_key(user_id: Uuid, key: &str) -> bool {
    key.strip_prefix(&user_prefix(user_id))
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

fn owned_key(user_id: Uuid, key: Option<&str>) -> Result<&str, AppError> {
    let key = key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| AppError::Validation("key required".into()))?;
    if !owns_key(user_id, key) {
        warn!(user_id = %user_id, key = %key, "upload key outside caller prefix");
        return Err(AppError::Forbidden("not your upload".into()));
    }
    Ok(key)
}

fn too_large(max_bytes: u64) -> AppError {
    AppError::Validation(format!("file too large (max {max_bytes} bytes)"))
}

pub async fn presign_upload(
    st: &AppState,
    user_id: Uuid,
    filename: Option<&str>,
    content_type: Option<&str>,
    size: Option<u64>,
) -> Result<PresignedUpload, AppError> {
    let (Some(filename), Some(content_type), Some(size)) = (
        filename.filter(|f| !f.trim().is_empty()),
        content_type.map(str::trim).filter(|c| !c.is_empty()),
        size,
    ) else {
        return Err(AppError::Validation(
            "filename, contentType and size required".into(),
        ));
    };
    if !is_valid_content_type(content_type) {
        return Err(AppError::Validation("invalid contentType".into()));
    }
    let max_bytes = st.config.storage.max_upload_bytes;
    if size > max_bytes {
        return Err(too_large(max_bytes));
    }

    let key = object_key(user_id, filename, OffsetDateTime::now_utc());
    let expires_in = st.config.storage.presign_ttl_secs;
    let url = st
        .storage
        .presign_put(&key, content_type, size, expires_in)
        .await
        .with_context(|| format!("presign upload {key}"))?;

    info!(user_id = %user_id, key = %key, size, "upload url issued");
    Ok(PresignedUpload {
        url,
        key,
        expires_in,
        max_bytes,
    })
}

/// Confirms an uploaded object, records its key on the user and hands back a
/// download URL. Oversized objects are deleted and rejected.
pub async fn register_upload(
    st: &AppState,
    user: &UserProfile,
    key: Option<&str>,
) -> Result<RegisteredUpload, AppError> {
    let key = owned_key(user.user_id, key)?;

    let size = st
        .storage
        .object_size(key)
        .await
        .with_context(|| format!("inspect upload {key}"))?
        .ok_or_else(|| AppError::NotFound("upload not found".into()))?;

    let max_bytes = st.config.storage.max_upload_bytes;
    if size > max_bytes {
        warn!(user_id = %user.user_id, key = %key, size, "uploaded object over limit; deleting");
        st.storage
            .delete_object(key)
            .await
            .with_context(|| format!("delete oversized upload {key}"))?;
        return Err(too_large(max_bytes));
    }

    if !user.s3_keys.iter().any(|k| k == key) {
        with_deadline(st.config.store.timeout(), st.users.add_s3_key(&user.pk, key)).await?;
    }

    let expires_in = st.config.storage.presign_ttl_secs;
    let download_url = st
        .storage
        .presign_get(key, expires_in)
        .await
        .with_context(|| format!("presign download {key}"))?;

    info!(user_id = %user.user_id, key = %key, size, "upload registered");
    Ok(RegisteredUpload {
        key: key.to_string(),
        size,
        download_url,
        expires_in,
    })
}

pub async fn presign_download(
    st: &AppState,
    user_id: Uuid,
    key: Option<&str>,
) -> Result<PresignedDownload, AppError> {
    let key = owned_key(user_id, key)?;
    let expires_in = st.config.storage.presign_ttl_secs;
    let url = st
        .storage
        .presign_get(key, expires_in)
        .await
        .with_context(|| format!("presign download {key}"))?;
    Ok(PresignedDownload {
        url,
        key: key.to_string(),
        expires_in,
    })
}
