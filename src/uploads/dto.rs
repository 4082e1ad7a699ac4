use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Exact byte length the client will PUT.
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub url: String,
    pub key: String,
    pub expires_in: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub ok: bool,
    pub s3_key: String,
    pub size: u64,
    pub download_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub url: String,
    pub key: String,
    pub expires_in: u64,
}
