use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_sdk_s3::{config::Region, presigning::PresigningConfig, Client};

/// Object storage for user uploads. Clients move bytes directly with
/// presigned URLs; the server only signs, inspects and deletes.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Signs a PUT bound to one content type and exact length.
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        content_length: u64,
        seconds: u64,
    ) -> anyhow::Result<String>;
    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String>;
    /// Size of a stored object, `None` when there is no such key.
    async fn object_size(&self, key: &str) -> anyhow::Result<Option<u64>>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(region: &str, bucket: &str) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Ok(Self {
            client: Client::new(&shared),
            bucket: bucket.to_string(),
        })
    }
}

#[async_trait]
impl StorageClient for Storage {
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        content_length: u64,
        seconds: u64,
    ) -> anyhow::Result<String> {
        let length = i64::try_from(content_length).context("content length out of range")?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(length)
            .presigned(PresigningConfig::expires_in(Duration::from_secs(seconds))?)
            .await
            .context("s3 presign_put")?;
        Ok(presigned.uri().to_string())
    }

    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(Duration::from_secs(seconds))?)
            .await
            .context("s3 presign_get")?;
        Ok(presigned.uri().to_string())
    }

    async fn object_size(&self, key: &str) -> anyhow::Result<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(out.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(anyhow::Error::new(service_err)).context("s3 head_object")
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }
}
