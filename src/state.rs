use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    auth::{jwt::JwtKeys, services::AccountService, session::SessionVerifier},
    config::{AppConfig, StoreBackend},
    error::{ApiError, AppError},
    storage::{Storage, StorageClient},
    store::{DynamoUserStore, MemoryUserStore, UserStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn StorageClient>,
    pub users: Arc<dyn UserStore>,
    pub accounts: Arc<AccountService>,
    pub sessions: Arc<SessionVerifier>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let users: Arc<dyn UserStore> = match config.store.backend {
            StoreBackend::DynamoDb => {
                let store = DynamoUserStore::connect(&config.store).await?;
                if config.store.should_provision() {
                    if let Err(e) = store.provision().await {
                        warn!(error = %format!("{e:#}"), "auto-provisioning users table failed; continuing");
                    }
                }
                store.refresh_lookup().await;
                Arc::new(store)
            }
            StoreBackend::Memory => {
                warn!("using in-memory user store; accounts are lost on restart");
                Arc::new(MemoryUserStore::new())
            }
        };
        info!(lookup = %users.lookup_strategy(), "user store ready");

        let storage = Arc::new(
            Storage::new(&config.store.region, &config.storage.bucket).await?,
        ) as Arc<dyn StorageClient>;

        Ok(Self::from_parts(config, users, storage))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        let keys = Arc::new(JwtKeys::new(&config.jwt));
        let timeout = config.store.timeout();
        Self {
            accounts: Arc::new(AccountService::new(users.clone(), keys.clone(), timeout)),
            sessions: Arc::new(SessionVerifier::new(users.clone(), keys, timeout)),
            users,
            storage,
            config,
        }
    }

    /// Wraps a service error with this deployment's detail policy.
    pub fn api_error(&self, error: AppError) -> ApiError {
        error.exposing_detail(self.config.expose_error_detail)
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with(Arc::new(MemoryUserStore::new()), Arc::new(FakeStorage::default()))
    }

    #[cfg(test)]
    pub fn fake_with(users: Arc<dyn UserStore>, storage: Arc<FakeStorage>) -> Self {
        let config = AppConfig::from_lookup(|key| {
            let value = match key {
                "JWT_SECRET" => "test",
                "JWT_ISSUER" => "test-issuer",
                "JWT_AUDIENCE" => "test-aud",
                "JWT_TTL_MINUTES" => "5",
                "STORE_BACKEND" => "memory",
                "STORE_TIMEOUT_MS" => "1000",
                "STATIC_DIR" => "does-not-exist",
                "UPLOAD_MAX_BYTES" => "1024",
                _ => return None,
            };
            Some(value.to_string())
        })
        .expect("test config");

        Self::from_parts(Arc::new(config), users, storage)
    }

    #[cfg(test)]
    pub fn test_keys(&self) -> JwtKeys {
        JwtKeys::new(&self.config.jwt)
    }
}

/// In-memory bucket: signed URLs are plain strings and objects are just sizes.
#[cfg(test)]
#[derive(Default)]
pub struct FakeStorage {
    objects: std::sync::Mutex<std::collections::HashMap<String, u64>>,
}

#[cfg(test)]
impl FakeStorage {
    pub fn put(&self, key: &str, size: u64) {
        self.objects.lock().unwrap().insert(key.to_string(), size);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl StorageClient for FakeStorage {
    async fn presign_put(
        &self,
        key: &str,
        _content_type: &str,
        content_length: u64,
        seconds: u64,
    ) -> anyhow::Result<String> {
        Ok(format!(
            "https://fake.local/{key}?method=PUT&length={content_length}&expires={seconds}"
        ))
    }

    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String> {
        Ok(format!("https://fake.local/{key}?method=GET&expires={seconds}"))
    }

    async fn object_size(&self, key: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.objects.lock().unwrap().get(key).copied())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}
