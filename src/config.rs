use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

const DEV_JWT_SECRET: &str = "dev-secret";
/// Tokens live at most a leap year.
pub const MAX_JWT_TTL_MINUTES: i64 = 366 * 24 * 60;
const DEFAULT_ORIGINS: &str = "http://localhost:3000,http://localhost:5173,http://localhost:8000";

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

/// Which record store backs the user table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    DynamoDb,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dynamodb" | "dynamo" => Ok(Self::DynamoDb),
            "memory" | "mem" => Ok(Self::Memory),
            other => bail!("unknown store backend {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub region: String,
    pub endpoint: Option<String>,
    pub users_table: String,
    pub auto_create_table: bool,
    pub timeout_ms: u64,
    /// How long scan-mode lookups wait before asking again whether the email
    /// index has come up.
    pub index_recheck_secs: u64,
}

impl StoreConfig {
    /// Local DynamoDB endpoints are provisioned even without the explicit flag.
    pub fn should_provision(&self) -> bool {
        self.auto_create_table
            || self
                .endpoint
                .as_deref()
                .is_some_and(|e| e.contains("localhost") || e.contains("127.0.0.1"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn index_recheck(&self) -> Duration {
        Duration::from_secs(self.index_recheck_secs)
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub presign_ttl_secs: u64,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    pub allowed_origins: Vec<String>,
    pub static_dir: PathBuf,
    pub expose_error_detail: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = get("APP_ENV").unwrap_or_else(|| "development".into());
        let is_dev = matches!(environment.as_str(), "development" | "local" | "test");

        let secret = get("JWT_SECRET").unwrap_or_else(|| DEV_JWT_SECRET.into());
        if secret == DEV_JWT_SECRET {
            if environment == "production" {
                bail!("JWT_SECRET must be set in production");
            }
            warn!("JWT_SECRET not set; using the development default");
        }

        let jwt = JwtConfig {
            secret,
            issuer: get("JWT_ISSUER").unwrap_or_else(|| "vittcott".into()),
            audience: get("JWT_AUDIENCE").unwrap_or_else(|| "vittcott-users".into()),
            ttl_minutes: parse_or(&get, "JWT_TTL_MINUTES", 60)?,
        };
        if !(1..=MAX_JWT_TTL_MINUTES).contains(&jwt.ttl_minutes) {
            bail!(
                "JWT_TTL_MINUTES must be between 1 and {MAX_JWT_TTL_MINUTES}, got {}",
                jwt.ttl_minutes
            );
        }

        let store = StoreConfig {
            backend: parse_or(&get, "STORE_BACKEND", StoreBackend::DynamoDb)?,
            region: get("AWS_REGION").unwrap_or_else(|| "ap-south-1".into()),
            endpoint: get("DYNAMODB_ENDPOINT"),
            users_table: get("USERS_TABLE").unwrap_or_else(|| "Vittcott_Users".into()),
            auto_create_table: parse_bool_or(&get, "AUTO_CREATE_TABLE", false)?,
            timeout_ms: parse_or(&get, "STORE_TIMEOUT_MS", 5_000)?,
            index_recheck_secs: parse_or(&get, "STORE_INDEX_RECHECK_SECS", 300)?,
        };

        let storage = StorageConfig {
            bucket: get("S3_BUCKET").unwrap_or_else(|| "vittcott-uploads-xyz123".into()),
            presign_ttl_secs: parse_or(&get, "S3_PRESIGN_TTL_SECS", 3_600)?,
            max_upload_bytes: parse_or(&get, "UPLOAD_MAX_BYTES", 10 * 1024 * 1024)?,
        };

        let allowed_origins = get("FRONTEND_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ORIGINS.into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 3000)?,
            store,
            jwt,
            storage,
            allowed_origins,
            static_dir: get("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("src/frontend_build")),
            expose_error_detail: parse_bool_or(&get, "EXPOSE_ERROR_DETAIL", is_dev)?,
            environment,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> anyhow::Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
        Some(v) => bail!("invalid value for {key}: {v:?}"),
        None => Ok(default),
    }
}
