//! Record store adapter for the users table.
//!
//! The table is keyed by `pk` and carries a secondary index on `email`. When the
//! index is not available the adapter looks users up with a full-table scan
//! instead. Which path is active is an explicit [`EmailLookup`] chosen by a
//! capability check against the table description; a query that reports the
//! index missing only triggers a fresh check.

pub mod dynamo;
pub mod memory;

use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::repo_types::UserRecord;

pub use dynamo::DynamoUserStore;
pub use memory::MemoryUserStore;

/// Name of the secondary index on `email`.
pub const EMAIL_INDEX: &str = "GSI_Email";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write found the key (or email) already taken.
    #[error("conditional write rejected: {0} already exists")]
    Conflict(String),

    /// An update targeted a record that does not exist.
    #[error("no record {0}")]
    Missing(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// How `find_by_email` reaches a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailLookup {
    /// Query the email index.
    Index,
    /// Filter the whole table; slow but works before the index exists.
    Scan,
}

impl fmt::Display for EmailLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmailLookup::Index => f.write_str("index"),
            EmailLookup::Scan => f.write_str("scan"),
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns at most one record whose normalized email matches.
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn find_by_pk(&self, pk: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Writes the record only if neither its `pk` nor its email is taken.
    async fn create(&self, user: &UserRecord) -> Result<(), StoreError>;

    /// Appends an uploaded object key to the user's `s3Keys`.
    async fn add_s3_key(&self, pk: &str, key: &str) -> Result<(), StoreError>;

    fn lookup_strategy(&self) -> EmailLookup;
}

/// Bounds a store call; expiry surfaces as [`StoreError::Unavailable`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Unavailable(format!(
            "store call exceeded {}ms deadline",
            deadline.as_millis()
        ))),
    }
}
