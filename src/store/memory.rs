use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{EmailLookup, StoreError, UserStore};
use crate::auth::repo_types::UserRecord;

#[derive(Default)]
struct Table {
    rows: HashMap<String, UserRecord>,
    email_index: HashMap<String, String>,
}

/// In-process users table for tests and local runs without DynamoDB.
///
/// Uniqueness is checked and written under one write lock, so concurrent
/// registrations of the same email cannot both succeed.
pub struct MemoryUserStore {
    table: RwLock<Table>,
    lookup: EmailLookup,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::with_lookup(EmailLookup::Index)
    }

    pub fn with_lookup(lookup: EmailLookup) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            lookup,
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let table = self.table.read().await;
        let found = match self.lookup {
            EmailLookup::Index => table
                .email_index
                .get(email)
                .and_then(|pk| table.rows.get(pk)),
            EmailLookup::Scan => table.rows.values().find(|u| u.email == email),
        };
        debug!(lookup = %self.lookup, hit = found.is_some(), "memory find_by_email");
        Ok(found.cloned())
    }

    async fn find_by_pk(&self, pk: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.table.read().await.rows.get(pk).cloned())
    }

    async fn create(&self, user: &UserRecord) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        if table.rows.contains_key(&user.pk) {
            return Err(StoreError::Conflict(user.pk.clone()));
        }
        if table.email_index.contains_key(&user.email) {
            return Err(StoreError::Conflict(user.email.clone()));
        }
        table.email_index.insert(user.email.clone(), user.pk.clone());
        table.rows.insert(user.pk.clone(), user.clone());
        Ok(())
    }

    async fn add_s3_key(&self, pk: &str, key: &str) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        let user = table
            .rows
            .get_mut(pk)
            .ok_or_else(|| StoreError::Missing(pk.to_string()))?;
        if !user.s3_keys.iter().any(|k| k == key) {
            user.s3_keys.push(key.to_string());
        }
        Ok(())
    }

    fn lookup_strategy(&self) -> EmailLookup {
        self.lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn record(email: &str) -> UserRecord {
        UserRecord::new(Uuid::new_v4(), email.into(), "$argon2id$fake".into(), None)
    }

    #[tokio::test]
    async fn index_and_scan_find_the_same_record() {
        for lookup in [EmailLookup::Index, EmailLookup::Scan] {
            let store = MemoryUserStore::with_lookup(lookup);
            let user = record("a@b.com");
            store.create(&user).await.unwrap();
            store.create(&record("c@d.com")).await.unwrap();

            let found = store.find_by_email("a@b.com").await.unwrap().expect("found");
            assert_eq!(found.user_id, user.user_id, "lookup {lookup}");
            assert!(store.find_by_email("x@y.com").await.unwrap().is_none());
            assert_eq!(store.lookup_strategy(), lookup);
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email() {
        let store = MemoryUserStore::new();
        store.create(&record("a@b.com")).await.unwrap();
        let err = store.create(&record("a@b.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_pk() {
        let store = MemoryUserStore::new();
        let user = record("a@b.com");
        store.create(&user).await.unwrap();
        let mut clash = record("other@b.com");
        clash.pk = user.pk.clone();
        assert!(matches!(
            store.create(&clash).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_creates_admit_one_winner() {
        let store = Arc::new(MemoryUserStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create(&record("race@b.com")).await.is_ok()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn s3_keys_append_once_per_key() {
        let store = MemoryUserStore::new();
        let user = record("a@b.com");
        store.create(&user).await.unwrap();
        store.add_s3_key(&user.pk, "users/x/1.png").await.unwrap();
        store.add_s3_key(&user.pk, "users/x/2.png").await.unwrap();
        store.add_s3_key(&user.pk, "users/x/1.png").await.unwrap();

        let found = store.find_by_pk(&user.pk).await.unwrap().unwrap();
        assert_eq!(found.s3_keys, vec!["users/x/1.png", "users/x/2.png"]);

        assert!(matches!(
            store.add_s3_key("USER#missing", "k").await,
            Err(StoreError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn find_by_pk_returns_created_record() {
        let store = MemoryUserStore::new();
        let user = record("a@b.com");
        store.create(&user).await.unwrap();
        let found = store.find_by_pk(&user.pk).await.unwrap().unwrap();
        assert_eq!(found.email, "a@b.com");
        assert!(store.find_by_pk("USER#missing").await.unwrap().is_none());
    }
}
