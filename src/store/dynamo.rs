use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::{
    config::{http::HttpResponse, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    operation::{
        query::{QueryError, QueryOutput},
        transact_write_items::TransactWriteItemsError,
        update_item::UpdateItemError,
    },
    types::{
        AttributeDefinition, AttributeValue, GlobalSecondaryIndex, IndexStatus, KeySchemaElement,
        KeyType, Projection, ProjectionType, ProvisionedThroughput, Put, ScalarAttributeType,
        TableDescription, TableStatus, TransactWriteItem,
    },
    Client,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EmailLookup, StoreError, UserStore, EMAIL_INDEX};
use crate::{auth::repo_types::UserRecord, config::StoreConfig};

type Item = HashMap<String, AttributeValue>;

const DEFAULT_RECHECK: Duration = Duration::from_secs(300);

/// Users table in DynamoDB.
///
/// Email lookups follow [`EmailLookup`]. The strategy starts at `Scan`, is
/// switched by [`DynamoUserStore::refresh_lookup`], and is re-checked while
/// scanning once per re-check interval. A query that finds the index gone
/// drops back to scans immediately.
pub struct DynamoUserStore {
    client: Client,
    table: String,
    index_ready: AtomicBool,
    started: Instant,
    // Milliseconds after `started` of the latest index check.
    last_check_ms: AtomicU64,
    recheck_after: Duration,
}

impl DynamoUserStore {
    pub async fn connect(cfg: &StoreConfig) -> anyhow::Result<Self> {
        let mut loader = defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));
        if let Some(endpoint) = cfg.endpoint.as_deref() {
            loader = loader.endpoint_url(endpoint);
            // DynamoDB Local accepts any signature.
            if endpoint.contains("localhost") || endpoint.contains("127.0.0.1") {
                loader = loader.credentials_provider(Credentials::new(
                    "local", "local", None, None, "static",
                ));
            }
        }
        let shared = loader.load().await;
        info!(region = %cfg.region, endpoint = ?cfg.endpoint, table = %cfg.users_table, "dynamodb client ready");
        Ok(Self::from_client(Client::new(&shared), &cfg.users_table)
            .with_recheck_interval(cfg.index_recheck()))
    }

    pub fn from_client(client: Client, table: &str) -> Self {
        Self {
            client,
            table: table.to_string(),
            index_ready: AtomicBool::new(false),
            started: Instant::now(),
            last_check_ms: AtomicU64::new(0),
            recheck_after: DEFAULT_RECHECK,
        }
    }

    pub fn with_recheck_interval(mut self, every: Duration) -> Self {
        self.recheck_after = every;
        self
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// True for exactly one caller per elapsed re-check interval.
    fn claim_recheck(&self) -> bool {
        let last = self.last_check_ms.load(Ordering::Relaxed);
        let now = self.elapsed_ms();
        now.saturating_sub(last) >= self.recheck_after.as_millis() as u64
            && self
                .last_check_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }

    /// Asks DynamoDB whether the email index exists and is active, and switches
    /// the lookup strategy to match. A failed check leaves the strategy alone.
    pub async fn refresh_lookup(&self) -> EmailLookup {
        self.last_check_ms.store(self.elapsed_ms(), Ordering::Relaxed);
        match self.client.describe_table().table_name(&self.table).send().await {
            Ok(out) => {
                let ready = email_index_active(out.table());
                self.index_ready.store(ready, Ordering::Relaxed);
                if ready {
                    info!(table = %self.table, index = EMAIL_INDEX, "email lookups use the index");
                } else {
                    warn!(table = %self.table, index = EMAIL_INDEX, "email index unavailable; falling back to table scans");
                }
            }
            Err(e) => {
                warn!(
                    table = %self.table,
                    lookup = %self.lookup_strategy(),
                    error = %DisplayErrorContext(&e),
                    "describe_table failed; keeping current lookup"
                );
            }
        }
        self.lookup_strategy()
    }

    /// Creates the users table with its email index. An existing table is fine.
    pub async fn provision(&self) -> anyhow::Result<()> {
        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(5)
            .write_capacity_units(5)
            .build()?;

        let result = self
            .client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("pk")
                    .attribute_type(ScalarAttributeType::S)
                    .build()?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("email")
                    .attribute_type(ScalarAttributeType::S)
                    .build()?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("pk")
                    .key_type(KeyType::Hash)
                    .build()?,
            )
            .global_secondary_indexes(
                GlobalSecondaryIndex::builder()
                    .index_name(EMAIL_INDEX)
                    .key_schema(
                        KeySchemaElement::builder()
                            .attribute_name("email")
                            .key_type(KeyType::Hash)
                            .build()?,
                    )
                    .projection(
                        Projection::builder()
                            .projection_type(ProjectionType::All)
                            .build(),
                    )
                    .provisioned_throughput(throughput.clone())
                    .build()?,
            )
            .provisioned_throughput(throughput)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %self.table, "users table created");
                self.wait_until_active().await?;
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_resource_in_use_exception() {
                    info!(table = %self.table, "users table already exists");
                } else {
                    return Err(anyhow::Error::new(service_err))
                        .with_context(|| format!("create table {}", self.table));
                }
            }
        }
        Ok(())
    }

    async fn wait_until_active(&self) -> anyhow::Result<()> {
        for _ in 0..30 {
            let out = self
                .client
                .describe_table()
                .table_name(&self.table)
                .send()
                .await
                .context("describe table")?;
            if out.table().and_then(|t| t.table_status()) == Some(&TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        warn!(table = %self.table, "users table not active yet; continuing");
        Ok(())
    }

    async fn query_index(
        &self,
        email: &str,
    ) -> Result<QueryOutput, SdkError<QueryError, HttpResponse>> {
        self.client
            .query()
            .table_name(&self.table)
            .index_name(EMAIL_INDEX)
            .key_condition_expression("email = :e")
            .expression_attribute_values(":e", AttributeValue::S(email.to_string()))
            .limit(1)
            .send()
            .await
    }

    // Scan's Limit applies before the filter, so page until a match or the end.
    async fn scan_table(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let mut start_key: Option<Item> = None;
        loop {
            let out = self
                .client
                .scan()
                .table_name(&self.table)
                .filter_expression("email = :e")
                .expression_attribute_values(":e", AttributeValue::S(email.to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| unavailable("scan users table", e))?;
            if let Some(item) = out.items().first() {
                return record_from_item(item).map(Some);
            }
            match out.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl UserStore for DynamoUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let mut lookup = self.lookup_strategy();
        if lookup == EmailLookup::Scan && self.claim_recheck() {
            lookup = self.refresh_lookup().await;
        }
        debug!(%lookup, "dynamodb find_by_email");

        match lookup {
            EmailLookup::Scan => self.scan_table(email).await,
            EmailLookup::Index => match self.query_index(email).await {
                Ok(out) => out.items().first().map(record_from_item).transpose(),
                Err(e) if email_index_missing(&e) => {
                    warn!(
                        table = %self.table,
                        index = EMAIL_INDEX,
                        error = %DisplayErrorContext(&e),
                        "email index query failed; scanning instead"
                    );
                    self.index_ready.store(false, Ordering::Relaxed);
                    self.refresh_lookup().await;
                    self.scan_table(email).await
                }
                Err(e) => Err(unavailable("query email index", e)),
            },
        }
    }

    async fn find_by_pk(&self, pk: &str) -> Result<Option<UserRecord>, StoreError> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(pk.to_string()))
            .send()
            .await
            .map_err(|e| unavailable("get user", e))?;
        out.item().map(record_from_item).transpose()
    }

    async fn create(&self, user: &UserRecord) -> Result<(), StoreError> {
        let user_put = conditional_put(&self.table, record_to_item(user))?;
        let claim_put = conditional_put(&self.table, email_claim_item(user))?;

        let result = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(user_put).build())
            .transact_items(TransactWriteItem::builder().put(claim_put).build())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let detail = DisplayErrorContext(&e).to_string();
                match e.into_service_error() {
                    TransactWriteItemsError::TransactionCanceledException(c)
                        if c
                            .cancellation_reasons()
                            .iter()
                            .any(|r| r.code() == Some("ConditionalCheckFailed")) =>
                    {
                        Err(StoreError::Conflict(user.email.clone()))
                    }
                    _ => Err(StoreError::Unavailable(format!("put user: {detail}"))),
                }
            }
        }
    }

    async fn add_s3_key(&self, pk: &str, key: &str) -> Result<(), StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(pk.to_string()))
            .update_expression("SET s3Keys = list_append(if_not_exists(s3Keys, :empty), :key)")
            .condition_expression("attribute_exists(pk)")
            .expression_attribute_values(":empty", AttributeValue::L(Vec::new()))
            .expression_attribute_values(
                ":key",
                AttributeValue::L(vec![AttributeValue::S(key.to_string())]),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(
                    e.as_service_error(),
                    Some(UpdateItemError::ConditionalCheckFailedException(_))
                ) {
                    return Err(StoreError::Missing(pk.to_string()));
                }
                Err(unavailable("append s3 key", e))
            }
        }
    }

    fn lookup_strategy(&self) -> EmailLookup {
        if self.index_ready.load(Ordering::Relaxed) {
            EmailLookup::Index
        } else {
            EmailLookup::Scan
        }
    }
}

fn email_index_active(table: Option<&TableDescription>) -> bool {
    table.is_some_and(|t| {
        t.global_secondary_indexes().iter().any(|gsi| {
            gsi.index_name() == Some(EMAIL_INDEX) && gsi.index_status() == Some(&IndexStatus::Active)
        })
    })
}

// DynamoDB reports an unknown index as a ValidationException naming it.
fn email_index_missing(err: &SdkError<QueryError, HttpResponse>) -> bool {
    match err.as_service_error() {
        Some(QueryError::ResourceNotFoundException(_)) => true,
        Some(other) => {
            other.code() == Some("ValidationException")
                && other.message().is_some_and(|m| m.contains("index"))
        }
        None => false,
    }
}

fn unavailable<E>(op: &str, e: E) -> StoreError
where
    E: std::error::Error,
{
    StoreError::Unavailable(format!("{op}: {}", DisplayErrorContext(&e)))
}

fn conditional_put(table: &str, item: Item) -> Result<Put, StoreError> {
    Put::builder()
        .table_name(table)
        .set_item(Some(item))
        .condition_expression("attribute_not_exists(pk)")
        .build()
        .map_err(|e| StoreError::Unavailable(format!("build put: {e}")))
}

fn email_claim_key(email: &str) -> String {
    format!("EMAIL#{email}")
}

/// The claim item holds no `email` attribute, so neither the index nor the
/// scan filter ever sees it.
fn email_claim_item(user: &UserRecord) -> Item {
    HashMap::from([
        ("pk".to_string(), AttributeValue::S(email_claim_key(&user.email))),
        ("ownerPk".to_string(), AttributeValue::S(user.pk.clone())),
    ])
}

fn record_to_item(u: &UserRecord) -> Item {
    let created_at = u
        .created_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| u.created_at.unix_timestamp().to_string());
    HashMap::from([
        ("pk".to_string(), AttributeValue::S(u.pk.clone())),
        ("userId".to_string(), AttributeValue::S(u.user_id.to_string())),
        ("email".to_string(), AttributeValue::S(u.email.clone())),
        (
            "hashedPassword".to_string(),
            AttributeValue::S(u.hashed_password.clone()),
        ),
        (
            "displayName".to_string(),
            match &u.display_name {
                Some(name) => AttributeValue::S(name.clone()),
                None => AttributeValue::Null(true),
            },
        ),
        ("createdAt".to_string(), AttributeValue::S(created_at)),
        (
            "isEmailVerified".to_string(),
            AttributeValue::Bool(u.is_email_verified),
        ),
        (
            "s3Keys".to_string(),
            AttributeValue::L(u.s3_keys.iter().cloned().map(AttributeValue::S).collect()),
        ),
    ])
}

fn required_s<'a>(item: &'a Item, name: &str) -> Result<&'a str, StoreError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| StoreError::Corrupt(format!("missing string attribute {name}")))
}

fn record_from_item(item: &Item) -> Result<UserRecord, StoreError> {
    let user_id = required_s(item, "userId")?;
    let user_id = Uuid::parse_str(user_id)
        .map_err(|e| StoreError::Corrupt(format!("userId {user_id:?}: {e}")))?;
    let created_at = required_s(item, "createdAt")?;
    let created_at = OffsetDateTime::parse(created_at, &Rfc3339)
        .map_err(|e| StoreError::Corrupt(format!("createdAt {created_at:?}: {e}")))?;

    let s3_keys = match item.get("s3Keys") {
        Some(AttributeValue::L(list)) => list
            .iter()
            .filter_map(|v| v.as_s().ok().cloned())
            .collect(),
        Some(AttributeValue::Ss(set)) => set.clone(),
        _ => Vec::new(),
    };

    Ok(UserRecord {
        pk: required_s(item, "pk")?.to_string(),
        user_id,
        email: required_s(item, "email")?.to_string(),
        hashed_password: required_s(item, "hashedPassword")?.to_string(),
        display_name: item
            .get("displayName")
            .and_then(|v| v.as_s().ok())
            .cloned(),
        created_at,
        is_email_verified: item
            .get("isEmailVerified")
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false),
        s3_keys,
    })
}
