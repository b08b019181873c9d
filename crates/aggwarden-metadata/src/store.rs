//! SQLite Metadata Store Implementation
//!
//! This module implements the `RuleStore` trait using SQLite as the backend.
//! The `LeaseStore` implementation for the same type lives in `leases.rs`.
//!
//! ## Usage
//!
//! ### File-Based (Production)
//! ```ignore
//! use aggwarden_metadata::{SqliteMetadataStore, RuleStore};
//!
//! // Creates aggwarden.db (or opens it) and ensures tables/indexes exist
//! let store = SqliteMetadataStore::new("aggwarden.db").await?;
//! let rule = store.get("rule_1m").await?;
//! ```
//!
//! ### In-Memory (Testing)
//! ```ignore
//! let store = SqliteMetadataStore::new_in_memory().await?;
//! ```
//!
//! ## Implementation Details
//!
//! ### Connection Pool
//! - File databases use a pool of 10 connections in WAL mode
//! - In-memory databases use a single connection (each SQLite connection
//!   would otherwise see its own private database)
//!
//! ### Migrations
//! - `sqlx::migrate!` runs on every open and creates tables and indexes
//! - A failure here is fatal: the store is never handed out with its unique
//!   and expiry indexes missing
//!
//! ### Missing Fields
//! - Legacy documents may lack any column except `id`; these are NULL
//! - `group_by` is stored as a JSON array

use crate::{
    clock::{Clock, SystemClock},
    error::{MetadataError, Result},
    types::*,
    RuleStore,
};
use async_trait::async_trait;
use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SELECT_RULE_BY_RULE_ID: &str = r#"
    SELECT id, rule_id, is_active, window_size, metric, group_by, top_n,
           created_at, migrated_at, updated_at
    FROM aggregation_rules
    WHERE rule_id = ?
"#;

const SELECT_RULE_BY_ID: &str = r#"
    SELECT id, rule_id, is_active, window_size, metric, group_by, top_n,
           created_at, migrated_at, updated_at
    FROM aggregation_rules
    WHERE id = ?
"#;

const SELECT_ACTIVE_RULES: &str = r#"
    SELECT id, rule_id, is_active, window_size, metric, group_by, top_n,
           created_at, migrated_at, updated_at
    FROM aggregation_rules
    WHERE COALESCE(is_active, 1) = 1
    ORDER BY rule_id
"#;

const SELECT_IDENTIFIED_RULES: &str = r#"
    SELECT id, rule_id, is_active, window_size, metric, group_by, top_n,
           created_at, migrated_at, updated_at
    FROM aggregation_rules
    WHERE rule_id IS NOT NULL
    ORDER BY rule_id
"#;

/// SQLite-based rule and lease store
pub struct SqliteMetadataStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteMetadataStore {
    /// Open (or create) a file-backed store using the system clock.
    ///
    /// Accepts a plain path, a `sqlite:` URL, or `:memory:`.
    pub async fn new(path: &str) -> Result<Self> {
        Self::with_clock(path, Arc::new(SystemClock)).await
    }

    /// Open (or create) a store reading time from `clock`.
    pub async fn with_clock(path: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if path == ":memory:" || path == "sqlite::memory:" {
            return Self::new_in_memory_with_clock(clock).await;
        }

        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, clock).await
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        Self::new_in_memory_with_clock(Arc::new(SystemClock)).await
    }

    /// Create in-memory database with an injected clock (for testing)
    pub async fn new_in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool, clock).await
    }

    async fn from_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        // Tables and indexes
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, clock })
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Clock used for timestamps and lease expiry
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

/// Raw row shape shared by every rule query.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RuleRow {
    id: String,
    rule_id: Option<String>,
    is_active: Option<bool>,
    window_size: Option<String>,
    metric: Option<String>,
    group_by: Option<String>,
    top_n: Option<i64>,
    created_at: Option<i64>,
    migrated_at: Option<i64>,
    updated_at: Option<i64>,
}

impl TryFrom<RuleRow> for RuleDocument {
    type Error = MetadataError;

    fn try_from(row: RuleRow) -> Result<Self> {
        let group_by = row
            .group_by
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;

        Ok(RuleDocument {
            id: row.id,
            rule_id: row.rule_id,
            is_active: row.is_active,
            window_size: row.window_size,
            metric: row.metric,
            group_by,
            top_n: row.top_n,
            created_at: row.created_at,
            migrated_at: row.migrated_at,
            updated_at: row.updated_at,
        })
    }
}

/// Complete rule for a row, or `None` (with a warning) if the document still
/// predates the current schema.
fn complete_rule(row: RuleRow) -> Result<Option<AggregationRule>> {
    let document = RuleDocument::try_from(row)?;
    let id = document.id.clone();
    match document.into_rule() {
        Ok(rule) => Ok(Some(rule)),
        Err(e) => {
            warn!(id = %id, error = %e, "Skipping incomplete aggregation rule");
            Ok(None)
        }
    }
}

#[async_trait]
impl RuleStore for SqliteMetadataStore {
    async fn create(&self, rule: NewRule) -> Result<AggregationRule> {
        rule.validate()?;

        let id = Uuid::new_v4().to_string();
        let now = self.now_ms();
        let group_by_json = serde_json::to_string(&rule.group_by)?;

        let result = sqlx::query(
            r#"
            INSERT INTO aggregation_rules (
                id, rule_id, is_active, window_size, metric, group_by, top_n,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&rule.rule_id)
        .bind(rule.is_active)
        .bind(&rule.window_size)
        .bind(&rule.metric)
        .bind(&group_by_json)
        .bind(rule.top_n)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if MetadataError::is_unique_violation(&e) {
                return Err(MetadataError::DuplicateRuleId(rule.rule_id));
            }
            return Err(e.into());
        }

        info!(
            rule_id = %rule.rule_id,
            window_size = %rule.window_size,
            metric = %rule.metric,
            "Created aggregation rule"
        );

        Ok(AggregationRule {
            id,
            rule_id: rule.rule_id,
            is_active: rule.is_active,
            window_size: rule.window_size,
            metric: rule.metric,
            group_by: rule.group_by,
            top_n: rule.top_n,
            created_at: Some(now),
            migrated_at: None,
            updated_at: Some(now),
        })
    }

    async fn get(&self, rule_id: &str) -> Result<AggregationRule> {
        let row = sqlx::query_as::<_, RuleRow>(SELECT_RULE_BY_RULE_ID)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::RuleNotFound(rule_id.to_string()))?;

        RuleDocument::try_from(row)?.into_rule()
    }

    fn list_active(&self) -> BoxStream<'_, Result<AggregationRule>> {
        sqlx::query_as::<_, RuleRow>(SELECT_ACTIVE_RULES)
            .fetch(&self.pool)
            .map_err(MetadataError::from)
            .try_filter_map(|row| future::ready(complete_rule(row)))
            .boxed()
    }

    async fn set_active(&self, rule_id: &str, active: bool) -> Result<AggregationRule> {
        let rows_affected = sqlx::query(
            "UPDATE aggregation_rules SET is_active = ?, updated_at = ? WHERE rule_id = ?",
        )
        .bind(active)
        .bind(self.now_ms())
        .bind(rule_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(MetadataError::RuleNotFound(rule_id.to_string()));
        }

        info!(rule_id = %rule_id, active, "Updated aggregation rule activity");

        self.get(rule_id).await
    }

    async fn import_document(&self, document: RuleDocument) -> Result<String> {
        let id = if document.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            document.id.clone()
        };

        let group_by_json = document
            .group_by
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO aggregation_rules (
                id, rule_id, is_active, window_size, metric, group_by, top_n,
                created_at, migrated_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&document.rule_id)
        .bind(document.is_active)
        .bind(&document.window_size)
        .bind(&document.metric)
        .bind(&group_by_json)
        .bind(document.top_n)
        .bind(document.created_at)
        .bind(document.migrated_at)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if MetadataError::is_unique_violation(&e) {
                return Err(MetadataError::DuplicateRuleId(
                    document.rule_id.unwrap_or_default(),
                ));
            }
            return Err(e.into());
        }

        debug!(
            id = %id,
            missing = ?document.missing_fields(),
            "Imported rule document"
        );

        Ok(id)
    }

    async fn get_document(&self, id: &str) -> Result<Option<RuleDocument>> {
        let row = sqlx::query_as::<_, RuleRow>(SELECT_RULE_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RuleDocument::try_from).transpose()
    }

    async fn list_rules(&self) -> Result<Vec<AggregationRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(SELECT_IDENTIFIED_RULES)
            .fetch_all(&self.pool)
            .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let document = RuleDocument::try_from(row)?;
            if let Ok(rule) = document.into_rule() {
                rules.push(rule);
            }
        }

        Ok(rules)
    }
}
