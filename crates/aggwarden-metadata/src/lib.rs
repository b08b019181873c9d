//! Aggwarden Metadata Store
//!
//! This crate persists aggregation rule definitions and coordinates exclusive
//! execution of each rule across a fleet of workers.
//!
//! ## Purpose
//!
//! Two tables live side by side in one SQLite database:
//! - **aggregation_rules**: how raw events are rolled up (window, metric, grouping)
//! - **aggregation_locks**: short-lived leases granting one worker the right to
//!   run a rule (or one window of a rule) at a time
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  list_active / get   ┌──────────────────────┐
//! │  Scheduler   │ ───────────────────► │      RuleStore       │
//! │   / Engine   │                      │ (aggregation_rules)  │
//! └──────┬───────┘                      └──────────▲───────────┘
//!        │ acquire / renew / release               │ backfill
//!        ▼                                         │
//! ┌──────────────────────┐              ┌──────────┴───────────┐
//! │      LeaseStore      │              │    SchemaMigrator    │
//! │ (aggregation_locks)  │              │  (runs at init time) │
//! └──────────────────────┘              └──────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use aggwarden_metadata::{init, LeaseKey, LeaseStore, NewRule, RuleStore};
//! use std::time::Duration;
//!
//! // Create tables/indexes and upgrade legacy documents
//! let (store, report) = init::initialize("./data/aggwarden.db").await?;
//!
//! store.create(NewRule::new("rule_1m", "1m", "event_count", vec!["event_type".into()])).await?;
//!
//! let key = LeaseKey::for_rule("rule_1m");
//! let lease = store.acquire_lease(&key, "worker-a", Duration::from_secs(30)).await?;
//! // ... run the rule ...
//! store.release_lease(&key, "worker-a").await?;
//! ```
//!
//! ## Implementation Details
//!
//! - Uniqueness of `rule_id` is enforced by a unique index, never by a
//!   read-then-insert check
//! - Lease acquisition is a single conditional upsert; an expired record is
//!   overwritten in the same statement
//! - Expiry is evaluated at read time (`expires_at > now`); physical removal of
//!   expired rows is an optional sweep
//! - Timestamps are i64 milliseconds read from an injected [`Clock`]
//!
//! ### Thread Safety
//! - SQLx connection pool handles concurrent access
//! - WAL journal mode lets readers proceed while the migrator writes
//! - Safe to share across async tasks via Arc<>

pub mod clock;
pub mod error;
pub mod init;
mod leases;
pub mod migrator;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{MetadataError, Result};
pub use migrator::SchemaMigrator;
pub use store::SqliteMetadataStore;
pub use types::*;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Rule store trait - persistence of aggregation rule documents.
///
/// ## Error Handling
///
/// - `DuplicateRuleId`: `rule_id` collides with an existing rule
/// - `InvalidRule`: required fields missing, empty, or malformed
/// - `RuleNotFound`: no rule with the requested `rule_id`
/// - `DatabaseError`: underlying database failure
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert a new rule.
    ///
    /// Validation runs first; uniqueness is decided by the store's unique
    /// index, so two concurrent creates with the same `rule_id` can never both
    /// succeed.
    ///
    /// # Errors
    ///
    /// - `InvalidRule`: a required field is empty or malformed
    /// - `DuplicateRuleId`: `rule_id` already exists
    async fn create(&self, rule: NewRule) -> Result<AggregationRule>;

    /// Get a rule by its external identifier.
    ///
    /// # Errors
    ///
    /// - `RuleNotFound`: no such rule
    /// - `InvalidRule`: the stored document predates the current schema
    async fn get(&self, rule_id: &str) -> Result<AggregationRule>;

    /// Stream all active rules, ordered by `rule_id`.
    ///
    /// Rows are fetched lazily. Each call issues a fresh query, so dropping the
    /// stream and calling again restarts from a new snapshot. Documents that
    /// still lack required fields are skipped.
    fn list_active(&self) -> BoxStream<'_, Result<AggregationRule>>;

    /// Activate or deactivate a rule. Idempotent; returns the updated rule.
    async fn set_active(&self, rule_id: &str, active: bool) -> Result<AggregationRule>;

    /// Insert a raw, possibly partial document (legacy authoring path).
    ///
    /// An empty `id` is replaced by a fresh store identity. Returns the id.
    async fn import_document(&self, document: RuleDocument) -> Result<String>;

    /// Read a raw document by store identity.
    async fn get_document(&self, id: &str) -> Result<Option<RuleDocument>>;

    /// All complete rules regardless of activity, ordered by `rule_id`.
    async fn list_rules(&self) -> Result<Vec<AggregationRule>>;
}

/// Lease store trait - the store-level execution lease protocol.
///
/// A lease is live while `expires_at > now`. Expired records behave exactly
/// like absent ones for every operation, whether or not they have been
/// physically removed.
///
/// ## Semantics
///
/// | operation | no live lease | live, same owner | live, other owner |
/// |-----------|---------------|------------------|-------------------|
/// | acquire   | granted       | `LeaseHeld`      | `LeaseHeld`       |
/// | renew     | `LeaseExpired`| extended         | `NotOwner`        |
/// | release   | no-op         | deleted          | `NotOwner`        |
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically create the lease if no live lease exists for `key`.
    ///
    /// # Errors
    ///
    /// - `LeaseHeld`: a live lease exists; carries the current owner
    /// - `InvalidLeaseTtl`: `ttl` rounds to zero milliseconds
    ///
    /// # Examples
    ///
    /// ```ignore
    /// match store.acquire_lease(&key, "worker-a", Duration::from_secs(30)).await {
    ///     Ok(lease) => println!("running until {}", lease.expires_at),
    ///     Err(MetadataError::LeaseHeld { owner, .. }) => println!("{} is running it", owner),
    ///     Err(e) => return Err(e),
    /// }
    /// ```
    async fn acquire_lease(
        &self,
        key: &LeaseKey,
        owner: &str,
        ttl: Duration,
    ) -> Result<ExecutionLease>;

    /// Delete the lease if `owner` holds it.
    ///
    /// Succeeds without effect when there is no live lease.
    ///
    /// # Errors
    ///
    /// - `NotOwner`: a live lease belongs to another owner (left untouched)
    async fn release_lease(&self, key: &LeaseKey, owner: &str) -> Result<()>;

    /// Extend an owned, live lease to `now + ttl`.
    ///
    /// # Errors
    ///
    /// - `LeaseExpired`: there is no live lease for `key`
    /// - `NotOwner`: the live lease belongs to another owner
    async fn renew_lease(
        &self,
        key: &LeaseKey,
        owner: &str,
        ttl: Duration,
    ) -> Result<ExecutionLease>;

    /// Current live lease for `key`, if any.
    async fn get_lease(&self, key: &LeaseKey) -> Result<Option<ExecutionLease>>;

    /// All live leases, optionally only those held by `owner`, ordered by key.
    async fn list_leases(&self, owner: Option<&str>) -> Result<Vec<ExecutionLease>>;

    /// Physically delete expired lease records. Returns the number removed.
    async fn reap_expired_leases(&self) -> Result<u64>;
}
