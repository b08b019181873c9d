//! Metadata Error Types
//!
//! This module defines all error types that can occur during rule store,
//! migration and lease operations.
//!
//! ## Error Categories
//!
//! ### Rule Errors
//! - `DuplicateRuleId`: A rule with this `rule_id` already exists (unique index)
//! - `InvalidRule`: A rule is missing required fields or has malformed values
//! - `RuleNotFound`: No rule with this `rule_id`
//!
//! ### Lease Errors
//! - `LeaseHeld`: Another live lease exists for the key (expected, retry later)
//! - `NotOwner`: The live lease belongs to a different owner
//! - `LeaseExpired`: Renewal was attempted on a lease that is no longer live
//! - `InvalidLeaseTtl`: The requested lease duration is unusable
//!
//! ### Migration Errors
//! - `MigrationConflict`: A synthesized legacy `rule_id` collided (fatal)
//! - `MigrationError`: Table or index creation failed (fatal)
//!
//! ### Database Errors
//! - `DatabaseError`: SQLite operation failed (connection, query, etc.)
//! - `SerializationError`: Failed to encode/decode a JSON column
//!
//! ## Usage
//!
//! ```ignore
//! use aggwarden_metadata::{LeaseStore, MetadataError};
//!
//! match store.acquire_lease(&key, "worker-1", ttl).await {
//!     Ok(lease) => run(lease).await?,
//!     Err(e) if e.is_lease_conflict() => { /* someone else is running it */ }
//!     Err(e) => return Err(e),
//! }
//! ```

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Rule already exists: {0}")]
    DuplicateRuleId(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Lease {key} is held by {owner}")]
    LeaseHeld { key: String, owner: String },

    #[error("Lease {key} is owned by {owner}")]
    NotOwner { key: String, owner: String },

    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    #[error("Invalid lease ttl: {0}")]
    InvalidLeaseTtl(String),

    #[error("Synthesized rule_id {rule_id} for document {id} collides with an existing rule")]
    MigrationConflict { id: String, rule_id: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl MetadataError {
    /// True for the lease conflicts callers treat as "try again later".
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, MetadataError::LeaseHeld { .. })
    }

    /// True when the error came from a unique index violation.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false)
    }
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::MigrationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_conflict_classification() {
        let held = MetadataError::LeaseHeld {
            key: "rule:a".to_string(),
            owner: "worker-1".to_string(),
        };
        assert!(held.is_lease_conflict());
        assert_eq!(held.to_string(), "Lease rule:a is held by worker-1");

        assert!(!MetadataError::LeaseExpired("rule:a".to_string()).is_lease_conflict());
        assert!(!MetadataError::RuleNotFound("a".to_string()).is_lease_conflict());
    }
}
