//! Metadata Type Definitions
//!
//! This module defines all the data structures used by the rule store and the
//! lease protocol.
//!
//! ## Types Overview
//!
//! ### NewRule
//! Input for creating a rule through the current authoring path. Every field
//! the scheduler needs is mandatory.
//!
//! ### AggregationRule
//! A complete rule document as read back from the store.
//!
//! ### RuleDocument
//! The raw, possibly partial row. Legacy documents may lack any field except the
//! store identity until the schema migrator has run.
//!
//! ### LeaseKey / ExecutionLease
//! The protected execution slot and the lease record that guards it.
//!
//! ## Design Decisions
//!
//! - All types are Serialize/Deserialize for storage and CLI output
//! - Timestamps are i64 (milliseconds since epoch)
//! - A missing field is `None`, stored as SQL NULL

use crate::error::{MetadataError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Prefix of identifiers synthesized for legacy documents without a `rule_id`.
pub const LEGACY_RULE_ID_PREFIX: &str = "legacy_";

/// Window size given to documents that predate the window field.
pub const DEFAULT_WINDOW_SIZE: &str = "1m";

/// Metric given to documents that predate the metric field.
pub const DEFAULT_METRIC: &str = "event_count";

/// Grouping dimension given to documents that predate the group_by field.
pub const DEFAULT_GROUP_BY: &str = "event_type";

/// Input for creating a new aggregation rule.
///
/// # Examples
///
/// ```ignore
/// store.create(NewRule {
///     rule_id: "rule_10m_event_type".to_string(),
///     window_size: "10m".to_string(),
///     metric: "event_count".to_string(),
///     group_by: vec!["event_type".to_string()],
///     top_n: Some(10),
///     is_active: true,
/// }).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    /// Stable external identifier (must be unique)
    pub rule_id: String,

    /// Window granularity, e.g. "1m", "10m", "1h"
    pub window_size: String,

    /// Measure being aggregated, e.g. "event_count"
    pub metric: String,

    /// Ordered dimensions used to bucket events
    pub group_by: Vec<String>,

    /// Optional bound on result cardinality (None = unbounded)
    #[serde(default)]
    pub top_n: Option<i64>,

    /// Whether schedulers may run the rule
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl NewRule {
    /// Rule with the given identity and shape, active and unbounded.
    pub fn new(
        rule_id: impl Into<String>,
        window_size: impl Into<String>,
        metric: impl Into<String>,
        group_by: Vec<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            window_size: window_size.into(),
            metric: metric.into(),
            group_by,
            top_n: None,
            is_active: true,
        }
    }

    /// Structural validation performed before any write.
    pub fn validate(&self) -> Result<()> {
        if self.rule_id.trim().is_empty() {
            return Err(MetadataError::InvalidRule("rule_id is empty".to_string()));
        }
        if self.window_size.trim().is_empty() {
            return Err(MetadataError::InvalidRule(format!(
                "rule {}: window_size is empty",
                self.rule_id
            )));
        }
        WindowSize::parse(&self.window_size)?;
        if self.metric.trim().is_empty() {
            return Err(MetadataError::InvalidRule(format!(
                "rule {}: metric is empty",
                self.rule_id
            )));
        }
        if self.group_by.is_empty() {
            return Err(MetadataError::InvalidRule(format!(
                "rule {}: group_by is empty",
                self.rule_id
            )));
        }
        if self.group_by.iter().any(|dim| dim.trim().is_empty()) {
            return Err(MetadataError::InvalidRule(format!(
                "rule {}: group_by contains a blank dimension",
                self.rule_id
            )));
        }
        if let Some(top_n) = self.top_n {
            if top_n <= 0 {
                return Err(MetadataError::InvalidRule(format!(
                    "rule {}: top_n must be positive, got {}",
                    self.rule_id, top_n
                )));
            }
        }
        Ok(())
    }
}

/// A complete aggregation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRule {
    /// Store-assigned identity
    pub id: String,
    pub rule_id: String,
    pub is_active: bool,
    pub window_size: String,
    pub metric: String,
    pub group_by: Vec<String>,
    pub top_n: Option<i64>,
    pub created_at: Option<i64>,
    pub migrated_at: Option<i64>,
    pub updated_at: Option<i64>,
}

impl AggregationRule {
    /// Parsed window size.
    pub fn window(&self) -> Result<WindowSize> {
        WindowSize::parse(&self.window_size)
    }

    /// Lease key guarding this rule as a whole.
    pub fn lease_key(&self) -> LeaseKey {
        LeaseKey::for_rule(&self.rule_id)
    }

    /// Lease key guarding the window that contains `timestamp_ms`.
    pub fn window_lease_key(&self, timestamp_ms: i64) -> Result<LeaseKey> {
        let window = self.window()?;
        Ok(LeaseKey::for_window(
            &self.rule_id,
            window.window_start(timestamp_ms),
        ))
    }
}

/// Raw rule row. Any field but `id` may be missing on legacy documents.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    pub id: String,
    pub rule_id: Option<String>,
    pub is_active: Option<bool>,
    pub window_size: Option<String>,
    pub metric: Option<String>,
    pub group_by: Option<Vec<String>>,
    pub top_n: Option<i64>,
    pub created_at: Option<i64>,
    pub migrated_at: Option<i64>,
    pub updated_at: Option<i64>,
}

impl RuleDocument {
    /// Names of the required fields this document lacks.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.rule_id.is_none() {
            missing.push("rule_id");
        }
        if self.window_size.is_none() {
            missing.push("window_size");
        }
        if self.metric.is_none() {
            missing.push("metric");
        }
        if self.group_by.is_none() {
            missing.push("group_by");
        }
        missing
    }

    /// Convert into a complete rule, failing with `InvalidRule` if any
    /// required field is missing.
    pub fn into_rule(self) -> Result<AggregationRule> {
        let missing = self.missing_fields();
        match (self.rule_id, self.window_size, self.metric, self.group_by) {
            (Some(rule_id), Some(window_size), Some(metric), Some(group_by)) => {
                Ok(AggregationRule {
                    id: self.id,
                    rule_id,
                    // Absence is never "inactive"
                    is_active: self.is_active.unwrap_or(true),
                    window_size,
                    metric,
                    group_by,
                    top_n: self.top_n,
                    created_at: self.created_at,
                    migrated_at: self.migrated_at,
                    updated_at: self.updated_at,
                })
            }
            _ => Err(MetadataError::InvalidRule(format!(
                "document {} is missing {}",
                self.id,
                missing.join(", ")
            ))),
        }
    }
}

/// Parsed window granularity such as `1m` or `1h`.
///
/// Accepted units are `s`, `m`, `h` and `d` with a positive integer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize(Duration);

impl WindowSize {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || MetadataError::InvalidRule(format!("invalid window_size: {:?}", raw));

        let unit_start = raw
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (count, unit) = raw.split_at(unit_start);
        let count: u64 = count.parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }

        let unit_secs = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            _ => return Err(invalid()),
        };

        let secs = count.checked_mul(unit_secs).ok_or_else(invalid)?;
        Ok(Self(Duration::from_secs(secs)))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        crate::clock::duration_to_ms(self.0)
    }

    /// Start of the window containing `timestamp_ms` (windows are aligned to
    /// the epoch).
    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.as_millis())
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        match secs {
            s if s % 86_400 == 0 => write!(f, "{}d", s / 86_400),
            s if s % 3_600 == 0 => write!(f, "{}h", s / 3_600),
            s if s % 60 == 0 => write!(f, "{}m", s / 60),
            s => write!(f, "{}s", s),
        }
    }
}

/// Identity of a protected execution slot.
///
/// A slot is either a whole rule (`rule:<rule_id>`) or one window instance of
/// a rule (`rule:<rule_id>@<window_start_ms>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseKey(String);

impl LeaseKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn for_rule(rule_id: &str) -> Self {
        Self(format!("rule:{}", rule_id))
    }

    pub fn for_window(rule_id: &str, window_start_ms: i64) -> Self {
        Self(format!("rule:{}@{}", rule_id, window_start_ms))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LeaseKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// A granted execution lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLease {
    pub key: String,

    /// Worker holding the lease
    pub owner: String,

    /// When the lease was granted (ms since epoch)
    pub acquired_at: i64,

    /// When the lease becomes void (ms since epoch)
    pub expires_at: i64,
}

impl ExecutionLease {
    /// A lease is live while `expires_at > now`.
    pub fn is_live_at(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Outcome of one schema migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Documents that received a synthesized `legacy_<id>` rule_id
    pub identifiers_assigned: u64,

    /// Documents whose window/metric/grouping fields were backfilled
    pub documents_completed: u64,
}

impl MigrationReport {
    /// True when the run changed nothing (the store was already current).
    pub fn is_noop(&self) -> bool {
        self.identifiers_assigned == 0 && self.documents_completed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_rule() -> NewRule {
        NewRule::new(
            "rule_10m_event_type",
            "10m",
            "event_count",
            vec!["event_type".to_string()],
        )
    }

    #[test]
    fn test_window_size_parse() {
        assert_eq!(WindowSize::parse("1m").unwrap().as_millis(), 60_000);
        assert_eq!(WindowSize::parse("10m").unwrap().as_millis(), 600_000);
        assert_eq!(WindowSize::parse("1h").unwrap().as_millis(), 3_600_000);
        assert_eq!(WindowSize::parse("30s").unwrap().as_millis(), 30_000);
        assert_eq!(WindowSize::parse("1d").unwrap().to_string(), "1d");
        assert_eq!(WindowSize::parse("120s").unwrap().to_string(), "2m");

        for bad in ["", "m", "0m", "5", "5w", "-1m", "1.5h"] {
            assert!(
                matches!(WindowSize::parse(bad), Err(MetadataError::InvalidRule(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_window_start_alignment() {
        let five_min = WindowSize::parse("5m").unwrap();
        assert_eq!(five_min.window_start(0), 0);
        assert_eq!(five_min.window_start(299_999), 0);
        assert_eq!(five_min.window_start(300_000), 300_000);
        assert_eq!(five_min.window_start(-1), -300_000);
    }

    #[test]
    fn test_new_rule_validation() {
        assert!(valid_rule().validate().is_ok());

        let mut rule = valid_rule();
        rule.metric = String::new();
        assert!(matches!(rule.validate(), Err(MetadataError::InvalidRule(_))));

        let mut rule = valid_rule();
        rule.group_by.clear();
        assert!(matches!(rule.validate(), Err(MetadataError::InvalidRule(_))));

        let mut rule = valid_rule();
        rule.group_by.push("  ".to_string());
        assert!(matches!(rule.validate(), Err(MetadataError::InvalidRule(_))));

        let mut rule = valid_rule();
        rule.window_size = "soon".to_string();
        assert!(matches!(rule.validate(), Err(MetadataError::InvalidRule(_))));

        let mut rule = valid_rule();
        rule.top_n = Some(0);
        assert!(matches!(rule.validate(), Err(MetadataError::InvalidRule(_))));

        let mut rule = valid_rule();
        rule.rule_id = " ".to_string();
        assert!(matches!(rule.validate(), Err(MetadataError::InvalidRule(_))));
    }

    #[test]
    fn test_document_into_rule_reports_missing_fields() {
        let doc = RuleDocument {
            id: "abc".to_string(),
            metric: Some("event_count".to_string()),
            ..Default::default()
        };
        assert_eq!(doc.missing_fields(), vec!["rule_id", "window_size", "group_by"]);

        let err = doc.into_rule().unwrap_err();
        assert!(err.to_string().contains("rule_id, window_size, group_by"));
    }

    #[test]
    fn test_document_without_is_active_is_active() {
        let doc = RuleDocument {
            id: "abc".to_string(),
            rule_id: Some("r".to_string()),
            window_size: Some("1m".to_string()),
            metric: Some("event_count".to_string()),
            group_by: Some(vec!["event_type".to_string()]),
            ..Default::default()
        };
        assert!(doc.into_rule().unwrap().is_active);
    }

    #[test]
    fn test_lease_keys() {
        assert_eq!(LeaseKey::for_rule("r1").as_str(), "rule:r1");
        assert_eq!(LeaseKey::for_window("r1", 60_000).to_string(), "rule:r1@60000");

        let rule = valid_rule();
        let stored = AggregationRule {
            id: "x".to_string(),
            rule_id: rule.rule_id,
            is_active: true,
            window_size: rule.window_size,
            metric: rule.metric,
            group_by: rule.group_by,
            top_n: None,
            created_at: None,
            migrated_at: None,
            updated_at: None,
        };
        assert_eq!(
            stored.window_lease_key(601_000).unwrap().as_str(),
            "rule:rule_10m_event_type@600000"
        );
    }

    #[test]
    fn test_lease_liveness_boundary() {
        let lease = ExecutionLease {
            key: "rule:a".to_string(),
            owner: "w".to_string(),
            acquired_at: 0,
            expires_at: 1_000,
        };
        assert!(lease.is_live_at(999));
        assert!(!lease.is_live_at(1_000));
    }
}
