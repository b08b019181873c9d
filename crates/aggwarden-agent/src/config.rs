//! Worker Configuration
//!
//! Lease timings are configuration, never constants baked into the lease
//! protocol.
//!
//! ## Fields
//!
//! - **database_url**: SQLite path or `sqlite:` URL (`AGGWARDEN_DATABASE`,
//!   default `./data/aggwarden.db`)
//! - **owner_id**: identity written into every lease this worker takes
//!   (`AGGWARDEN_OWNER_ID`, default `<hostname>-<uuid>`)
//! - **lease_ttl_ms**: lease lifetime (`AGGWARDEN_LEASE_TTL_MS`, default 30s)
//! - **renewal_interval_ms**: how often held leases are extended
//!   (`AGGWARDEN_RENEWAL_INTERVAL_MS`, default 10s, one third of the TTL)
//! - **reap_interval_ms**: expired-lease sweep period
//!   (`AGGWARDEN_REAP_INTERVAL_MS`, default 60s)
//!
//! ## Usage
//!
//! ```ignore
//! use aggwarden_agent::WorkerConfig;
//!
//! let config = WorkerConfig::from_env()?;
//!
//! // Tests: short leases
//! let config = WorkerConfig {
//!     lease_ttl_ms: 500,
//!     renewal_interval_ms: 100,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_DATABASE: &str = "AGGWARDEN_DATABASE";
pub const ENV_OWNER_ID: &str = "AGGWARDEN_OWNER_ID";
pub const ENV_LEASE_TTL_MS: &str = "AGGWARDEN_LEASE_TTL_MS";
pub const ENV_RENEWAL_INTERVAL_MS: &str = "AGGWARDEN_RENEWAL_INTERVAL_MS";
pub const ENV_REAP_INTERVAL_MS: &str = "AGGWARDEN_REAP_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Metadata database (default: ./data/aggwarden.db)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Lease owner identity (default: hostname plus a random suffix)
    #[serde(default = "default_owner_id")]
    pub owner_id: String,

    /// Lease lifetime in milliseconds (default: 30s)
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Lease renewal period in milliseconds (default: 10s)
    #[serde(default = "default_renewal_interval_ms")]
    pub renewal_interval_ms: u64,

    /// Expired-lease sweep period in milliseconds (default: 60s)
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            owner_id: default_owner_id(),
            lease_ttl_ms: default_lease_ttl_ms(),
            renewal_interval_ms: default_renewal_interval_ms(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl WorkerConfig {
    /// Load from `AGGWARDEN_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            database_url: lookup(ENV_DATABASE).unwrap_or(defaults.database_url),
            owner_id: lookup(ENV_OWNER_ID).unwrap_or(defaults.owner_id),
            lease_ttl_ms: parse_ms(&lookup, ENV_LEASE_TTL_MS)?.unwrap_or(defaults.lease_ttl_ms),
            renewal_interval_ms: parse_ms(&lookup, ENV_RENEWAL_INTERVAL_MS)?
                .unwrap_or(defaults.renewal_interval_ms),
            reap_interval_ms: parse_ms(&lookup, ENV_REAP_INTERVAL_MS)?
                .unwrap_or(defaults.reap_interval_ms),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which held leases would lapse between renewals.
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(AgentError::Config("owner_id must not be empty".to_string()));
        }
        if self.lease_ttl_ms == 0 {
            return Err(AgentError::Config(
                "lease_ttl_ms must be greater than zero".to_string(),
            ));
        }
        if self.renewal_interval_ms == 0 || self.renewal_interval_ms >= self.lease_ttl_ms {
            return Err(AgentError::Config(format!(
                "renewal_interval_ms ({}) must be between 1 and lease_ttl_ms ({})",
                self.renewal_interval_ms, self.lease_ttl_ms
            )));
        }
        if self.reap_interval_ms == 0 {
            return Err(AgentError::Config(
                "reap_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

fn parse_ms<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| AgentError::Config(format!("{}={:?}: {}", name, raw, e)))
        })
        .transpose()
}

fn default_database_url() -> String {
    "./data/aggwarden.db".to_string()
}

fn default_owner_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

fn default_lease_ttl_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_renewal_interval_ms() -> u64 {
    10_000 // 1/3 of the lease TTL
}

fn default_reap_interval_ms() -> u64 {
    60_000
}
