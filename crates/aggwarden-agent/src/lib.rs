//! Aggwarden Agent - Worker-Side Rule Execution Coordination
//!
//! Aggregation workers are **stateless**: any number of them can run the same
//! schedule against the same metadata store. Who actually executes a rule (or
//! one window of a rule) is decided by execution leases in the store.
//!
//! ## Components
//!
//! - **LeaseManager**: takes, renews and releases leases for one worker
//! - **LeaseReaper**: periodic physical cleanup of expired lease records
//! - **WorkerConfig**: database location, owner id and lease timings
//!
//! ## Example Usage
//!
//! ```ignore
//! use aggwarden_agent::{LeaseManager, WorkerConfig};
//! use aggwarden_metadata::{init, LeaseKey, RuleStore, SystemClock};
//! use futures::TryStreamExt;
//! use std::sync::Arc;
//!
//! let config = WorkerConfig::from_env()?;
//! let (store, _report) = init::initialize(&config.database_url).await?;
//! let store = Arc::new(store);
//!
//! let manager = LeaseManager::from_config(&config, store.clone(), Arc::new(SystemClock));
//! manager.start_renewal_task().await?;
//!
//! let mut rules = store.list_active();
//! while let Some(rule) = rules.try_next().await? {
//!     let key = rule.lease_key();
//!     if let Err(e) = manager.run_exclusive(&key, execute(&rule)).await {
//!         if !e.is_lease_conflict() {
//!             return Err(e.into());
//!         }
//!     }
//! }
//!
//! manager.stop_renewal_task().await?;
//! manager.release_all().await?;
//! ```

pub mod config;
pub mod error;
pub mod lease_manager;
pub mod reaper;

pub use config::WorkerConfig;
pub use error::{AgentError, Result};
pub use lease_manager::{LeaseManager, DEFAULT_LEASE_TTL, DEFAULT_RENEWAL_INTERVAL};
pub use reaper::LeaseReaper;
