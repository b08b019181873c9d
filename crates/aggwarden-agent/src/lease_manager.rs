//! Lease Manager - Rule Execution Coordination
//!
//! The LeaseManager is the worker-side view of the execution lease protocol.
//! It is bound to one owner id, takes leases through a shared
//! [`LeaseStore`], remembers what it holds, and keeps those leases alive with
//! a background renewal task.
//!
//! ## How It Works
//!
//! 1. **Acquire**: `try_acquire` asks the store for the lease. It never waits;
//!    if another worker holds it the caller gets `LeaseHeld` and tries again
//!    on its next scheduling tick.
//! 2. **Renew**: the renewal task extends every held lease each
//!    `renewal_interval` (one third of the TTL by default). A lease whose
//!    renewal fails is dropped from the local cache.
//! 3. **Release**: on completion or shutdown. A worker that dies without
//!    releasing simply lets the TTL run out.
//!
//! ## Example
//!
//! ```ignore
//! use aggwarden_agent::LeaseManager;
//! use aggwarden_metadata::LeaseKey;
//!
//! let key = LeaseKey::for_window(&rule.rule_id, window_start);
//! match manager.run_exclusive(&key, aggregate(&rule, window_start)).await {
//!     Ok(result) => result?,
//!     Err(e) if e.is_lease_conflict() => { /* another worker has this window */ }
//!     Err(e) => return Err(e),
//! }
//! ```

use crate::config::WorkerConfig;
use crate::error::Result;
use aggwarden_metadata::{Clock, ExecutionLease, LeaseKey, LeaseStore, MetadataError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default lease lifetime (30 seconds)
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Default renewal interval (10 seconds = renew at 1/3 of the lease TTL)
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(10);

type LeaseCache = Arc<RwLock<HashMap<LeaseKey, ExecutionLease>>>;

/// Manages the execution leases held by one worker
pub struct LeaseManager {
    owner: String,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    renewal_interval: Duration,
    leases: LeaseCache,
    renewal_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl LeaseManager {
    /// Create a lease manager with the default TTL and renewal interval
    pub fn new(
        owner: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            owner: owner.into(),
            store,
            clock,
            ttl: DEFAULT_LEASE_TTL,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            leases: Arc::new(RwLock::new(HashMap::new())),
            renewal_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Create a lease manager from worker configuration
    pub fn from_config(
        config: &WorkerConfig,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(config.owner_id.clone(), store, clock)
            .with_ttl(config.lease_ttl())
            .with_renewal_interval(config.renewal_interval())
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Start the lease renewal background task
    pub async fn start_renewal_task(&self) -> Result<()> {
        let task = LeaseRenewalTask {
            owner: self.owner.clone(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            leases: Arc::clone(&self.leases),
            ttl: self.ttl,
            interval: self.renewal_interval,
        };

        let handle = tokio::spawn(async move {
            task.run().await;
        });

        // Replace (and stop) any previous task
        if let Some(previous) = self.renewal_handle.write().await.replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Stop the lease renewal background task
    pub async fn stop_renewal_task(&self) -> Result<()> {
        let mut handle_guard = self.renewal_handle.write().await;

        if let Some(handle) = handle_guard.take() {
            handle.abort();
            let _ = handle.await;

            info!(
                owner = %self.owner,
                "Lease renewal task stopped"
            );
        }

        Ok(())
    }

    /// Try to take the lease for `key` without waiting.
    ///
    /// # Errors
    ///
    /// - `LeaseHeld` (wrapped): another live lease exists, or this worker
    ///   already holds it
    pub async fn try_acquire(&self, key: &LeaseKey) -> Result<ExecutionLease> {
        let lease = match self.store.acquire_lease(key, &self.owner, self.ttl).await {
            Ok(lease) => lease,
            Err(e @ MetadataError::LeaseHeld { .. }) => {
                debug!(owner = %self.owner, key = %key, error = %e, "Lease unavailable");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.leases.write().await.insert(key.clone(), lease.clone());

        debug!(
            owner = %self.owner,
            key = %key,
            expires_at = lease.expires_at,
            "Acquired execution lease"
        );

        Ok(lease)
    }

    /// Extend a held lease by a full TTL.
    ///
    /// On failure the lease is forgotten locally; it either expired or
    /// belongs to another worker now.
    pub async fn renew(&self, key: &LeaseKey) -> Result<ExecutionLease> {
        match self.store.renew_lease(key, &self.owner, self.ttl).await {
            Ok(lease) => {
                if let Some(slot) = self.leases.write().await.get_mut(key) {
                    *slot = lease.clone();
                }
                Ok(lease)
            }
            Err(e) => {
                self.leases.write().await.remove(key);
                warn!(owner = %self.owner, key = %key, error = %e, "Lost execution lease");
                Err(e.into())
            }
        }
    }

    /// Release a lease (called after the work completes)
    pub async fn release(&self, key: &LeaseKey) -> Result<()> {
        self.leases.write().await.remove(key);

        self.store.release_lease(key, &self.owner).await?;

        debug!(owner = %self.owner, key = %key, "Released execution lease");

        Ok(())
    }

    /// Release all leases (called on shutdown)
    pub async fn release_all(&self) -> Result<()> {
        let leases_to_release: Vec<LeaseKey> = {
            let leases = self.leases.read().await;
            leases.keys().cloned().collect()
        };

        let count = leases_to_release.len();

        for key in leases_to_release {
            if let Err(e) = self.release(&key).await {
                warn!(
                    owner = %self.owner,
                    key = %key,
                    error = %e,
                    "Failed to release lease during shutdown"
                );
            }
        }

        if count > 0 {
            info!(owner = %self.owner, count, "Released all execution leases");
        }

        Ok(())
    }

    /// Whether this worker holds a live lease for `key` (local view)
    pub async fn holds(&self, key: &LeaseKey) -> bool {
        let now = self.clock.now_ms();
        self.leases
            .read()
            .await
            .get(key)
            .map(|lease| lease.is_live_at(now))
            .unwrap_or(false)
    }

    /// Keys of all live leases held by this worker, sorted
    pub async fn held_keys(&self) -> Vec<LeaseKey> {
        let now = self.clock.now_ms();
        let leases = self.leases.read().await;
        let mut keys: Vec<LeaseKey> = leases
            .values()
            .filter(|lease| lease.is_live_at(now))
            .map(|lease| LeaseKey::new(lease.key.clone()))
            .collect();
        keys.sort();
        keys
    }

    /// Acquire `key`, run `work`, then release.
    ///
    /// The release happens whatever `work` returns; a `Result` output is
    /// handed back untouched. If the lease was lost while working, the
    /// failed release is logged and the output is still returned.
    pub async fn run_exclusive<F, T>(&self, key: &LeaseKey, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.try_acquire(key).await?;

        let output = work.await;

        if let Err(e) = self.release(key).await {
            warn!(
                owner = %self.owner,
                key = %key,
                error = %e,
                "Lease was lost before the work finished"
            );
        }

        Ok(output)
    }
}

/// Background task that renews held leases
struct LeaseRenewalTask {
    owner: String,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    leases: LeaseCache,
    ttl: Duration,
    interval: Duration,
}

impl LeaseRenewalTask {
    async fn run(self) {
        info!(
            owner = %self.owner,
            interval_ms = self.interval.as_millis() as u64,
            "Lease renewal task started"
        );

        let mut renewal_count: u64 = 0;
        let mut failure_count: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!(
                        owner = %self.owner,
                        "Lease renewal task received shutdown signal"
                    );
                    break;
                }
            }

            let now = self.clock.now_ms();

            // Leases that lapsed locally cannot be renewed; forget them
            let leases_to_renew: Vec<LeaseKey> = {
                let mut leases = self.leases.write().await;
                leases.retain(|key, lease| {
                    let live = lease.is_live_at(now);
                    if !live {
                        warn!(owner = %self.owner, key = %key, "Lease lapsed before renewal");
                    }
                    live
                });
                leases.keys().cloned().collect()
            };

            if leases_to_renew.is_empty() {
                debug!(
                    owner = %self.owner,
                    "No active leases to renew"
                );
                continue;
            }

            debug!(
                owner = %self.owner,
                lease_count = leases_to_renew.len(),
                "Renewing execution leases"
            );

            for key in leases_to_renew {
                match self.store.renew_lease(&key, &self.owner, self.ttl).await {
                    Ok(lease) => {
                        renewal_count += 1;
                        // A release may have raced this renewal
                        if let Some(slot) = self.leases.write().await.get_mut(&key) {
                            *slot = lease;
                        }
                        debug!(
                            owner = %self.owner,
                            key = %key,
                            total_renewals = renewal_count,
                            "Lease renewed"
                        );
                    }
                    Err(e) => {
                        failure_count += 1;
                        error!(
                            owner = %self.owner,
                            key = %key,
                            error = %e,
                            failure_count,
                            "Lease renewal failed"
                        );

                        self.leases.write().await.remove(&key);
                    }
                }
            }
        }

        info!(
            owner = %self.owner,
            total_renewals = renewal_count,
            total_failures = failure_count,
            "Lease renewal task stopped"
        );
    }
}
