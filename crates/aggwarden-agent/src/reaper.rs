//! Lease Reaper - physical cleanup of expired leases
//!
//! Expiry is already enforced at read time, so the reaper is housekeeping
//! only: it keeps `aggregation_locks` from accumulating rows for windows that
//! finished long ago. Failures are logged and the loop keeps going.
//!
//! ## Example
//!
//! ```ignore
//! use aggwarden_agent::LeaseReaper;
//! use std::time::Duration;
//!
//! let reaper = LeaseReaper::new(store, Duration::from_secs(60));
//! let handle = tokio::spawn(async move { reaper.run().await });
//!
//! // Later
//! handle.abort();
//! ```

use aggwarden_metadata::{LeaseStore, MetadataError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Background task that deletes expired lease records
pub struct LeaseReaper {
    store: Arc<dyn LeaseStore>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn LeaseStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run the sweep loop (blocks until Ctrl-C or cancellation)
    pub async fn run(self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Lease reaper started"
        );

        let mut total_reaped: u64 = 0;
        let mut failure_count: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Lease reaper received shutdown signal");
                    break;
                }
            }

            match self.sweep_once().await {
                Ok(reaped) => {
                    total_reaped += reaped;
                    failure_count = 0;
                }
                Err(e) => {
                    failure_count += 1;
                    error!(error = %e, failure_count, "Lease sweep failed");

                    if failure_count >= 3 {
                        warn!(
                            failure_count,
                            "Repeated lease sweep failures, expired rows are accumulating"
                        );
                    }
                }
            }
        }

        info!(total_reaped, "Lease reaper stopped");
    }

    /// Delete expired leases once. Returns how many were removed.
    pub async fn sweep_once(&self) -> Result<u64, MetadataError> {
        let reaped = self.store.reap_expired_leases().await?;

        if reaped > 0 {
            info!(reaped, "Reaped expired leases");
        } else {
            debug!("No expired leases to reap");
        }

        Ok(reaped)
    }
}
