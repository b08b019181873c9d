//! Execution lease protocol on SQLite.
//!
//! Every operation is one conditional write. The follow-up read (used only to
//! name the conflicting owner) runs in the same transaction, after the write
//! has taken SQLite's write lock, so it observes the state that decided the
//! outcome.
//!
//! Liveness is `expires_at > now`. An expired row is overwritten by
//! `acquire`, ignored by `release`/`renew`/`get`, and deleted by
//! `reap_expired_leases`.

use crate::{
    clock::duration_to_ms,
    error::{MetadataError, Result},
    store::SqliteMetadataStore,
    types::{ExecutionLease, LeaseKey},
    LeaseStore,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    key: String,
    owner: String,
    acquired_at: i64,
    expires_at: i64,
}

impl From<LeaseRow> for ExecutionLease {
    fn from(row: LeaseRow) -> Self {
        ExecutionLease {
            key: row.key,
            owner: row.owner,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        }
    }
}

fn ttl_ms(ttl: Duration) -> Result<i64> {
    match duration_to_ms(ttl) {
        0 => Err(MetadataError::InvalidLeaseTtl(format!(
            "{:?} is shorter than one millisecond",
            ttl
        ))),
        ms => Ok(ms),
    }
}

#[async_trait]
impl LeaseStore for SqliteMetadataStore {
    async fn acquire_lease(
        &self,
        key: &LeaseKey,
        owner: &str,
        ttl: Duration,
    ) -> Result<ExecutionLease> {
        let ttl_ms = ttl_ms(ttl)?;
        let now = self.now_ms();
        let expires_at = now.saturating_add(ttl_ms);

        let mut tx = self.pool().begin().await?;

        // Insert, or take over a row whose lease has already expired.
        // A live row (whoever owns it) is left untouched and 0 rows change.
        let granted = sqlx::query(
            r#"
            INSERT INTO aggregation_locks (key, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE aggregation_locks.expires_at <= ?
            "#,
        )
        .bind(key.as_str())
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !granted {
            let holder: Option<String> =
                sqlx::query_scalar("SELECT owner FROM aggregation_locks WHERE key = ?")
                    .bind(key.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.commit().await?;

            let holder = holder.unwrap_or_default();
            debug!(
                key = %key,
                owner = %owner,
                holder = %holder,
                "Lease held by another worker"
            );
            return Err(MetadataError::LeaseHeld {
                key: key.to_string(),
                owner: holder,
            });
        }

        tx.commit().await?;

        info!(
            key = %key,
            owner = %owner,
            expires_at,
            "Acquired execution lease"
        );

        Ok(ExecutionLease {
            key: key.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at,
        })
    }

    async fn release_lease(&self, key: &LeaseKey, owner: &str) -> Result<()> {
        let now = self.now_ms();
        let mut tx = self.pool().begin().await?;

        let deleted = sqlx::query("DELETE FROM aggregation_locks WHERE key = ? AND owner = ?")
            .bind(key.as_str())
            .bind(owner)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            let holder: Option<String> = sqlx::query_scalar(
                "SELECT owner FROM aggregation_locks WHERE key = ? AND expires_at > ?",
            )
            .bind(key.as_str())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
            tx.commit().await?;

            if let Some(holder) = holder {
                return Err(MetadataError::NotOwner {
                    key: key.to_string(),
                    owner: holder,
                });
            }

            debug!(key = %key, owner = %owner, "No live lease to release");
            return Ok(());
        }

        tx.commit().await?;

        info!(key = %key, owner = %owner, "Released execution lease");
        Ok(())
    }

    async fn renew_lease(
        &self,
        key: &LeaseKey,
        owner: &str,
        ttl: Duration,
    ) -> Result<ExecutionLease> {
        let ttl_ms = ttl_ms(ttl)?;
        let now = self.now_ms();
        let expires_at = now.saturating_add(ttl_ms);

        let mut tx = self.pool().begin().await?;

        let renewed = sqlx::query(
            r#"
            UPDATE aggregation_locks
            SET expires_at = ?
            WHERE key = ? AND owner = ? AND expires_at > ?
            "#,
        )
        .bind(expires_at)
        .bind(key.as_str())
        .bind(owner)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if renewed == 0 {
            let holder: Option<String> = sqlx::query_scalar(
                "SELECT owner FROM aggregation_locks WHERE key = ? AND expires_at > ?",
            )
            .bind(key.as_str())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
            tx.commit().await?;

            return Err(match holder {
                Some(holder) => MetadataError::NotOwner {
                    key: key.to_string(),
                    owner: holder,
                },
                None => MetadataError::LeaseExpired(key.to_string()),
            });
        }

        let row = sqlx::query_as::<_, LeaseRow>(
            "SELECT key, owner, acquired_at, expires_at FROM aggregation_locks WHERE key = ?",
        )
        .bind(key.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(key = %key, owner = %owner, expires_at, "Renewed execution lease");

        Ok(row.into())
    }

    async fn get_lease(&self, key: &LeaseKey) -> Result<Option<ExecutionLease>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT key, owner, acquired_at, expires_at
            FROM aggregation_locks
            WHERE key = ? AND expires_at > ?
            "#,
        )
        .bind(key.as_str())
        .bind(self.now_ms())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(ExecutionLease::from))
    }

    async fn list_leases(&self, owner: Option<&str>) -> Result<Vec<ExecutionLease>> {
        let now = self.now_ms();

        let rows = match owner {
            Some(owner) => {
                sqlx::query_as::<_, LeaseRow>(
                    r#"
                    SELECT key, owner, acquired_at, expires_at
                    FROM aggregation_locks
                    WHERE owner = ? AND expires_at > ?
                    ORDER BY key
                    "#,
                )
                .bind(owner)
                .bind(now)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, LeaseRow>(
                    r#"
                    SELECT key, owner, acquired_at, expires_at
                    FROM aggregation_locks
                    WHERE expires_at > ?
                    ORDER BY key
                    "#,
                )
                .bind(now)
                .fetch_all(self.pool())
                .await?
            }
        };

        Ok(rows.into_iter().map(ExecutionLease::from).collect())
    }

    async fn reap_expired_leases(&self) -> Result<u64> {
        let reaped = sqlx::query("DELETE FROM aggregation_locks WHERE expires_at <= ?")
            .bind(self.now_ms())
            .execute(self.pool())
            .await?
            .rows_affected();

        if reaped > 0 {
            debug!(reaped, "Removed expired execution leases");
        }

        Ok(reaped)
    }
}
