//! Schema Migrator - upgrades legacy rule documents in place.
//!
//! Runs at initialization time, after tables and indexes exist. Both phases
//! select their targets with an existence predicate on the *current* rows, so
//! the migrator keeps no "already ran" record: re-running it after success
//! touches nothing, and re-running it after a crash finishes the remainder.
//!
//! ## Phases
//!
//! 1. **Identifier backfill**: every document without `rule_id` gets
//!    `legacy_<id>`, `is_active = true` and `migrated_at = now`. Each document
//!    is a separate guarded update (`... AND rule_id IS NULL`), so two
//!    migrators racing on one store never write the same document twice.
//! 2. **Field backfill**: one predicate-scoped update gives every document
//!    lacking `window_size`, `metric` or `group_by` the defaults
//!    (`1m`, `event_count`, `["event_type"]`), clears `top_n`, activates it
//!    and stamps `updated_at`. Complete documents do not match.
//!
//! Concurrent readers see each document either before or after its update.

use crate::{
    clock::Clock,
    error::{MetadataError, Result},
    store::SqliteMetadataStore,
    types::{
        MigrationReport, DEFAULT_GROUP_BY, DEFAULT_METRIC, DEFAULT_WINDOW_SIZE,
        LEGACY_RULE_ID_PREFIX,
    },
};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Idempotent two-phase upgrade of `aggregation_rules`
pub struct SchemaMigrator {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SchemaMigrator {
    pub fn new(store: &SqliteMetadataStore) -> Self {
        Self {
            pool: store.pool().clone(),
            clock: store.clock(),
        }
    }

    /// Run phase 1 then phase 2.
    pub async fn run(&self) -> Result<MigrationReport> {
        let identifiers_assigned = self.backfill_identifiers().await?;
        let documents_completed = self.backfill_fields().await?;

        let report = MigrationReport {
            identifiers_assigned,
            documents_completed,
        };

        if report.is_noop() {
            info!("Rule schema already current, nothing to migrate");
        } else {
            info!(
                identifiers_assigned,
                documents_completed, "Migrated legacy aggregation rules"
            );
        }

        Ok(report)
    }

    /// Phase 1: assign `legacy_<id>` to documents lacking `rule_id`.
    ///
    /// # Errors
    ///
    /// - `MigrationConflict`: the synthesized id is already taken (fatal)
    pub async fn backfill_identifiers(&self) -> Result<u64> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM aggregation_rules WHERE rule_id IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut assigned = 0;

        for id in ids {
            let rule_id = format!("{}{}", LEGACY_RULE_ID_PREFIX, id);

            let result = sqlx::query(
                r#"
                UPDATE aggregation_rules
                SET rule_id = ?, is_active = 1, migrated_at = ?
                WHERE id = ? AND rule_id IS NULL
                "#,
            )
            .bind(&rule_id)
            .bind(self.clock.now_ms())
            .bind(&id)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => {
                    assigned += done.rows_affected();
                    debug!(id = %id, rule_id = %rule_id, "Assigned legacy rule_id");
                }
                Err(e) if MetadataError::is_unique_violation(&e) => {
                    error!(
                        id = %id,
                        rule_id = %rule_id,
                        "Synthesized rule_id collides with an existing rule"
                    );
                    return Err(MetadataError::MigrationConflict { id, rule_id });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(assigned)
    }

    /// Phase 2: fill window/metric/grouping defaults on incomplete documents.
    pub async fn backfill_fields(&self) -> Result<u64> {
        let default_group_by = serde_json::to_string(&[DEFAULT_GROUP_BY])?;

        let completed = sqlx::query(
            r#"
            UPDATE aggregation_rules
            SET window_size = ?,
                metric = ?,
                group_by = ?,
                top_n = NULL,
                is_active = 1,
                updated_at = ?
            WHERE window_size IS NULL
               OR metric IS NULL
               OR group_by IS NULL
            "#,
        )
        .bind(DEFAULT_WINDOW_SIZE)
        .bind(DEFAULT_METRIC)
        .bind(&default_group_by)
        .bind(self.clock.now_ms())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{NewRule, RuleDocument};
    use crate::RuleStore;
    use futures::TryStreamExt;

    async fn setup() -> (SqliteMetadataStore, ManualClock) {
        let clock = ManualClock::new(10_000);
        let store = SqliteMetadataStore::new_in_memory_with_clock(Arc::new(clock.clone()))
            .await
            .unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn test_legacy_document_scenario() {
        let (store, clock) = setup().await;

        // No rule_id, no window_size
        let id = store
            .import_document(RuleDocument {
                metric: Some("event_count".to_string()),
                group_by: Some(vec!["event_type".to_string()]),
                top_n: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();

        clock.set(20_000);
        let report = SchemaMigrator::new(&store).run().await.unwrap();
        assert_eq!(report.identifiers_assigned, 1);
        assert_eq!(report.documents_completed, 1);

        let document = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(document.rule_id, Some(format!("legacy_{}", id)));
        assert_eq!(document.is_active, Some(true));
        assert_eq!(document.window_size.as_deref(), Some("1m"));
        assert_eq!(document.metric.as_deref(), Some("event_count"));
        assert_eq!(document.group_by, Some(vec!["event_type".to_string()]));
        assert_eq!(document.top_n, None);
        assert_eq!(document.migrated_at, Some(20_000));
        assert_eq!(document.updated_at, Some(20_000));

        let rule = store.get(&format!("legacy_{}", id)).await.unwrap();
        assert!(rule.is_active);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let (store, clock) = setup().await;

        for _ in 0..3 {
            store
                .import_document(RuleDocument::default())
                .await
                .unwrap();
        }

        let migrator = SchemaMigrator::new(&store);
        let first = migrator.run().await.unwrap();
        assert_eq!(first.identifiers_assigned, 3);
        assert_eq!(first.documents_completed, 3);

        let before: Vec<RuleDocument> = all_documents(&store).await;

        clock.set(99_000);
        let second = migrator.run().await.unwrap();
        assert!(second.is_noop());

        // Timestamps did not move either
        assert_eq!(all_documents(&store).await, before);
    }

    #[tokio::test]
    async fn test_complete_documents_untouched() {
        let (store, clock) = setup().await;

        let mut inactive = NewRule::new("kept", "10m", "active_users", vec!["country".into()]);
        inactive.is_active = false;
        inactive.top_n = Some(3);
        let created = store.create(inactive).await.unwrap();
        let before = store.get_document(&created.id).await.unwrap().unwrap();

        store
            .import_document(RuleDocument {
                rule_id: Some("partial".to_string()),
                window_size: Some("5m".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        clock.set(50_000);
        let report = SchemaMigrator::new(&store).run().await.unwrap();
        assert_eq!(report.identifiers_assigned, 0);
        assert_eq!(report.documents_completed, 1);

        let after = store.get_document(&created.id).await.unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(after.is_active, Some(false));

        // All three fields are reset together, even the one that was present
        let partial = store.get("partial").await.unwrap();
        assert_eq!(partial.window_size, "1m");
        assert_eq!(partial.metric, "event_count");
    }

    #[tokio::test]
    async fn test_phase_one_only_touches_missing_identifiers() {
        let (store, _clock) = setup().await;

        let id = store
            .import_document(RuleDocument {
                rule_id: Some("external".to_string()),
                window_size: Some("1h".to_string()),
                metric: Some("event_count".to_string()),
                group_by: Some(vec!["event_type".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();

        let assigned = SchemaMigrator::new(&store)
            .backfill_identifiers()
            .await
            .unwrap();
        assert_eq!(assigned, 0);

        let document = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(document.rule_id.as_deref(), Some("external"));
        assert!(document.migrated_at.is_none());
        assert!(document.is_active.is_none());

        // A missing is_active still reads as active
        SchemaMigrator::new(&store).run().await.unwrap();
        let active: Vec<_> = store.list_active().try_collect().await.unwrap();
        assert!(active.iter().any(|rule| rule.rule_id == "external"));
    }

    #[tokio::test]
    async fn test_synthesized_id_collision_is_fatal() {
        let (store, _clock) = setup().await;

        // An externally assigned rule_id that squats on the legacy namespace
        store
            .import_document(RuleDocument {
                id: "squatter".to_string(),
                rule_id: Some("legacy_victim".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .import_document(RuleDocument {
                id: "victim".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = SchemaMigrator::new(&store).run().await.unwrap_err();
        match err {
            MetadataError::MigrationConflict { id, rule_id } => {
                assert_eq!(id, "victim");
                assert_eq!(rule_id, "legacy_victim");
            }
            other => panic!("expected MigrationConflict, got {:?}", other),
        }

        // The colliding document was left as it was
        let victim = store.get_document("victim").await.unwrap().unwrap();
        assert!(victim.rule_id.is_none());
    }

    async fn all_documents(store: &SqliteMetadataStore) -> Vec<RuleDocument> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM aggregation_rules ORDER BY id")
            .fetch_all(store.pool())
            .await
            .unwrap();

        let mut documents = Vec::new();
        for id in ids {
            documents.push(store.get_document(&id).await.unwrap().unwrap());
        }
        documents
    }
}
