//! Store initialization.
//!
//! Opening the store applies the embedded migrations (both tables and every
//! index), then the [`SchemaMigrator`] upgrades legacy rule documents. Any
//! error here is fatal for the caller.

use crate::{
    clock::{Clock, SystemClock},
    error::Result,
    migrator::SchemaMigrator,
    store::SqliteMetadataStore,
    types::MigrationReport,
};
use std::sync::Arc;
use tracing::info;

/// Open the store at `database_url` and bring it up to date.
pub async fn initialize(database_url: &str) -> Result<(SqliteMetadataStore, MigrationReport)> {
    initialize_with_clock(database_url, Arc::new(SystemClock)).await
}

/// Same as [`initialize`], reading time from `clock`.
pub async fn initialize_with_clock(
    database_url: &str,
    clock: Arc<dyn Clock>,
) -> Result<(SqliteMetadataStore, MigrationReport)> {
    info!(database = %database_url, "Initializing aggregation metadata store");

    let store = SqliteMetadataStore::with_clock(database_url, clock).await?;
    info!("✓ tables and indexes ready");

    let report = SchemaMigrator::new(&store).run().await?;

    info!(
        identifiers_assigned = report.identifiers_assigned,
        documents_completed = report.documents_completed,
        "✅ Aggregation metadata store initialized"
    );

    Ok((store, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuleDocument, RuleStore};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initialize_fresh_store() {
        let (store, report) = initialize(":memory:").await.unwrap();
        assert!(report.is_noop());
        assert!(store.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reinitialize_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.db");
        let path = path.to_str().unwrap();

        {
            let (store, _) = initialize(path).await.unwrap();
            store
                .import_document(RuleDocument::default())
                .await
                .unwrap();
            store.pool().close().await;
        }

        let (store, report) = initialize(path).await.unwrap();
        assert_eq!(report.identifiers_assigned, 1);
        assert_eq!(report.documents_completed, 1);
        assert_eq!(store.list_rules().await.unwrap().len(), 1);
        store.pool().close().await;

        let (_store, report) = initialize(path).await.unwrap();
        assert!(report.is_noop());
    }
}
