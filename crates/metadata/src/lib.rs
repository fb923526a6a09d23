//! Metadata persistence for bitstream storage.
//!
//! This crate provides the metadata collaborator the storage service relies on:
//! - Bitstream rows with the deleted-flag lifecycle
//! - Duplicate internal id, deleted and by-store enumeration queries
//! - Checksum verification history
//! - Units of work for batched cleanup and migration commits

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{BitstreamRow, CheckResult, ChecksumHistoryRow};
pub use postgres::PostgresStore;
pub use repos::{BitstreamRepo, ChecksumHistoryRepo, UnitOfWork};
pub use store::{MetadataStore, SqliteStore};

use bitstore_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;

    match config {
        MetadataConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            tracing::info!(path = %path.display(), "opened SQLite metadata store");
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            max_connections,
            statement_timeout_ms,
        } => {
            tracing::info!("Connecting to PostgreSQL using connection URL");
            let store =
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitstore_core::config::MetadataConfig;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("metadata.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_from_config_rejects_empty_postgres_url() {
        let config = MetadataConfig::Postgres {
            url: " ".to_string(),
            max_connections: 4,
            statement_timeout_ms: None,
        };
        assert!(matches!(
            from_config(&config).await,
            Err(MetadataError::Config(_))
        ));
    }
}
