//! Wiring a service from configuration.

use crate::error::{ServiceError, ServiceResult};
use crate::service::BitstreamStorageService;
use crate::sync::SyncBitstreamStorageService;
use bitstore_core::config::AppConfig;
use bitstore_storage::StoreRegistry;
use std::sync::Arc;
use tracing::{info, warn};

/// Build the storage service described by `config`.
///
/// Stores are initialized before the metadata store is opened. Remote
/// stores that cannot be reached disable themselves and are reported here;
/// local stores that fail to initialize abort startup.
pub async fn build_service(config: &AppConfig) -> ServiceResult<BitstreamStorageService> {
    config.validate()?;

    let stores = StoreRegistry::from_config(&config.assetstore)?;
    stores.init_all().await?;

    for index in stores.indices() {
        if !stores.is_enabled(index) {
            warn!(store = index, "store unavailable");
        }
    }
    if !stores.is_enabled(config.assetstore.incoming) {
        warn!(
            store = config.assetstore.incoming,
            "incoming store unavailable, new content cannot be stored"
        );
    }

    let metadata = bitstore_metadata::from_config(&config.metadata).await?;
    info!(
        stores = stores.indices().count(),
        incoming = config.assetstore.incoming,
        "storage service ready"
    );

    Ok(
        BitstreamStorageService::new(Arc::new(stores), metadata, config.assetstore.incoming)
            .with_cleanup_config(config.cleanup.clone())
            .with_migration_config(config.migration.clone()),
    )
}

/// Build the service for a deployment with a synchronized store pair.
pub async fn build_sync_service(config: &AppConfig) -> ServiceResult<SyncBitstreamStorageService> {
    if config.assetstore.sync.is_none() {
        return Err(ServiceError::Config(
            "assetstore.sync must name a primary and secondary store".to_string(),
        ));
    }
    SyncBitstreamStorageService::new(build_service(config).await?)
}
