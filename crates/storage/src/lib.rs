//! Bitstream store abstraction and backends.
//!
//! This crate provides:
//! - The [`BitStore`] contract every backend implements
//! - Shared key resolution, about-attribute filtering and streaming digests
//! - Backends: local filesystem, S3-compatible, Azure Blob, Google Cloud
//!   Storage, WebHDFS and URL-addressed object stores
//! - [`StoreRegistry`], the index to backend mapping built at startup

pub mod backends;
pub mod base;
pub mod error;
pub mod registry;
pub mod traits;

pub use backends::{
    filesystem::FilesystemBackend,
    hdfs::HdfsBackend,
    object::ObjectStoreBackend,
    s3::{S3Backend, S3Options},
};
pub use error::{StorageError, StorageResult};
pub use registry::{Placement, StoreRegistry};
pub use traits::{AboutKey, BitStore, ByteStream, ContentInfo, ObjectAbout};

use bitstore_core::config::StoreConfig;
use std::sync::Arc;

/// Create a store from configuration. The store still needs [`BitStore::init`].
pub fn from_config(config: &StoreConfig) -> StorageResult<Arc<dyn BitStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StoreConfig::Filesystem { path } => Ok(Arc::new(FilesystemBackend::new(path))),
        StoreConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
            part_size_bytes,
        } => {
            let backend = S3Backend::new(S3Options {
                bucket: bucket.clone(),
                endpoint: endpoint.clone(),
                region: region.clone(),
                prefix: prefix.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: *force_path_style,
                part_size_bytes: *part_size_bytes,
            })?;
            Ok(Arc::new(backend))
        }
        StoreConfig::Azure {
            account,
            container,
            access_key,
            connection_string,
            prefix,
            endpoint,
        } => {
            let backend = ObjectStoreBackend::azure(
                account.as_deref(),
                container,
                access_key.as_deref(),
                connection_string.as_deref(),
                prefix.clone(),
                endpoint.as_deref(),
            )?;
            Ok(Arc::new(backend))
        }
        StoreConfig::Gcs {
            bucket,
            service_account_path,
            prefix,
        } => {
            let backend =
                ObjectStoreBackend::gcs(bucket, service_account_path.as_deref(), prefix.clone())?;
            Ok(Arc::new(backend))
        }
        StoreConfig::Hdfs {
            endpoint,
            base_dir,
            user,
        } => Ok(Arc::new(HdfsBackend::new(endpoint, base_dir, user.clone())?)),
        StoreConfig::Generic { url, options } => {
            Ok(Arc::new(ObjectStoreBackend::from_url(url, options)?))
        }
    }
}
