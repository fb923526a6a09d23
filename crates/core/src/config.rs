//! Configuration types shared across crates.

use crate::record::SYNCHRONIZED_STORE_NUMBER;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use time::Duration;

/// S3 rejects multipart parts (other than the last) below 5 MiB.
pub const MIN_S3_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Backend configuration for one store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Local directory tree.
    Filesystem {
        /// Root directory of the asset store.
        path: PathBuf,
    },
    /// S3-compatible object storage.
    S3 {
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        region: Option<String>,
        /// Optional key prefix (subfolder) inside the bucket.
        prefix: Option<String>,
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// Path-style addressing, required by MinIO and some compatibles.
        #[serde(default)]
        force_path_style: bool,
        /// Multipart part size in bytes.
        #[serde(default = "default_s3_part_size")]
        part_size_bytes: u64,
    },
    /// Azure Blob Storage.
    Azure {
        /// Storage account name. Optional when a connection string is given.
        account: Option<String>,
        container: String,
        access_key: Option<String>,
        /// `AccountName=...;AccountKey=...;BlobEndpoint=...` style string.
        connection_string: Option<String>,
        prefix: Option<String>,
        /// Endpoint override (Azurite, sovereign clouds).
        endpoint: Option<String>,
    },
    /// Google Cloud Storage.
    Gcs {
        bucket: String,
        /// Service account key file; ambient credentials are used when unset.
        service_account_path: Option<PathBuf>,
        prefix: Option<String>,
    },
    /// Hadoop-compatible filesystem reached over WebHDFS.
    Hdfs {
        /// NameNode HTTP address, e.g. `http://namenode:9870`.
        endpoint: String,
        /// Absolute directory holding the asset store.
        base_dir: String,
        /// User name passed as `user.name`.
        user: Option<String>,
    },
    /// Any object store addressable by URL (`s3://`, `az://`, `gs://`, `file://`, `memory://`, ...).
    Generic {
        url: String,
        /// Provider options passed through to the client builder.
        #[serde(default)]
        options: BTreeMap<String, String>,
    },
}

fn default_s3_part_size() -> u64 {
    8 * 1024 * 1024
}

impl StoreConfig {
    /// Short backend name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem { .. } => "filesystem",
            Self::S3 { .. } => "s3",
            Self::Azure { .. } => "azure",
            Self::Gcs { .. } => "gcs",
            Self::Hdfs { .. } => "hdfs",
            Self::Generic { .. } => "generic",
        }
    }

    /// Validate backend configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem store requires a non-empty path".to_string());
                }
                Ok(())
            }
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                part_size_bytes,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 store requires a bucket".to_string());
                }
                if access_key_id.is_some() != secret_access_key.is_some() {
                    return Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    );
                }
                if *part_size_bytes < MIN_S3_PART_SIZE {
                    return Err(format!(
                        "s3 part_size_bytes {part_size_bytes} is below the provider minimum {MIN_S3_PART_SIZE}"
                    ));
                }
                Ok(())
            }
            Self::Azure {
                account,
                container,
                connection_string,
                ..
            } => {
                if container.trim().is_empty() {
                    return Err("azure store requires a container".to_string());
                }
                if account.is_none() && connection_string.is_none() {
                    return Err(
                        "azure store requires either 'account' or 'connection_string'".to_string(),
                    );
                }
                Ok(())
            }
            Self::Gcs { bucket, .. } => {
                if bucket.trim().is_empty() {
                    return Err("gcs store requires a bucket".to_string());
                }
                Ok(())
            }
            Self::Hdfs {
                endpoint, base_dir, ..
            } => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(format!(
                        "hdfs endpoint must be an http(s) WebHDFS address, got '{endpoint}'"
                    ));
                }
                if !base_dir.starts_with('/') {
                    return Err(format!("hdfs base_dir must be absolute, got '{base_dir}'"));
                }
                Ok(())
            }
            Self::Generic { url, .. } => {
                if !url.contains("://") {
                    return Err(format!("generic store url '{url}' has no scheme"));
                }
                Ok(())
            }
        }
    }
}

/// One entry of the store table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Stable store number persisted on every bitstream row.
    pub index: i32,
    /// Disabled stores are skipped at startup and refuse operations.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub backend: StoreConfig,
}

fn default_enabled() -> bool {
    true
}

/// The pair of stores behind the synchronized store number.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Store serving reads of synchronized bitstreams.
    pub primary: i32,
    /// Store receiving backfilled copies.
    pub secondary: i32,
}

/// Asset store table and write routing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetStoreConfig {
    /// Store receiving new bitstreams.
    #[serde(default)]
    pub incoming: i32,
    #[serde(default = "default_stores")]
    pub stores: Vec<StoreEntry>,
    /// Synchronized pair, if a no-downtime migration is in progress.
    #[serde(default)]
    pub sync: Option<SyncConfig>,
}

fn default_stores() -> Vec<StoreEntry> {
    vec![StoreEntry {
        index: 0,
        enabled: true,
        backend: StoreConfig::Filesystem {
            path: PathBuf::from("./data/assetstore"),
        },
    }]
}

impl Default for AssetStoreConfig {
    fn default() -> Self {
        Self {
            incoming: 0,
            stores: default_stores(),
            sync: None,
        }
    }
}

impl AssetStoreConfig {
    /// Look up a configured store by index.
    pub fn store(&self, index: i32) -> Option<&StoreEntry> {
        self.stores.iter().find(|entry| entry.index == index)
    }

    /// Validate the store table.
    pub fn validate(&self) -> Result<(), String> {
        if self.stores.is_empty() {
            return Err("assetstore requires at least one store".to_string());
        }

        let mut seen = HashSet::new();
        for entry in &self.stores {
            if entry.index == SYNCHRONIZED_STORE_NUMBER {
                return Err(format!(
                    "store index {SYNCHRONIZED_STORE_NUMBER} is reserved for synchronized bitstreams"
                ));
            }
            if entry.index < 0 {
                return Err(format!("store index {} must not be negative", entry.index));
            }
            if !seen.insert(entry.index) {
                return Err(format!("duplicate store index {}", entry.index));
            }
            entry
                .backend
                .validate()
                .map_err(|e| format!("store {}: {e}", entry.index))?;
        }

        match self.store(self.incoming) {
            None => {
                return Err(format!(
                    "incoming store {} is not configured",
                    self.incoming
                ));
            }
            Some(entry) if !entry.enabled => {
                return Err(format!("incoming store {} is disabled", self.incoming));
            }
            Some(_) => {}
        }

        if let Some(sync) = &self.sync {
            if sync.primary == sync.secondary {
                return Err("sync primary and secondary must be different stores".to_string());
            }
            for index in [sync.primary, sync.secondary] {
                if self.store(index).is_none() {
                    return Err(format!("sync store {index} is not configured"));
                }
            }
        }

        Ok(())
    }
}

/// Cleanup sweep configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Objects modified more recently than this are never reclaimed.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Records processed per metadata commit.
    #[serde(default = "default_commit_interval")]
    pub commit_interval: u32,
    /// Deleted records fetched per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_grace_period_secs() -> u64 {
    3600 // 1 hour
}

fn default_commit_interval() -> u32 {
    100
}

fn default_page_size() -> u32 {
    1000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            commit_interval: default_commit_interval(),
            page_size: default_page_size(),
        }
    }
}

impl CleanupConfig {
    /// Get the grace period as a Duration.
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.grace_period_secs > i64::MAX as u64 {
            return Err(format!(
                "cleanup.grace_period_secs {} exceeds maximum value {}",
                self.grace_period_secs,
                i64::MAX
            ));
        }
        if self.commit_interval == 0 {
            return Err("cleanup.commit_interval cannot be 0".to_string());
        }
        if self.page_size == 0 {
            return Err("cleanup.page_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Migration configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Records copied per metadata commit.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_batch_size() -> u32 {
    100
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("migration.batch_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file (single node deployments and tests).
    Sqlite { path: PathBuf },
    /// PostgreSQL database.
    Postgres {
        /// WARNING: Prefer BITSTORE_METADATA__URL over storing credentials in config.
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300_000) // 5 minutes
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Sqlite { .. } => Ok(()),
            Self::Postgres {
                url,
                max_connections,
                ..
            } => {
                if url.trim().is_empty() {
                    return Err("postgres config requires a url".to_string());
                }
                if *max_connections == 0 {
                    return Err("postgres max_connections cannot be 0".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub assetstore: AssetStoreConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl AppConfig {
    /// Validate every section, prefixing errors with the section name.
    pub fn validate(&self) -> crate::Result<()> {
        let checks = [
            ("metadata", self.metadata.validate()),
            ("assetstore", self.assetstore.validate()),
            ("cleanup", self.cleanup.validate()),
            ("migration", self.migration.validate()),
        ];
        for (section, result) in checks {
            result.map_err(|e| crate::Error::InvalidConfiguration(format!("[{section}] {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filesystem(index: i32, path: &str) -> StoreEntry {
        StoreEntry {
            index,
            enabled: true,
            backend: StoreConfig::Filesystem {
                path: PathBuf::from(path),
            },
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cleanup.grace_period_secs, 3600);
        assert_eq!(config.cleanup.commit_interval, 100);
        assert_eq!(config.migration.batch_size, 100);
    }

    #[test]
    fn test_store_entry_flattens_backend() {
        let json = r#"{
            "incoming": 1,
            "stores": [
                {"index": 0, "type": "filesystem", "path": "/srv/assetstore"},
                {"index": 1, "type": "s3", "bucket": "bits", "region": "eu-west-1", "enabled": false}
            ]
        }"#;
        let config: AssetStoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.incoming, 1);
        assert!(config.stores[0].enabled);
        assert!(!config.stores[1].enabled);
        match &config.stores[1].backend {
            StoreConfig::S3 {
                bucket,
                part_size_bytes,
                force_path_style,
                ..
            } => {
                assert_eq!(bucket, "bits");
                assert_eq!(*part_size_bytes, 8 * 1024 * 1024);
                assert!(!force_path_style);
            }
            other => panic!("expected s3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_assetstore_rejects_duplicate_index() {
        let config = AssetStoreConfig {
            incoming: 0,
            stores: vec![filesystem(0, "/a"), filesystem(0, "/b")],
            sync: None,
        };
        assert!(config.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_assetstore_rejects_reserved_index() {
        let config = AssetStoreConfig {
            incoming: 0,
            stores: vec![filesystem(0, "/a"), filesystem(SYNCHRONIZED_STORE_NUMBER, "/b")],
            sync: None,
        };
        assert!(config.validate().unwrap_err().contains("reserved"));
    }

    #[test]
    fn test_assetstore_rejects_unknown_or_disabled_incoming() {
        let mut config = AssetStoreConfig {
            incoming: 4,
            stores: vec![filesystem(0, "/a")],
            sync: None,
        };
        assert!(config.validate().unwrap_err().contains("not configured"));

        config.incoming = 0;
        config.stores[0].enabled = false;
        assert!(config.validate().unwrap_err().contains("disabled"));
    }

    #[test]
    fn test_assetstore_validates_sync_pair() {
        let mut config = AssetStoreConfig {
            incoming: 0,
            stores: vec![filesystem(0, "/a"), filesystem(1, "/b")],
            sync: Some(SyncConfig {
                primary: 0,
                secondary: 0,
            }),
        };
        assert!(config.validate().is_err());

        config.sync = Some(SyncConfig {
            primary: 0,
            secondary: 2,
        });
        assert!(config.validate().unwrap_err().contains("sync store 2"));

        config.sync = Some(SyncConfig {
            primary: 0,
            secondary: 1,
        });
        config.validate().unwrap();
    }

    #[test]
    fn test_s3_validate_partial_credentials_and_part_size() {
        let mut s3 = StoreConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
            part_size_bytes: default_s3_part_size(),
        };
        assert!(s3.validate().is_err());

        if let StoreConfig::S3 {
            secret_access_key,
            part_size_bytes,
            ..
        } = &mut s3
        {
            *secret_access_key = Some("secret".to_string());
            *part_size_bytes = 1024;
        }
        assert!(s3.validate().unwrap_err().contains("minimum"));
    }

    #[test]
    fn test_azure_requires_account_or_connection_string() {
        let azure = StoreConfig::Azure {
            account: None,
            container: "bits".to_string(),
            access_key: None,
            connection_string: None,
            prefix: None,
            endpoint: None,
        };
        assert!(azure.validate().is_err());
    }

    #[test]
    fn test_hdfs_requires_http_endpoint_and_absolute_dir() {
        let hdfs = StoreConfig::Hdfs {
            endpoint: "namenode:9870".to_string(),
            base_dir: "/bitstore".to_string(),
            user: None,
        };
        assert!(hdfs.validate().is_err());

        let hdfs = StoreConfig::Hdfs {
            endpoint: "http://namenode:9870".to_string(),
            base_dir: "bitstore".to_string(),
            user: None,
        };
        assert!(hdfs.validate().is_err());
    }

    #[test]
    fn test_cleanup_validate() {
        let config = CleanupConfig {
            commit_interval: 0,
            ..CleanupConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(CleanupConfig::default().grace_period(), Duration::hours(1));
    }

    #[test]
    fn test_app_config_error_names_section() {
        let config = AppConfig {
            migration: MigrationConfig { batch_size: 0 },
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[migration]"));
    }
}
