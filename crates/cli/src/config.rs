//! Configuration loading: TOML file merged with `BITSTORE_` environment variables.

use anyhow::{Context, Result};
use bitstore_core::config::AppConfig;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;

const ENV_PREFIX: &str = "BITSTORE_";
const CONFIG_PATH_VAR: &str = "BITSTORE_CONFIG";

/// Load and validate the configuration.
///
/// The file is optional when `BITSTORE_*` variables provide the settings.
pub fn load(path: &str) -> Result<AppConfig> {
    let config_path = Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::debug!(config_path = %path, "loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!("no config file found at {path}");
    }

    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with(ENV_PREFIX) && key != CONFIG_PATH_VAR);
    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: bitstorectl --config /path/to/bitstore.toml <command>\n  \
             2. Environment variables: BITSTORE_METADATA__TYPE=sqlite \
             BITSTORE_METADATA__PATH=/var/lib/bitstore/metadata.db bitstorectl <command>\n\n\
             Set BITSTORE_CONFIG to change the default config file path."
        );
    }

    extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Extract and validate an [`AppConfig`] from prepared providers.
pub fn extract(figment: Figment) -> Result<AppConfig> {
    let config: AppConfig = figment
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitstore_core::config::{MetadataConfig, StoreConfig};

    #[test]
    fn test_extract_full_config() {
        let toml = r#"
            [metadata]
            type = "sqlite"
            path = "/var/lib/bitstore/metadata.db"

            [assetstore]
            incoming = 1

            [[assetstore.stores]]
            index = 0
            type = "filesystem"
            path = "/srv/assetstore"

            [[assetstore.stores]]
            index = 1
            type = "s3"
            bucket = "bitstreams"
            region = "eu-west-1"
            prefix = "prod"

            [assetstore.sync]
            primary = 0
            secondary = 1

            [cleanup]
            grace_period_secs = 600

            [migration]
            batch_size = 50
        "#;

        let config = extract(Figment::new().merge(Toml::string(toml))).unwrap();
        assert!(matches!(config.metadata, MetadataConfig::Sqlite { .. }));
        assert_eq!(config.assetstore.incoming, 1);
        assert_eq!(config.assetstore.stores.len(), 2);
        assert!(matches!(
            config.assetstore.stores[1].backend,
            StoreConfig::S3 { ref bucket, .. } if bucket == "bitstreams"
        ));
        assert_eq!(config.assetstore.sync.map(|s| s.secondary), Some(1));
        assert_eq!(config.cleanup.grace_period_secs, 600);
        assert_eq!(config.cleanup.commit_interval, 100);
        assert_eq!(config.migration.batch_size, 50);
    }

    #[test]
    fn test_extract_defaults() {
        let config = extract(Figment::new()).unwrap();
        assert_eq!(config.assetstore.incoming, 0);
        assert_eq!(config.cleanup.grace_period_secs, 3600);
        assert_eq!(config.cleanup.page_size, 1000);
        assert_eq!(config.migration.batch_size, 100);
    }

    #[test]
    fn test_extract_rejects_invalid_config() {
        let toml = r#"
            [assetstore]
            incoming = 3
        "#;
        let err = extract(Figment::new().merge(Toml::string(toml))).unwrap_err();
        assert!(format!("{err:#}").contains("incoming store 3"));
    }
}
