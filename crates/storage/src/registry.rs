//! Index to store mapping, built once at startup and shared by reference.

use crate::error::{StorageError, StorageResult};
use crate::traits::BitStore;
use bitstore_core::StoreNumber;
use bitstore_core::config::{AssetStoreConfig, SyncConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Where the bytes of a record with a given store number live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// One concrete store.
    Single(i32),
    /// Both stores of the synchronized pair; reads go to `primary`.
    Synchronized { primary: i32, secondary: i32 },
}

impl Placement {
    /// Store that serves reads.
    pub fn reader(&self) -> i32 {
        match self {
            Self::Single(index) => *index,
            Self::Synchronized { primary, .. } => *primary,
        }
    }

    /// Every store holding a copy of the bytes.
    pub fn holders(&self) -> Vec<i32> {
        match self {
            Self::Single(index) => vec![*index],
            Self::Synchronized { primary, secondary } => vec![*primary, *secondary],
        }
    }
}

/// Immutable set of configured stores keyed by index.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: BTreeMap<i32, Arc<dyn BitStore>>,
    /// Configured but switched off by the operator.
    disabled: BTreeSet<i32>,
    sync: Option<SyncConfig>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores: BTreeMap<_, _> = self
            .stores
            .iter()
            .map(|(index, store)| (*index, store.backend_name()))
            .collect();
        f.debug_struct("StoreRegistry")
            .field("stores", &stores)
            .field("disabled", &self.disabled)
            .field("sync", &self.sync)
            .finish()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, index: i32, store: Arc<dyn BitStore>) -> Self {
        self.stores.insert(index, store);
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Build every configured store. Stores still need [`Self::init_all`].
    pub fn from_config(config: &AssetStoreConfig) -> StorageResult<Self> {
        config.validate().map_err(StorageError::Config)?;

        let mut registry = Self::new();
        for entry in &config.stores {
            let store = crate::from_config(&entry.backend)?;
            if !entry.enabled {
                registry.disabled.insert(entry.index);
            }
            registry.stores.insert(entry.index, store);
        }
        registry.sync = config.sync;
        Ok(registry)
    }

    /// Initialize every enabled store. Fatal init errors abort startup;
    /// remote stores that cannot be reached disable themselves instead.
    pub async fn init_all(&self) -> StorageResult<()> {
        for (index, store) in &self.stores {
            if self.disabled.contains(index) {
                tracing::info!(store = index, "store disabled by configuration, skipping init");
                continue;
            }
            store.init().await?;
            if !store.is_enabled() {
                tracing::warn!(
                    store = index,
                    backend = store.backend_name(),
                    "store unavailable after init"
                );
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Option<SyncConfig> {
        self.sync
    }

    pub fn indices(&self) -> impl Iterator<Item = i32> + '_ {
        self.stores.keys().copied()
    }

    pub fn contains(&self, index: i32) -> bool {
        self.stores.contains_key(&index)
    }

    /// Whether the store is switched on in configuration and by its backend.
    pub fn is_enabled(&self, index: i32) -> bool {
        !self.disabled.contains(&index)
            && self
                .stores
                .get(&index)
                .is_some_and(|store| store.is_enabled())
    }

    /// The store behind a concrete index, ready for use.
    pub fn store(&self, index: i32) -> StorageResult<&Arc<dyn BitStore>> {
        let StoreNumber::Single(index) = StoreNumber::from(index) else {
            return Err(StorageError::Config(
                "the synchronized store number does not name a single store".to_string(),
            ));
        };
        let store = self
            .stores
            .get(&index)
            .ok_or(StorageError::UnknownStore(index))?;
        if self.disabled.contains(&index) || !store.is_enabled() {
            return Err(StorageError::Disabled(format!("store {index}")));
        }
        Ok(store)
    }

    /// Resolve a persisted store number to the stores holding its bytes.
    pub fn placement(&self, store_number: i32) -> StorageResult<Placement> {
        match StoreNumber::from(store_number) {
            StoreNumber::Single(index) => Ok(Placement::Single(index)),
            StoreNumber::Synchronized => {
                let sync = self.sync.ok_or_else(|| {
                    StorageError::Config(
                        "record is synchronized but no sync pair is configured".to_string(),
                    )
                })?;
                Ok(Placement::Synchronized {
                    primary: sync.primary,
                    secondary: sync.secondary,
                })
            }
        }
    }

    /// Store that serves reads for a persisted store number.
    pub fn reader(&self, store_number: i32) -> StorageResult<&Arc<dyn BitStore>> {
        self.store(self.placement(store_number)?.reader())
    }
}
