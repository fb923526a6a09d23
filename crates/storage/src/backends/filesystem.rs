//! Local filesystem storage backend.

use crate::base::{self, ContentDigest};
use crate::error::{StorageError, StorageResult};
use crate::traits::{AboutKey, BitStore, ByteStream, ContentInfo, ObjectAbout};
use async_trait::async_trait;
use bitstore_core::ContentAddress;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Local filesystem bitstream store.
///
/// Objects live at `root/aa/bb/cc/rest`. Writes go to a sibling temp file
/// that is synced and renamed into place, so a reader never sees a partial
/// object under its final name.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
    initialized: AtomicBool,
}

fn map_not_found(err: std::io::Error, internal_id: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(internal_id.to_string())
    } else {
        StorageError::Io(err)
    }
}

impl FilesystemBackend {
    /// Create a backend rooted at `root`. Nothing touches the disk until `init`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of an object.
    pub fn object_path(&self, address: &ContentAddress) -> PathBuf {
        match address {
            ContentAddress::Scattered(path) => {
                let mut full = self.root.clone();
                full.extend(path.segments());
                full.push(path.file_name());
                full
            }
            ContentAddress::Registered(path) => self.root.join(path),
        }
    }

    fn temp_path(path: &Path) -> PathBuf {
        let suffix = format!(".tmp.{}", Uuid::new_v4());
        let name = path
            .file_name()
            .map(|n| format!("{}{suffix}", n.to_string_lossy()))
            .unwrap_or(suffix);
        path.with_file_name(name)
    }

    /// Create the temp file, recreating parents if a concurrent prune
    /// removed them in between.
    async fn create_temp(&self, path: &Path) -> StorageResult<(PathBuf, fs::File)> {
        const ATTEMPTS: usize = 5;

        let temp_path = Self::temp_path(path);
        let mut attempt = 1;
        loop {
            let created = match path.parent() {
                Some(parent) => fs::create_dir_all(parent).await,
                None => Ok(()),
            };
            let result = match created {
                Ok(()) => fs::File::create(&temp_path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(file) => return Ok((temp_path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
    }

    async fn write_all(file: &mut fs::File, mut input: ByteStream) -> StorageResult<ContentInfo> {
        let mut digest = ContentDigest::new();
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        Ok(digest.finish())
    }

    /// Remove now-empty directories above a deleted object.
    ///
    /// Walks at most `depth` levels, stops at the first directory that is
    /// not empty and never removes the store root.
    async fn prune_empty_parents(&self, path: &Path, depth: usize) {
        let mut dir = path.parent();
        for _ in 0..depth {
            let Some(current) = dir else { break };
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            match fs::remove_dir(current).await {
                Ok(()) => tracing::trace!(dir = %current.display(), "pruned empty directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(_) => break,
            }
            dir = current.parent();
        }
    }
}

#[async_trait]
impl BitStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem", root = %self.root.display()))]
    async fn init(&self) -> StorageResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        fs::create_dir_all(&self.root).await?;
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(StorageError::Config(format!(
                "asset store root {} is not a directory",
                self.root.display()
            )));
        }
        self.initialized.store(true, Ordering::Release);
        tracing::debug!("filesystem store ready");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, internal_id: &str) -> StorageResult<ByteStream> {
        let path = self.object_path(&base::resolve(internal_id)?);
        let file = fs::File::open(&path)
            .await
            .map_err(|e| map_not_found(e, internal_id))?;
        Ok(base::reader_stream(file))
    }

    #[instrument(skip(self, input), fields(backend = "filesystem"))]
    async fn put(&self, internal_id: &str, input: ByteStream) -> StorageResult<ContentInfo> {
        let path = self.object_path(&base::resolve(internal_id)?);
        let (temp_path, mut file) = self.create_temp(&path).await?;

        let written = match Self::write_all(&mut file, input).await {
            Ok(info) => {
                drop(file);
                fs::rename(&temp_path, &path)
                    .await
                    .map(|()| info)
                    .map_err(StorageError::Io)
            }
            Err(e) => {
                drop(file);
                Err(e)
            }
        };

        if written.is_err()
            && let Err(e) = fs::remove_file(&temp_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                temp = %temp_path.display(),
                error = %e,
                "failed to remove temp file after aborted write"
            );
        }

        let info = written?;
        tracing::debug!(size = info.size_bytes, "stored object");
        Ok(info)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn about(
        &self,
        internal_id: &str,
        keys: &[AboutKey],
    ) -> StorageResult<Option<ObjectAbout>> {
        let path = self.object_path(&base::resolve(internal_id)?);
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let modified = meta.modified().ok().map(OffsetDateTime::from);
        let checksum = if base::needs_checksum(keys) {
            match self.get(internal_id).await {
                Ok(stream) => Some(base::digest(stream).await?.checksum),
                // Removed between the stat and the read.
                Err(StorageError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(Some(base::select(keys, meta.len(), modified, checksum)))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn remove(&self, internal_id: &str) -> StorageResult<()> {
        let address = base::resolve(internal_id)?;
        let path = self.object_path(&address);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("object already absent");
            }
            Err(e) => return Err(StorageError::Io(e)),
        }
        self.prune_empty_parents(&path, address.prunable_depth())
            .await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
