//! Hadoop-compatible filesystem backend speaking the WebHDFS REST protocol.
//!
//! WebHDFS writes are two-step: the NameNode answers `CREATE` with a
//! redirect to a DataNode that accepts the body. Incoming streams are
//! staged in an anonymous temp file so the redirected request can send a
//! sized body.

use crate::base::{self, ContentDigest};
use crate::error::{StorageError, StorageResult};
use crate::traits::{AboutKey, BitStore, ByteStream, ContentInfo, ObjectAbout};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Method, StatusCode, redirect};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct FileStatusEnvelope {
    #[serde(rename = "FileStatus")]
    file_status: FileStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStatus {
    length: u64,
    /// Milliseconds since the epoch.
    modification_time: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct BooleanEnvelope {
    boolean: bool,
}

fn transport(msg: impl Into<String>) -> StorageError {
    let msg: String = msg.into();
    StorageError::Transport(msg.into())
}

/// WebHDFS bitstream store.
#[derive(Debug)]
pub struct HdfsBackend {
    client: Client,
    endpoint: Url,
    base_dir: String,
    user: Option<String>,
    initialized: AtomicBool,
    enabled: AtomicBool,
}

impl HdfsBackend {
    pub fn new(endpoint: &str, base_dir: &str, user: Option<String>) -> StorageResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StorageError::Config(format!("invalid hdfs endpoint '{endpoint}': {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(StorageError::Config(format!(
                "hdfs endpoint '{endpoint}' cannot hold a path"
            )));
        }
        // Redirects carry the DataNode address and are followed by hand.
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(StorageError::transport)?;
        Ok(Self {
            client,
            endpoint,
            base_dir: base_dir.trim_matches('/').to_string(),
            user,
            initialized: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        })
    }

    /// `http://nn/webhdfs/v1/<base_dir>/<relative>?op=<op>&user.name=<user>`
    fn op_url(&self, relative: &str, op: &str, extra: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["webhdfs", "v1"]);
            segments.extend(self.base_dir.split('/').filter(|s| !s.is_empty()));
            segments.extend(relative.split('/').filter(|s| !s.is_empty()));
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("op", op);
            if let Some(user) = &self.user {
                query.append_pair("user.name", user);
            }
            for (name, value) in extra {
                query.append_pair(name, value);
            }
        }
        url
    }

    fn relative_key(&self, internal_id: &str) -> StorageResult<(String, usize)> {
        let address = base::resolve(internal_id)?;
        Ok((address.to_key(), address.prunable_depth()))
    }

    fn ensure_usable(&self) -> StorageResult<()> {
        if !self.is_enabled() {
            return Err(StorageError::Disabled(self.endpoint.to_string()));
        }
        if !self.is_initialized() {
            return Err(StorageError::Config(format!(
                "hdfs store {} used before init",
                self.endpoint
            )));
        }
        Ok(())
    }

    async fn send(&self, method: Method, url: Url) -> StorageResult<reqwest::Response> {
        self.client
            .request(method, url)
            .send()
            .await
            .map_err(StorageError::transport)
    }

    async fn boolean_op(&self, method: Method, url: Url) -> StorageResult<bool> {
        let response = self.send(method, url).await?;
        if !response.status().is_success() {
            return Err(transport(format!(
                "webhdfs returned {}",
                response.status()
            )));
        }
        let body: BooleanEnvelope = response.json().await.map_err(StorageError::transport)?;
        Ok(body.boolean)
    }

    async fn stage(input: ByteStream) -> StorageResult<(tokio::fs::File, ContentDigest)> {
        let staged = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
        let mut file = tokio::fs::File::from_std(staged);
        let mut digest = ContentDigest::new();
        let mut input = input;
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok((file, digest))
    }

    /// Delete now-empty parent directories of a removed scattered object.
    async fn prune_parents(&self, key: &str, depth: usize) {
        let mut dirs: Vec<&str> = key.split('/').collect();
        dirs.pop();
        for _ in 0..depth {
            if dirs.is_empty() {
                break;
            }
            let dir = dirs.join("/");
            let url = self.op_url(&dir, "DELETE", &[("recursive", "false")]);
            match self.boolean_op(Method::DELETE, url).await {
                Ok(true) => {}
                // Non-empty directories refuse a non-recursive delete.
                Ok(false) | Err(_) => break,
            }
            dirs.pop();
        }
    }
}

#[async_trait]
impl BitStore for HdfsBackend {
    #[instrument(skip(self), fields(backend = "hdfs", endpoint = %self.endpoint))]
    async fn init(&self) -> StorageResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let url = self.op_url("", "MKDIRS", &[]);
        match self.boolean_op(Method::PUT, url).await {
            Ok(true) => {
                self.initialized.store(true, Ordering::Release);
                self.enabled.store(true, Ordering::Release);
                tracing::info!(base_dir = %self.base_dir, "hdfs store ready");
            }
            Ok(false) => {
                self.enabled.store(false, Ordering::Release);
                tracing::error!(base_dir = %self.base_dir, "hdfs refused to create base directory, disabling store");
            }
            Err(e) => {
                self.enabled.store(false, Ordering::Release);
                tracing::error!(error = %e, "hdfs store failed to initialize, disabling it");
            }
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(backend = "hdfs"))]
    async fn get(&self, internal_id: &str) -> StorageResult<ByteStream> {
        self.ensure_usable()?;
        let (key, _) = self.relative_key(internal_id)?;
        let mut response = self.send(Method::GET, self.op_url(&key, "OPEN", &[])).await?;

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| transport("webhdfs OPEN redirect without location"))?;
            let location = Url::parse(location).map_err(StorageError::transport)?;
            response = self.send(Method::GET, location).await?;
        }

        match response.status() {
            StatusCode::OK => Ok(Box::pin(
                response.bytes_stream().map_err(StorageError::transport),
            )),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(internal_id.to_string())),
            status => Err(transport(format!("webhdfs OPEN returned {status}"))),
        }
    }

    #[instrument(skip(self, input), fields(backend = "hdfs"))]
    async fn put(&self, internal_id: &str, input: ByteStream) -> StorageResult<ContentInfo> {
        self.ensure_usable()?;
        let (key, _) = self.relative_key(internal_id)?;
        let (file, digest) = Self::stage(input).await?;

        let url = self.op_url(&key, "CREATE", &[("overwrite", "true")]);
        let response = self.send(Method::PUT, url).await?;
        if response.status() != StatusCode::TEMPORARY_REDIRECT {
            return Err(transport(format!(
                "webhdfs CREATE returned {}",
                response.status()
            )));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| transport("webhdfs CREATE redirect without location"))?
            .to_string();

        let written = self
            .client
            .put(location)
            .header(reqwest::header::CONTENT_LENGTH, digest.size_bytes())
            .body(reqwest::Body::from(file))
            .send()
            .await
            .map_err(StorageError::transport)?;
        if written.status() != StatusCode::CREATED {
            return Err(transport(format!(
                "webhdfs datanode write returned {}",
                written.status()
            )));
        }

        let info = digest.finish();
        tracing::debug!(size = info.size_bytes, "stored object");
        Ok(info)
    }

    #[instrument(skip(self), fields(backend = "hdfs"))]
    async fn about(
        &self,
        internal_id: &str,
        keys: &[AboutKey],
    ) -> StorageResult<Option<ObjectAbout>> {
        self.ensure_usable()?;
        let (key, _) = self.relative_key(internal_id)?;
        let response = self
            .send(Method::GET, self.op_url(&key, "GETFILESTATUS", &[]))
            .await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            status => {
                return Err(transport(format!(
                    "webhdfs GETFILESTATUS returned {status}"
                )));
            }
        }
        let status: FileStatusEnvelope = response.json().await.map_err(StorageError::transport)?;
        if status.file_status.kind != "FILE" {
            return Ok(None);
        }

        let modified = OffsetDateTime::from_unix_timestamp_nanos(
            i128::from(status.file_status.modification_time) * 1_000_000,
        )
        .ok();
        let checksum = if base::needs_checksum(keys) {
            match self.get(internal_id).await {
                Ok(stream) => Some(base::digest(stream).await?.checksum),
                Err(StorageError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(Some(base::select(
            keys,
            status.file_status.length,
            modified,
            checksum,
        )))
    }

    #[instrument(skip(self), fields(backend = "hdfs"))]
    async fn remove(&self, internal_id: &str) -> StorageResult<()> {
        self.ensure_usable()?;
        let (key, depth) = self.relative_key(internal_id)?;
        // `false` means the file was already gone.
        let url = self.op_url(&key, "DELETE", &[("recursive", "false")]);
        if self.boolean_op(Method::DELETE, url).await? {
            self.prune_parents(&key, depth).await;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "hdfs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_url_layout() {
        let backend =
            HdfsBackend::new("http://namenode:9870", "/data/assetstore/", Some("dspace".into()))
                .unwrap();
        let url = backend.op_url("12/34/56/7890", "OPEN", &[]);
        assert_eq!(
            url.as_str(),
            "http://namenode:9870/webhdfs/v1/data/assetstore/12/34/56/7890?op=OPEN&user.name=dspace"
        );

        let url = backend.op_url("", "MKDIRS", &[]);
        assert_eq!(
            url.as_str(),
            "http://namenode:9870/webhdfs/v1/data/assetstore?op=MKDIRS&user.name=dspace"
        );
    }

    #[test]
    fn test_op_url_escapes_registered_names() {
        let backend = HdfsBackend::new("http://namenode:9870", "store", None).unwrap();
        let url = backend.op_url("imports/a b.pdf", "DELETE", &[("recursive", "false")]);
        assert_eq!(
            url.as_str(),
            "http://namenode:9870/webhdfs/v1/store/imports/a%20b.pdf?op=DELETE&recursive=false"
        );
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        assert!(matches!(
            HdfsBackend::new("not a url", "store", None).unwrap_err(),
            StorageError::Config(_)
        ));
    }

    #[test]
    fn test_parses_file_status() {
        let body = r#"{"FileStatus":{"accessTime":0,"blockSize":134217728,"group":"supergroup","length":24930,"modificationTime":1320173277227,"owner":"webuser","pathSuffix":"","permission":"644","replication":1,"type":"FILE"}}"#;
        let parsed: FileStatusEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.file_status.length, 24930);
        assert_eq!(parsed.file_status.modification_time, 1320173277227);
        assert_eq!(parsed.file_status.kind, "FILE");
    }

    /// Answer one HTTP request per canned response, closing each connection.
    async fn namenode(responses: Vec<(&'static str, &'static str)>) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_init_recovers_after_failed_attempt() {
        let endpoint = namenode(vec![
            ("500 Internal Server Error", ""),
            ("200 OK", r#"{"boolean":true}"#),
        ])
        .await;
        let backend = HdfsBackend::new(&endpoint, "store", None).unwrap();

        backend.init().await.unwrap();
        assert!(!backend.is_enabled());
        assert!(!backend.is_initialized());

        backend.init().await.unwrap();
        assert!(backend.is_enabled());
        assert!(backend.is_initialized());
    }

    #[tokio::test]
    async fn test_use_before_init_is_rejected() {
        let backend = HdfsBackend::new("http://namenode:9870", "store", None).unwrap();
        assert!(matches!(
            backend.remove("1234567890").await.unwrap_err(),
            StorageError::Config(_)
        ));
    }
}
