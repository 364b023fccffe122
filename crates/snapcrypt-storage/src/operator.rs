//! OpenDAL Operator factory and the `BlobClient` built on it
//!
//! OpenDAL is async; `OpendalBlobClient` owns a small tokio runtime and
//! blocks on it, so callers keep a plain synchronous `Read`/`Write` surface.

use std::future::IntoFuture;
use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use opendal::{ErrorKind, Operator};
use snapcrypt_core::config::{BackendKind, StorageConfig};
use snapcrypt_core::BlobEntry;
use tokio::runtime::Runtime;

use crate::client::{BlobClient, BlobUpload, ClientError, ClientErrorKind, ListPage, Precondition};

/// Bytes fetched per ranged GET while streaming an object.
pub const DEFAULT_READ_WINDOW: u64 = 8 * 1024 * 1024;

/// Secrets needed by the cloud backends, loaded outside the config file.
#[derive(Clone, Default)]
pub struct BackendCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub account_key: Option<String>,
}

impl BackendCredentials {
    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AZURE_STORAGE_KEY`.
    pub fn from_env() -> Self {
        Self {
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            account_key: std::env::var("AZURE_STORAGE_KEY").ok(),
        }
    }
}

impl std::fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "[REDACTED]"))
            .field("account_key", &self.account_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn finish(op: Operator) -> Operator {
    op.layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
}

/// Build an OpenDAL Operator for S3 (or any S3-compatible endpoint)
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and
/// SeaweedFS require.
pub fn build_s3_operator(
    storage: &StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(access_key_id)
        .secret_access_key(secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .finish();
    Ok(finish(op))
}

pub fn build_gcs_operator(storage: &StorageConfig) -> Result<Operator> {
    let mut builder = opendal::services::Gcs::default()
        .bucket(&storage.bucket)
        .endpoint(&storage.endpoint);
    if let Some(path) = &storage.credentials_file {
        let path = path
            .to_str()
            .context("GCS credentials_file is not valid UTF-8")?;
        builder = builder.credential_path(path);
    }

    let op = Operator::new(builder)
        .context("creating OpenDAL GCS operator")?
        .finish();
    Ok(finish(op))
}

pub fn build_azblob_operator(storage: &StorageConfig, account_key: &str) -> Result<Operator> {
    let account_name = storage
        .account_name
        .as_deref()
        .context("storage.account_name is required for the azure backend")?;
    let builder = opendal::services::Azblob::default()
        .container(&storage.bucket)
        .endpoint(&storage.endpoint)
        .account_name(account_name)
        .account_key(account_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL Azure Blob operator")?
        .finish();
    Ok(finish(op))
}

pub fn build_memory_operator() -> Result<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish();
    Ok(finish(op))
}

/// Build an operator for whichever backend `storage` selects.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_operator(storage: &StorageConfig, creds: &BackendCredentials) -> Result<Operator> {
    if storage.backend != BackendKind::Memory && storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "storage endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }

    match storage.backend {
        BackendKind::S3 => {
            let key_id = creds
                .access_key_id
                .as_deref()
                .context("AWS_ACCESS_KEY_ID is not set")?;
            let secret = creds
                .secret_access_key
                .as_deref()
                .context("AWS_SECRET_ACCESS_KEY is not set")?;
            build_s3_operator(storage, key_id, secret)
        }
        BackendKind::Gcs => build_gcs_operator(storage),
        BackendKind::Azure => {
            let key = creds
                .account_key
                .as_deref()
                .context("AZURE_STORAGE_KEY is not set")?;
            build_azblob_operator(storage, key)
        }
        BackendKind::Memory => build_memory_operator(),
    }
}

fn error_kind(err: &opendal::Error) -> ClientErrorKind {
    match err.kind() {
        ErrorKind::NotFound => ClientErrorKind::NotFound,
        ErrorKind::ConditionNotMatch => ClientErrorKind::PreconditionFailed,
        _ if err.is_temporary() => ClientErrorKind::Transient,
        _ => ClientErrorKind::Other,
    }
}

fn client_error(path: &str, err: opendal::Error) -> ClientError {
    ClientError::new(error_kind(&err), format!("{path}: {err}"))
}

pub struct OpendalBlobClient {
    op: Operator,
    runtime: Arc<Runtime>,
    read_window: u64,
}

impl OpendalBlobClient {
    pub fn new(op: Operator) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("snapcrypt-io")
            .enable_all()
            .build()
            .context("building storage I/O runtime")?;
        Ok(Self {
            op,
            runtime: Arc::new(runtime),
            read_window: DEFAULT_READ_WINDOW,
        })
    }

    pub fn with_read_window(mut self, bytes: u64) -> Self {
        self.read_window = bytes.max(1);
        self
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

impl BlobClient for OpendalBlobClient {
    fn head_object(&self, path: &str) -> Result<Option<u64>, ClientError> {
        match self.runtime.block_on(self.op.stat(path)) {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(client_error(path, e)),
        }
    }

    fn get_object(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        self.runtime
            .block_on(self.op.read(path))
            .map(|buf| buf.to_vec())
            .map_err(|e| client_error(path, e))
    }

    fn range_read(&self, path: &str, offset: u64) -> Result<Box<dyn Read + Send>, ClientError> {
        let len = self
            .head_object(path)?
            .ok_or_else(|| ClientError::not_found(path))?;
        Ok(Box::new(RangeReader {
            op: self.op.clone(),
            runtime: Arc::clone(&self.runtime),
            path: path.to_string(),
            pos: offset.min(len),
            len,
            window: self.read_window,
            buf: Vec::new(),
            buf_pos: 0,
        }))
    }

    fn put_object(
        &self,
        path: &str,
        precondition: Precondition,
        _size_hint: Option<u64>,
    ) -> Result<Box<dyn BlobUpload>, ClientError> {
        let mut native_condition = false;
        if precondition == Precondition::IfNotExists {
            native_condition = self.op.info().full_capability().write_with_if_not_exists;
            // Without native support the check races with other writers.
            if !native_condition && self.head_object(path)?.is_some() {
                return Err(ClientError::new(
                    ClientErrorKind::PreconditionFailed,
                    format!("{path}: object already exists"),
                ));
            }
        }
        let writer = self
            .runtime
            .block_on(
                self.op
                    .writer_with(path)
                    .if_not_exists(native_condition)
                    .into_future(),
            )
            .map_err(|e| client_error(path, e))?;
        Ok(Box::new(Upload {
            writer: Some(writer),
            runtime: Arc::clone(&self.runtime),
            path: path.to_string(),
        }))
    }

    fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        _token: Option<&str>,
    ) -> Result<ListPage, ClientError> {
        // OpenDAL pages internally; one call returns the whole listing.
        let root = if prefix.is_empty() { "/" } else { prefix };
        self.runtime.block_on(async {
            let entries = self
                .op
                .list_with(root)
                .recursive(delimiter.is_none())
                .await
                .map_err(|e| client_error(prefix, e))?;

            let mut page = ListPage::default();
            for entry in entries {
                let path = entry.path();
                if path == root || !path.starts_with(prefix) {
                    continue;
                }
                let meta = entry.metadata();
                if meta.is_dir() {
                    if delimiter.is_some() {
                        page.common_prefixes.push(path.to_string());
                    }
                    continue;
                }
                // Not every service reports sizes in listings.
                let size_bytes = match meta.content_length() {
                    0 => self
                        .op
                        .stat(path)
                        .await
                        .map_err(|e| client_error(path, e))?
                        .content_length(),
                    n => n,
                };
                page.objects.push(BlobEntry {
                    name: path.to_string(),
                    size_bytes,
                });
            }
            Ok(page)
        })
    }

    fn delete_objects(&self, paths: &[String]) -> Vec<(String, Result<(), ClientError>)> {
        self.runtime.block_on(async {
            // Backend deletes are idempotent; stat first so absent keys surface.
            let mut outcomes: Vec<Result<(), ClientError>> = Vec::with_capacity(paths.len());
            let mut present = Vec::new();
            for (i, path) in paths.iter().enumerate() {
                match self.op.stat(path).await {
                    Ok(_) => {
                        present.push(i);
                        outcomes.push(Ok(()));
                    }
                    Err(e) => outcomes.push(Err(client_error(path, e))),
                }
            }

            if !present.is_empty() {
                let batch = async {
                    let mut deleter = self.op.deleter().await?;
                    deleter
                        .delete_iter(present.iter().map(|&i| paths[i].as_str()))
                        .await?;
                    deleter.close().await
                };
                if let Err(e) = batch.await {
                    let kind = error_kind(&e);
                    for &i in &present {
                        outcomes[i] = Err(ClientError::new(kind, format!("{}: {e}", paths[i])));
                    }
                }
            }

            paths.iter().cloned().zip(outcomes).collect()
        })
    }
}

/// Streams an object as a series of windowed range reads.
struct RangeReader {
    op: Operator,
    runtime: Arc<Runtime>,
    path: String,
    pos: u64,
    len: u64,
    window: u64,
    buf: Vec<u8>,
    buf_pos: usize,
}

impl Read for RangeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf_pos == self.buf.len() {
            if self.pos >= self.len {
                return Ok(0);
            }
            let end = (self.pos + self.window).min(self.len);
            let data = self
                .runtime
                .block_on(self.op.read_with(&self.path).range(self.pos..end).into_future())
                .map_err(|e| io::Error::from(client_error(&self.path, e)))?;
            if data.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{}: object ended before its reported length", self.path),
                ));
            }
            self.buf = data.to_vec();
            self.buf_pos = 0;
            self.pos += self.buf.len() as u64;
        }
        let n = (self.buf.len() - self.buf_pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
        self.buf_pos += n;
        Ok(n)
    }
}

struct Upload {
    writer: Option<opendal::Writer>,
    runtime: Arc<Runtime>,
    path: String,
}

impl Write for Upload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "upload already closed"))?;
        self.runtime
            .block_on(writer.write(buf.to_vec()))
            .map_err(|e| io::Error::from(client_error(&self.path, e)))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobUpload for Upload {
    fn commit(mut self: Box<Self>) -> Result<(), ClientError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        self.runtime
            .block_on(writer.close())
            .map(|_| ())
            .map_err(|e| client_error(&self.path, e))
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = self.runtime.block_on(writer.abort()) {
                tracing::debug!(path = %self.path, error = %e, "aborting upload failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_client() -> OpendalBlobClient {
        OpendalBlobClient::new(build_memory_operator().unwrap())
            .unwrap()
            .with_read_window(7)
    }

    #[test]
    fn test_build_s3_operator_valid() {
        let storage = StorageConfig {
            endpoint: "http://localhost:8333".to_string(),
            bucket: "test-bucket".to_string(),
            ..Default::default()
        };
        let op = build_s3_operator(&storage, "test-key", "test-secret");
        assert!(op.is_ok(), "operator construction should succeed");
    }

    #[test]
    fn test_build_operator_http_warning() {
        let storage = StorageConfig {
            endpoint: "http://localhost:8333".into(),
            enforce_tls: false,
            ..Default::default()
        };
        let creds = BackendCredentials {
            access_key_id: Some("key".into()),
            secret_access_key: Some("secret".into()),
            account_key: None,
        };
        assert!(build_operator(&storage, &creds).is_ok());
    }

    #[test]
    fn test_build_operator_http_enforce_tls() {
        let storage = StorageConfig {
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let result = build_operator(&storage, &BackendCredentials::default());
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(
            result.unwrap_err().to_string().contains("enforce_tls"),
            "error message should mention enforce_tls"
        );
    }

    #[test]
    fn test_build_operator_missing_credentials() {
        let storage = StorageConfig {
            endpoint: "https://s3.example.com".into(),
            ..Default::default()
        };
        let err = build_operator(&storage, &BackendCredentials::default()).unwrap_err();
        assert!(err.to_string().contains("AWS_ACCESS_KEY_ID"));
    }

    #[test]
    fn test_azure_requires_account_name() {
        let storage = StorageConfig {
            backend: BackendKind::Azure,
            endpoint: "https://acct.blob.core.windows.net".into(),
            ..Default::default()
        };
        let creds = BackendCredentials {
            account_key: Some("a2V5".into()),
            ..Default::default()
        };
        let err = build_operator(&storage, &creds).unwrap_err();
        assert!(err.to_string().contains("account_name"));
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = BackendCredentials {
            access_key_id: Some("AKIA".into()),
            secret_access_key: Some("hunter2".into()),
            account_key: Some("azkey".into()),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("azkey"));
    }

    #[test]
    fn memory_put_get_and_range_read() {
        let client = memory_client();
        let data: Vec<u8> = (0..50u8).collect();
        client.put_bytes("repo/blob", &data, Precondition::None).unwrap();

        assert_eq!(client.head_object("repo/blob").unwrap(), Some(50));
        assert_eq!(client.get_object("repo/blob").unwrap(), data);

        let mut tail = Vec::new();
        client
            .range_read("repo/blob", 20)
            .unwrap()
            .read_to_end(&mut tail)
            .unwrap();
        assert_eq!(tail, &data[20..]);
    }

    #[test]
    fn memory_missing_object() {
        let client = memory_client();
        assert_eq!(client.head_object("nope").unwrap(), None);
        assert!(client.get_object("nope").unwrap_err().is_not_found());
        assert!(client.range_read("nope", 0).err().unwrap().is_not_found());
    }

    #[test]
    fn memory_conditional_put() {
        let client = memory_client();
        client
            .put_bytes("k", b"first", Precondition::IfNotExists)
            .unwrap();
        let err = client
            .put_bytes("k", b"second", Precondition::IfNotExists)
            .unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::PreconditionFailed);
        assert_eq!(client.get_object("k").unwrap(), b"first");
    }

    #[test]
    fn memory_listing_with_delimiter() {
        let client = memory_client();
        for name in ["r/a/1", "r/a/2", "r/b/1", "r/top"] {
            client.put_bytes(name, b"x", Precondition::None).unwrap();
        }
        let page = client.list_objects("r/", Some("/"), None).unwrap();
        let mut prefixes = page.common_prefixes.clone();
        prefixes.sort();
        assert_eq!(prefixes, vec!["r/a/", "r/b/"]);
        let names: Vec<_> = page.objects.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["r/top"]);
        assert!(page.next_token.is_none());

        let flat = client.list_objects("r/", None, None).unwrap();
        assert_eq!(flat.objects.len(), 4);
    }

    #[test]
    fn memory_listing_by_name_prefix_reports_sizes() {
        let client = memory_client();
        client.put_bytes("idx/top-1", b"abc", Precondition::None).unwrap();
        client.put_bytes("idx/top-2", b"abcdef", Precondition::None).unwrap();
        client.put_bytes("idx/other", b"x", Precondition::None).unwrap();

        let page = client.list_objects("idx/top-", Some("/"), None).unwrap();
        let mut sizes: Vec<_> = page
            .objects
            .iter()
            .map(|e| (e.name.as_str(), e.size_bytes))
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![("idx/top-1", 3), ("idx/top-2", 6)]);
    }

    #[test]
    fn memory_batch_delete_reports_each_path() {
        let client = memory_client();
        client.put_bytes("d/1", b"1", Precondition::None).unwrap();
        client.put_bytes("d/2", b"2", Precondition::None).unwrap();

        let paths = vec!["d/1".to_string(), "d/gone".to_string(), "d/2".to_string()];
        let results = client.delete_objects(&paths);
        let names: Vec<_> = results.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(names, vec!["d/1", "d/gone", "d/2"]);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.as_ref().unwrap_err().is_not_found());
        assert!(results[2].1.is_ok());
        assert_eq!(client.head_object("d/1").unwrap(), None);
        assert_eq!(client.head_object("d/2").unwrap(), None);
    }
}
