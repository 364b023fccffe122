//! Uniform storage contract over any `BlobClient`
//!
//! Blob names are relative to the repository's base path. Directories are
//! synthetic: they exist only as shared name prefixes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;

use snapcrypt_core::config::{BackendKind, CodecMode, DeleteConfig, RetryConfig};
use snapcrypt_core::types::{dir_path, join_path};
use snapcrypt_core::{BlobEntry, DeleteResult, SnapcryptError, SnapcryptResult, PATH_DELIMITER};
use snapcrypt_crypto::BlobCodec;
use tracing::{debug, info, warn};

use crate::client::{BlobClient, Precondition};
use crate::resumable::{ClientRangeSource, ResumableReader};

pub trait StorageGateway: Send + Sync {
    fn exists(&self, name: &str) -> SnapcryptResult<bool>;

    /// Decrypting stream over the blob's plaintext.
    fn read(&self, name: &str) -> SnapcryptResult<Box<dyn Read + Send>>;

    /// Encode `data` and store it. With `fail_if_exists`, an existing blob
    /// yields `AlreadyExists` and is left untouched.
    fn write(
        &self,
        name: &str,
        data: &mut dyn Read,
        size_hint: Option<u64>,
        fail_if_exists: bool,
    ) -> SnapcryptResult<()>;

    /// Recursively delete everything under `prefix`.
    fn delete_directories(&self, prefix: &str) -> SnapcryptResult<DeleteResult>;

    fn delete_files(&self, names: &[String], ignore_if_not_exists: bool) -> SnapcryptResult<()>;

    /// Immediate child directory names under `prefix`.
    fn list_directories(&self, prefix: &str) -> SnapcryptResult<BTreeSet<String>>;

    /// Blobs directly under `prefix` whose names start with `name_prefix`,
    /// keyed by name relative to `prefix`, with their stored sizes.
    fn list_files(&self, prefix: &str, name_prefix: &str) -> SnapcryptResult<BTreeMap<String, u64>>;
}

/// What a backend supports and how snapcrypt drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendProfile {
    pub kind: BackendKind,
    pub codec_mode: CodecMode,
    /// Whether ranged reads are wrapped in a `ResumableReader`.
    pub resumable_reads: bool,
    /// Largest batch the backend accepts in one bulk delete.
    pub max_delete_batch: usize,
}

impl BackendProfile {
    pub fn for_kind(kind: BackendKind) -> Self {
        let (codec_mode, resumable_reads, max_delete_batch) = match kind {
            BackendKind::S3 => (CodecMode::Chunked, true, 1000),
            BackendKind::Gcs => (CodecMode::Continuous, true, 100),
            BackendKind::Azure => (CodecMode::Chunked, false, 256),
            BackendKind::Memory => (CodecMode::Continuous, true, 10_000),
        };
        Self {
            kind,
            codec_mode,
            resumable_reads,
            max_delete_batch,
        }
    }
}

pub struct BlobGateway<C: BlobClient> {
    client: Arc<C>,
    base_path: String,
    profile: BackendProfile,
    codec: BlobCodec,
    max_read_attempts: u32,
    delete_batch: usize,
}

impl<C: BlobClient + 'static> BlobGateway<C> {
    pub fn new(
        client: Arc<C>,
        base_path: impl Into<String>,
        profile: BackendProfile,
        codec: BlobCodec,
        retry: &RetryConfig,
        delete: &DeleteConfig,
    ) -> Self {
        Self {
            client,
            base_path: base_path.into(),
            profile,
            codec,
            max_read_attempts: retry.max_read_attempts,
            delete_batch: delete.max_batch_size.min(profile.max_delete_batch).max(1),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    pub fn codec(&self) -> &BlobCodec {
        &self.codec
    }

    /// Names per bulk-delete call: the configured cap bounded by the backend's.
    pub fn delete_batch_size(&self) -> usize {
        self.delete_batch
    }

    fn full_path(&self, name: &str) -> String {
        join_path(&self.base_path, name)
    }

    fn full_dir(&self, prefix: &str) -> String {
        dir_path(&self.full_path(prefix))
    }

    /// Drain every page of a listing.
    fn list_all(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> SnapcryptResult<(Vec<BlobEntry>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects(prefix, delimiter, token.as_deref())
                .map_err(|e| e.into_snapcrypt(prefix))?;
            objects.extend(page.objects);
            prefixes.extend(page.common_prefixes);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok((objects, prefixes)),
            }
        }
    }

    fn delete_paths(&self, paths: &[String], ignore_if_not_exists: bool) -> SnapcryptResult<()> {
        let mut failures = Vec::new();
        for (batch_no, batch) in paths.chunks(self.delete_batch).enumerate() {
            debug!(batch = batch_no, size = batch.len(), "bulk delete");
            for (path, outcome) in self.client.delete_objects(batch) {
                match outcome {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() && ignore_if_not_exists => {}
                    Err(e) => {
                        warn!(path = %path, error = %e, "failed to delete blob");
                        failures.push((path, e.to_string()));
                    }
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SnapcryptError::BulkDeletePartial { failures })
        }
    }
}

impl<C: BlobClient + 'static> StorageGateway for BlobGateway<C> {
    fn exists(&self, name: &str) -> SnapcryptResult<bool> {
        let path = self.full_path(name);
        self.client
            .head_object(&path)
            .map(|size| size.is_some())
            .map_err(|e| e.into_snapcrypt(&path))
    }

    fn read(&self, name: &str) -> SnapcryptResult<Box<dyn Read + Send>> {
        let path = self.full_path(name);
        let source: Box<dyn Read + Send> = if self.profile.resumable_reads {
            Box::new(ResumableReader::new(
                ClientRangeSource::new(Arc::clone(&self.client), path.clone()),
                path.clone(),
                self.max_read_attempts,
            ))
        } else {
            self.client
                .range_read(&path, 0)
                .map_err(|e| e.into_snapcrypt(&path))?
        };
        self.codec.decoder(&path, source)
    }

    fn write(
        &self,
        name: &str,
        data: &mut dyn Read,
        size_hint: Option<u64>,
        fail_if_exists: bool,
    ) -> SnapcryptResult<()> {
        let path = self.full_path(name);
        let precondition = if fail_if_exists {
            Precondition::IfNotExists
        } else {
            Precondition::None
        };
        let upload = self
            .client
            .put_object(&path, precondition, size_hint)
            .map_err(|e| e.into_snapcrypt(&path))?;
        let (upload, plaintext_bytes) = self.codec.encode(data, upload)?;
        upload.commit().map_err(|e| e.into_snapcrypt(&path))?;
        debug!(path = %path, bytes = plaintext_bytes, "wrote blob");
        Ok(())
    }

    fn delete_directories(&self, prefix: &str) -> SnapcryptResult<DeleteResult> {
        let dir = self.full_dir(prefix);
        let (entries, _) = self.list_all(&dir, None)?;
        let mut result = DeleteResult::default();
        let mut paths = Vec::with_capacity(entries.len());
        for entry in entries {
            result.add(entry.size_bytes);
            paths.push(entry.name);
        }
        self.delete_paths(&paths, true)?;
        info!(
            prefix = %dir,
            blobs = result.blobs_deleted,
            bytes = result.bytes_deleted,
            "deleted directory"
        );
        Ok(result)
    }

    fn delete_files(&self, names: &[String], ignore_if_not_exists: bool) -> SnapcryptResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        let paths: Vec<String> = names.iter().map(|name| self.full_path(name)).collect();
        self.delete_paths(&paths, ignore_if_not_exists)?;
        info!(count = paths.len(), "deleted blobs");
        Ok(())
    }

    fn list_directories(&self, prefix: &str) -> SnapcryptResult<BTreeSet<String>> {
        let dir = self.full_dir(prefix);
        let (_, prefixes) = self.list_all(&dir, Some(PATH_DELIMITER))?;
        Ok(prefixes
            .iter()
            .filter_map(|p| p.strip_prefix(dir.as_str()))
            .map(|child| child.trim_end_matches(PATH_DELIMITER).to_string())
            .filter(|child| !child.is_empty())
            .collect())
    }

    fn list_files(&self, prefix: &str, name_prefix: &str) -> SnapcryptResult<BTreeMap<String, u64>> {
        let dir = self.full_dir(prefix);
        let (entries, _) = self.list_all(&format!("{dir}{name_prefix}"), Some(PATH_DELIMITER))?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let name = entry.name.strip_prefix(dir.as_str())?.to_string();
                Some((name, entry.size_bytes))
            })
            .collect())
    }
}
