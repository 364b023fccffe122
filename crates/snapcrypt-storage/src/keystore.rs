//! Per-repository data key bootstrap
//!
//! The first open of a repository generates a data key, wraps it for the
//! operator's keypair, and stores it with a create-only write. Every later
//! open restores the same key. Two processes racing on an empty repository
//! converge on whichever write landed.

use std::sync::{Arc, Mutex, PoisonError};

use snapcrypt_core::types::join_path;
use snapcrypt_core::{SnapcryptResult, METADATA_BLOB};
use snapcrypt_crypto::{generate_data_key, unwrap_key, wrap_key, DataKey, Keypair};
use tracing::info;

use crate::client::{BlobClient, ClientErrorKind, Precondition};

pub struct RepositoryKeyStore {
    base_path: String,
    keypair: Arc<Keypair>,
    cached: Mutex<Option<Arc<DataKey>>>,
}

impl RepositoryKeyStore {
    pub fn new(base_path: impl Into<String>, keypair: Arc<Keypair>) -> Self {
        Self {
            base_path: base_path.into(),
            keypair,
            cached: Mutex::new(None),
        }
    }

    pub fn metadata_path(&self) -> String {
        join_path(&self.base_path, METADATA_BLOB)
    }

    /// The repository's data key, created on first use.
    ///
    /// The result is cached; the lock is held across the first load so
    /// concurrent callers on one handle never both create a key.
    pub fn data_key<C: BlobClient + ?Sized>(&self, client: &C) -> SnapcryptResult<Arc<DataKey>> {
        self.cached_or(|| self.load_or_create(client))
    }

    /// The repository's data key, failing with `BlobNotFound` on a
    /// repository that has none yet. Never writes.
    pub fn existing_data_key<C: BlobClient + ?Sized>(
        &self,
        client: &C,
    ) -> SnapcryptResult<Arc<DataKey>> {
        self.cached_or(|| {
            let path = self.metadata_path();
            let wrapped = client
                .get_object(&path)
                .map_err(|e| e.into_snapcrypt(&path))?;
            self.restore(&wrapped, &path)
        })
    }

    fn cached_or(
        &self,
        load: impl FnOnce() -> SnapcryptResult<DataKey>,
    ) -> SnapcryptResult<Arc<DataKey>> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = cached.as_ref() {
            return Ok(Arc::clone(key));
        }
        let key = Arc::new(load()?);
        *cached = Some(Arc::clone(&key));
        Ok(key)
    }

    fn restore(&self, wrapped: &[u8], path: &str) -> SnapcryptResult<DataKey> {
        let key = unwrap_key(wrapped, self.keypair.identity())?;
        info!(path = %path, "restored repository data key");
        Ok(key)
    }

    fn load_or_create<C: BlobClient + ?Sized>(&self, client: &C) -> SnapcryptResult<DataKey> {
        let path = self.metadata_path();
        match client.get_object(&path) {
            Ok(wrapped) => return self.restore(&wrapped, &path),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into_snapcrypt(&path)),
        }

        let key = generate_data_key();
        let wrapped = wrap_key(&key, self.keypair.recipient())?;
        match client.put_bytes(&path, &wrapped, Precondition::IfNotExists) {
            Ok(()) => {
                info!(path = %path, "created repository data key");
                Ok(key)
            }
            Err(e) if e.kind == ClientErrorKind::PreconditionFailed => {
                info!(path = %path, "data key created concurrently, restoring it");
                let wrapped = client
                    .get_object(&path)
                    .map_err(|e| e.into_snapcrypt(&path))?;
                self.restore(&wrapped, &path)
            }
            Err(e) => Err(e.into_snapcrypt(&path)),
        }
    }
}

impl std::fmt::Debug for RepositoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryKeyStore")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}
