//! Open-repository handle

use std::sync::Arc;

use snapcrypt_core::config::SnapcryptConfig;
use snapcrypt_core::SnapcryptResult;
use snapcrypt_crypto::{BlobCodec, CodecSettings, DataKey, Keypair};
use tracing::debug;

use crate::client::BlobClient;
use crate::gateway::{BackendProfile, BlobGateway};
use crate::keystore::RepositoryKeyStore;

#[derive(Debug, Clone, Copy)]
enum KeyPolicy {
    Create,
    RestoreOnly,
}

/// A repository at one base path, with its data key resolved.
///
/// All blobs written through one handle share the same data key.
pub struct Repository<C: BlobClient> {
    gateway: BlobGateway<C>,
    key_store: RepositoryKeyStore,
}

impl<C: BlobClient + 'static> Repository<C> {
    /// Open using the built-in profile for `config.storage.backend`.
    pub fn open(client: Arc<C>, config: &SnapcryptConfig, keypair: Arc<Keypair>) -> SnapcryptResult<Self> {
        let profile = BackendProfile::for_kind(config.storage.backend);
        Self::open_with_profile(client, profile, config, keypair)
    }

    pub fn open_with_profile(
        client: Arc<C>,
        profile: BackendProfile,
        config: &SnapcryptConfig,
        keypair: Arc<Keypair>,
    ) -> SnapcryptResult<Self> {
        Self::build(client, profile, config, keypair, KeyPolicy::Create)
    }

    /// Open a repository that must already hold a data key.
    ///
    /// Nothing is written; an uninitialized base path fails with
    /// `BlobNotFound` for the metadata blob.
    pub fn open_existing(
        client: Arc<C>,
        config: &SnapcryptConfig,
        keypair: Arc<Keypair>,
    ) -> SnapcryptResult<Self> {
        let profile = BackendProfile::for_kind(config.storage.backend);
        Self::build(client, profile, config, keypair, KeyPolicy::RestoreOnly)
    }

    fn build(
        client: Arc<C>,
        profile: BackendProfile,
        config: &SnapcryptConfig,
        keypair: Arc<Keypair>,
        policy: KeyPolicy,
    ) -> SnapcryptResult<Self> {
        config.validate()?;
        let base_path = config.storage.base_path.clone();
        let key_store = RepositoryKeyStore::new(base_path.clone(), keypair);
        let key = match policy {
            KeyPolicy::Create => key_store.data_key(client.as_ref())?,
            KeyPolicy::RestoreOnly => key_store.existing_data_key(client.as_ref())?,
        };

        let settings = CodecSettings::from_config(&config.codec, profile.codec_mode);
        debug!(
            base_path = %base_path,
            backend = ?profile.kind,
            mode = ?settings.mode,
            "opened repository"
        );
        let codec = BlobCodec::new(key, settings);
        let gateway = BlobGateway::new(
            client,
            base_path,
            profile,
            codec,
            &config.retry,
            &config.delete,
        );
        Ok(Self { gateway, key_store })
    }

    pub fn gateway(&self) -> &BlobGateway<C> {
        &self.gateway
    }

    pub fn key_store(&self) -> &RepositoryKeyStore {
        &self.key_store
    }

    /// The cached data key for this handle.
    pub fn data_key(&self) -> SnapcryptResult<Arc<DataKey>> {
        self.key_store.data_key(self.gateway.client().as_ref())
    }
}
