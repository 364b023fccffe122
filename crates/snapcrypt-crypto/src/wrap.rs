//! Data key wrapping with an age X25519 keypair
//!
//! The wrapped record is a binary age file whose payload is the 32 raw data
//! key bytes, encrypted to the keypair's public recipient. Unwrapping needs
//! the matching identity; any failure is reported as `KeyUnwrap` and is never
//! retried.

use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use age::x25519::{Identity, Recipient};
use secrecy::ExposeSecret;
use zeroize::Zeroize;

use snapcrypt_core::{SnapcryptError, SnapcryptResult};

use crate::keys::DataKey;
use crate::KEY_SIZE;

/// Asymmetric key material used to protect a repository's data key.
pub struct Keypair {
    identity: Identity,
    recipient: Recipient,
}

impl Keypair {
    /// Generate a fresh X25519 keypair.
    pub fn generate() -> Self {
        Self::from_identity(Identity::generate())
    }

    pub fn from_identity(identity: Identity) -> Self {
        let recipient = identity.to_public();
        Self {
            identity,
            recipient,
        }
    }

    /// Parse identity-file content: the first `AGE-SECRET-KEY-1…` line wins,
    /// blank lines and `#` comments are skipped.
    pub fn parse(content: &str) -> SnapcryptResult<Self> {
        let line = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| SnapcryptError::Config("identity file contains no key".into()))?;

        let identity = Identity::from_str(line)
            .map_err(|e| SnapcryptError::Config(format!("invalid age identity: {e}")))?;
        Ok(Self::from_identity(identity))
    }

    /// Load an identity file from disk.
    pub fn load(path: &Path) -> SnapcryptResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnapcryptError::Config(format!("reading identity {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    /// Render in age identity-file format (secret; caller decides where it goes).
    pub fn to_identity_file(&self) -> String {
        format!(
            "# public key: {}\n{}\n",
            self.recipient,
            self.identity.to_string().expose_secret()
        )
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("recipient", &self.recipient.to_string())
            .field("identity", &"[REDACTED]")
            .finish()
    }
}

/// Wrap (encrypt) a data key to the keypair's public recipient.
pub fn wrap_key(key: &DataKey, recipient: &Recipient) -> SnapcryptResult<Vec<u8>> {
    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))
            .map_err(|e| SnapcryptError::Crypto(format!("creating age encryptor: {e}")))?;

    let mut wrapped = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut wrapped)
        .map_err(|e| SnapcryptError::Crypto(format!("key wrapping failed: {e}")))?;
    writer
        .write_all(key.as_bytes())
        .map_err(|e| SnapcryptError::Crypto(format!("key wrapping failed: {e}")))?;
    writer
        .finish()
        .map_err(|e| SnapcryptError::Crypto(format!("finishing wrapped key: {e}")))?;

    Ok(wrapped)
}

/// Unwrap (decrypt) a data key with the keypair's private identity.
pub fn unwrap_key(wrapped: &[u8], identity: &Identity) -> SnapcryptResult<DataKey> {
    let decryptor = age::Decryptor::new(wrapped)
        .map_err(|e| SnapcryptError::KeyUnwrap(format!("malformed wrapped key: {e}")))?;

    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| SnapcryptError::KeyUnwrap(format!("wrong identity or tampered record: {e}")))?;

    let mut plaintext = Vec::with_capacity(KEY_SIZE);
    if let Err(e) = reader.read_to_end(&mut plaintext) {
        plaintext.zeroize();
        return Err(SnapcryptError::KeyUnwrap(format!("reading wrapped key: {e}")));
    }

    if plaintext.len() != KEY_SIZE {
        let len = plaintext.len();
        plaintext.zeroize();
        return Err(SnapcryptError::KeyUnwrap(format!(
            "unwrapped key has wrong size: {len} bytes (expected {KEY_SIZE})"
        )));
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(DataKey::from_bytes(key_bytes))
}
