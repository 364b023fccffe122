use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{SnapcryptError, SnapcryptResult};

/// Default plaintext size of one authenticated frame (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default cap on names per bulk delete request.
pub const DEFAULT_MAX_BATCH_DELETE: usize = 10_000;

/// Top-level configuration (loaded from snapcrypt.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapcryptConfig {
    pub storage: StorageConfig,
    pub codec: CodecConfig,
    pub retry: RetryConfig,
    pub delete: DeleteConfig,
    pub keys: KeysConfig,
}

/// Which blob service backs the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    S3,
    Gcs,
    Azure,
    Memory,
}

/// Framing used on the wire for encrypted blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecMode {
    /// One IV header followed by a single enciphered stream.
    Continuous,
    /// Fixed-size frames, each with its own IV and hash.
    Chunked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Blob service kind
    pub backend: BackendKind,
    /// Service endpoint (S3-compatible URL, Azure blob endpoint, ...)
    pub endpoint: String,
    /// Region (S3 only)
    pub region: String,
    /// Bucket (S3, GCS) or container (Azure)
    pub bucket: String,
    /// Repository base path inside the bucket
    pub base_path: String,
    /// Storage account name (Azure only)
    pub account_name: Option<String>,
    /// Service-account JSON (GCS only)
    pub credentials_file: Option<PathBuf>,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Force a framing mode instead of the backend's default
    pub mode: Option<CodecMode>,
    /// Plaintext bytes per frame in chunked mode
    pub chunk_size: usize,
    /// zstd-compress plaintext before encryption
    pub compress: bool,
    /// zstd level (1-22)
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts a resumable read may make, including the first
    pub max_read_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteConfig {
    /// Names per bulk delete request (further capped by the backend)
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// age X25519 identity file holding the repository private key
    pub identity_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::S3,
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "snapcrypt".into(),
            base_path: "repository".into(),
            account_name: None,
            credentials_file: None,
            enforce_tls: false,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            mode: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: true,
            compression_level: 3,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_read_attempts: 3,
        }
    }
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_DELETE,
        }
    }
}

impl SnapcryptConfig {
    /// Parse a TOML document, filling unspecified fields with defaults.
    pub fn from_toml(content: &str) -> SnapcryptResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| SnapcryptError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SnapcryptResult<()> {
        if self.codec.chunk_size == 0 {
            return Err(SnapcryptError::Config("codec.chunk_size must be > 0".into()));
        }
        if !(1..=22).contains(&self.codec.compression_level) {
            return Err(SnapcryptError::Config(format!(
                "codec.compression_level must be within 1..=22, got {}",
                self.codec.compression_level
            )));
        }
        if self.retry.max_read_attempts == 0 {
            return Err(SnapcryptError::Config(
                "retry.max_read_attempts must be >= 1".into(),
            ));
        }
        if self.delete.max_batch_size == 0 {
            return Err(SnapcryptError::Config(
                "delete.max_batch_size must be > 0".into(),
            ));
        }
        if self.storage.enforce_tls && self.storage.endpoint.starts_with("http://") {
            return Err(SnapcryptError::Config(format!(
                "endpoint {} uses plaintext HTTP but storage.enforce_tls is set",
                self.storage.endpoint
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
backend = "gcs"
endpoint = "https://storage.googleapis.com"
bucket = "backups"
base_path = "prod/snapshots"
credentials_file = "/etc/snapcrypt/gcs.json"
enforce_tls = true

[codec]
mode = "chunked"
chunk_size = 1048576
compress = false
compression_level = 9

[retry]
max_read_attempts = 5

[delete]
max_batch_size = 500

[keys]
identity_file = "/etc/snapcrypt/identity.txt"
"#;
        let config = SnapcryptConfig::from_toml(toml_str).unwrap();

        assert_eq!(config.storage.backend, BackendKind::Gcs);
        assert_eq!(config.storage.base_path, "prod/snapshots");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.codec.mode, Some(CodecMode::Chunked));
        assert_eq!(config.codec.chunk_size, 1048576);
        assert!(!config.codec.compress);
        assert_eq!(config.retry.max_read_attempts, 5);
        assert_eq!(config.delete.max_batch_size, 500);
        assert_eq!(
            config.keys.identity_file,
            Some(PathBuf::from("/etc/snapcrypt/identity.txt"))
        );
    }

    #[test]
    fn test_parse_defaults() {
        let config = SnapcryptConfig::from_toml("").unwrap();

        assert_eq!(config.storage.backend, BackendKind::S3);
        assert_eq!(config.storage.base_path, "repository");
        assert_eq!(config.codec.mode, None);
        assert_eq!(config.codec.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.codec.compress);
        assert_eq!(config.retry.max_read_attempts, 3);
        assert_eq!(config.delete.max_batch_size, DEFAULT_MAX_BATCH_DELETE);
        assert!(config.keys.identity_file.is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[storage]
backend = "memory"
"#;
        let config = SnapcryptConfig::from_toml(toml_str).unwrap();

        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.codec.compression_level, 3);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let result = SnapcryptConfig::from_toml("[codec]\nchunk_size = 0\n");
        assert!(matches!(result, Err(SnapcryptError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = SnapcryptConfig::from_toml("[retry]\nmax_read_attempts = 0\n");
        assert!(matches!(result, Err(SnapcryptError::Config(_))));
    }

    #[test]
    fn test_enforce_tls_rejects_http() {
        let toml_str = r#"
[storage]
endpoint = "http://insecure:9000"
enforce_tls = true
"#;
        let err = SnapcryptConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SnapcryptConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = SnapcryptConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.storage.endpoint, parsed.storage.endpoint);
        assert_eq!(config.codec.chunk_size, parsed.codec.chunk_size);
        assert_eq!(config.delete.max_batch_size, parsed.delete.max_batch_size);
    }
}
