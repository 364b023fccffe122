//! Storage health check

use snapcrypt_core::types::dir_path;
use snapcrypt_core::{SnapcryptError, SnapcryptResult};

use crate::client::BlobClient;

/// Verify the backend is reachable by listing one page under `base_path`
pub fn check_health<C: BlobClient + ?Sized>(client: &C, base_path: &str) -> SnapcryptResult<()> {
    let prefix = dir_path(base_path);
    client
        .list_objects(&prefix, Some("/"), None)
        .map(|_| ())
        .map_err(|e| SnapcryptError::Backend {
            path: prefix,
            message: format!("storage health check failed: {e}"),
        })
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub fn is_healthy<C: BlobClient + ?Sized>(client: &C, base_path: &str) -> bool {
    check_health(client, base_path).is_ok()
}
