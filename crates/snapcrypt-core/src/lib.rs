pub mod config;
pub mod error;
pub mod types;

pub use error::{SnapcryptError, SnapcryptResult, MAX_SUPPRESSED};
pub use types::{BlobEntry, DeleteResult, METADATA_BLOB, PATH_DELIMITER};
