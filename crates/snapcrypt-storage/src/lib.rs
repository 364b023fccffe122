//! snapcrypt-storage: encrypted blob repositories over pluggable backends
//!
//! - `client`: the minimal backend surface (get/put/list/delete/range-read)
//! - `memory` / `operator`: in-process and OpenDAL-backed clients
//! - `resumable`: forward-only reader that reopens at the last good offset
//! - `keystore`: per-repository data key bootstrap and restore
//! - `gateway`: the uniform storage contract every backend is driven through
//! - `repository`: the open-repository handle tying the pieces together

pub mod client;
pub mod gateway;
pub mod health;
pub mod keystore;
pub mod memory;
pub mod operator;
pub mod repository;
pub mod resumable;

pub use client::{BlobClient, BlobUpload, ClientError, ClientErrorKind, ListPage, Precondition};
pub use gateway::{BackendProfile, BlobGateway, StorageGateway};
pub use health::check_health;
pub use keystore::RepositoryKeyStore;
pub use memory::MemoryBlobClient;
pub use operator::{build_operator, OpendalBlobClient};
pub use repository::Repository;
pub use resumable::{ClientRangeSource, ErrorClass, RangeSource, ResumableReader, RetryState};
