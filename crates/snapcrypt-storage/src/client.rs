//! Minimal backend surface the gateway is built on
//!
//! Every object store snapcrypt talks to is reduced to these six calls.
//! Implementations are synchronous; async SDKs drive their own runtime.

use std::io::{self, Read, Write};

use snapcrypt_core::{BlobEntry, SnapcryptError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    NotFound,
    /// A conditional write lost: the object already exists.
    PreconditionFailed,
    /// Worth retrying (timeouts, throttling, dropped connections).
    Transient,
    Other,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(ClientErrorKind::NotFound, format!("{path}: object not found"))
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ClientErrorKind::NotFound
    }

    /// Classify an `io::Error` raised while streaming to or from a backend.
    pub fn from_io(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ClientErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ClientErrorKind::PreconditionFailed,
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => ClientErrorKind::Transient,
            _ => ClientErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }

    pub fn into_io(self) -> io::Error {
        let kind = match self.kind {
            ClientErrorKind::NotFound => io::ErrorKind::NotFound,
            ClientErrorKind::PreconditionFailed => io::ErrorKind::AlreadyExists,
            ClientErrorKind::Transient => io::ErrorKind::TimedOut,
            ClientErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Lift into the crate-wide error for the object at `path`.
    pub fn into_snapcrypt(self, path: &str) -> SnapcryptError {
        match self.kind {
            ClientErrorKind::NotFound => SnapcryptError::BlobNotFound {
                path: path.to_string(),
            },
            ClientErrorKind::PreconditionFailed => SnapcryptError::AlreadyExists {
                path: path.to_string(),
            },
            _ => SnapcryptError::Backend {
                path: path.to_string(),
                message: self.message,
            },
        }
    }
}

impl From<ClientError> for io::Error {
    fn from(err: ClientError) -> Self {
        err.into_io()
    }
}

/// Write precondition for `put_object`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    /// Fail with `PreconditionFailed` if the object already exists.
    IfNotExists,
}

/// One page of a listing. `next_token` is `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<BlobEntry>,
    /// Prefixes (ending in the delimiter) grouped under a delimiter listing.
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// An in-flight upload. Nothing is visible until `commit` succeeds;
/// dropping without committing abandons the object.
pub trait BlobUpload: Write + Send {
    fn commit(self: Box<Self>) -> Result<(), ClientError>;
}

pub trait BlobClient: Send + Sync {
    /// Size of the object, or `None` if absent.
    fn head_object(&self, path: &str) -> Result<Option<u64>, ClientError>;

    fn get_object(&self, path: &str) -> Result<Vec<u8>, ClientError>;

    /// Stream the object starting at byte `offset`.
    fn range_read(&self, path: &str, offset: u64) -> Result<Box<dyn Read + Send>, ClientError>;

    fn put_object(
        &self,
        path: &str,
        precondition: Precondition,
        size_hint: Option<u64>,
    ) -> Result<Box<dyn BlobUpload>, ClientError>;

    /// List objects under `prefix`. With a delimiter, names containing it past
    /// the prefix are folded into `common_prefixes`.
    fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> Result<ListPage, ClientError>;

    /// Delete a batch, reporting an outcome per path.
    fn delete_objects(&self, paths: &[String]) -> Vec<(String, Result<(), ClientError>)>;

    fn put_bytes(
        &self,
        path: &str,
        data: &[u8],
        precondition: Precondition,
    ) -> Result<(), ClientError> {
        let mut upload = self.put_object(path, precondition, Some(data.len() as u64))?;
        upload.write_all(data).map_err(ClientError::from_io)?;
        upload.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_typed_errors() {
        let err = ClientError::not_found("repo/a").into_snapcrypt("repo/a");
        assert!(matches!(err, SnapcryptError::BlobNotFound { path } if path == "repo/a"));

        let err = ClientError::new(ClientErrorKind::PreconditionFailed, "exists")
            .into_snapcrypt("repo/b");
        assert!(matches!(err, SnapcryptError::AlreadyExists { .. }));

        let err = ClientError::new(ClientErrorKind::Other, "boom").into_snapcrypt("repo/c");
        assert!(matches!(err, SnapcryptError::Backend { message, .. } if message == "boom"));
    }

    #[test]
    fn io_kinds_round_trip() {
        let io_err = ClientError::not_found("x").into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
        assert!(ClientError::from_io(io_err).is_not_found());

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(ClientError::from_io(reset).kind, ClientErrorKind::Transient);
    }
}
