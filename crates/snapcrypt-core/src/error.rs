use std::io;

use thiserror::Error;

pub type SnapcryptResult<T> = Result<T, SnapcryptError>;

/// Upper bound on retry failures kept alongside a final transient error.
pub const MAX_SUPPRESSED: usize = 10;

#[derive(Debug, Error)]
pub enum SnapcryptError {
    #[error("key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("integrity check failed for {path}: chunk {chunk} hash {actual:#018x} != stored {expected:#018x}")]
    Integrity {
        path: String,
        chunk: u64,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt stream {path}: {reason}")]
    CorruptStream { path: String, reason: String },

    #[error("blob not found: {path}")]
    BlobNotFound { path: String },

    #[error("transient I/O failure reading {path} after {attempts} attempts ({} suppressed): {source}", .suppressed.len())]
    TransientIo {
        path: String,
        attempts: u32,
        #[source]
        source: io::Error,
        suppressed: Vec<io::Error>,
    },

    #[error("blob already exists: {path}")]
    AlreadyExists { path: String },

    #[error("bulk delete left {} blob(s) undeleted", .failures.len())]
    BulkDeletePartial { failures: Vec<(String, String)> },

    #[error("backend error on {path}: {message}")]
    Backend { path: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SnapcryptError {
    /// Carry this error through an `std::io` boundary without losing its type.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Self::BlobNotFound { .. } => io::ErrorKind::NotFound,
            Self::AlreadyExists { .. } => io::ErrorKind::AlreadyExists,
            Self::KeyUnwrap(_) | Self::Integrity { .. } | Self::CorruptStream { .. } => {
                io::ErrorKind::InvalidData
            }
            Self::TransientIo { .. } => io::ErrorKind::TimedOut,
            Self::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recover a typed error from an `io::Error`, wrapping untyped ones as `Io`.
    pub fn from_io(err: io::Error) -> Self {
        if !Self::is_typed(&err) {
            return Self::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<SnapcryptError>()) {
            Some(Ok(typed)) => *typed,
            Some(Err(other)) => Self::Io(io::Error::new(kind, other)),
            None => Self::Io(io::Error::from(kind)),
        }
    }

    /// True if `err` already carries a `SnapcryptError`.
    pub fn is_typed(err: &io::Error) -> bool {
        err.get_ref()
            .is_some_and(|inner| inner.is::<SnapcryptError>())
    }

    /// Borrow the typed error inside `err`, if any.
    pub fn typed_ref(err: &io::Error) -> Option<&SnapcryptError> {
        err.get_ref().and_then(|inner| inner.downcast_ref())
    }

    /// Errors that no amount of retrying can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::KeyUnwrap(_)
                | Self::Integrity { .. }
                | Self::CorruptStream { .. }
                | Self::BlobNotFound { .. }
                | Self::AlreadyExists { .. }
        )
    }
}

impl From<SnapcryptError> for io::Error {
    fn from(err: SnapcryptError) -> Self {
        err.into_io()
    }
}
