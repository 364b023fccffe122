//! Forward-only reader that survives dropped connections
//!
//! On a transient failure the underlying stream is discarded and reopened at
//! the offset of the last byte handed to the caller. Attempts are counted over
//! the reader's whole lifetime, not per failure.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use snapcrypt_core::{SnapcryptError, MAX_SUPPRESSED};
use tracing::warn;

use crate::client::BlobClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The object is gone; retrying cannot help.
    NotFound,
    Transient,
    /// Already a decoded failure; pass through untouched.
    Fatal,
}

impl ErrorClass {
    pub fn of(err: &io::Error) -> Self {
        match SnapcryptError::typed_ref(err) {
            Some(SnapcryptError::BlobNotFound { .. }) => Self::NotFound,
            Some(_) => Self::Fatal,
            None if err.kind() == io::ErrorKind::NotFound => Self::NotFound,
            None => Self::Transient,
        }
    }
}

/// Something that can hand out a fresh stream positioned at any offset.
pub trait RangeSource: Send {
    fn open_at(&mut self, offset: u64) -> io::Result<Box<dyn Read + Send>>;

    fn classify(&self, err: &io::Error) -> ErrorClass {
        ErrorClass::of(err)
    }
}

/// Ranged reads of one object through a `BlobClient`.
pub struct ClientRangeSource<C: BlobClient + ?Sized> {
    client: Arc<C>,
    path: String,
}

impl<C: BlobClient + ?Sized> ClientRangeSource<C> {
    pub fn new(client: Arc<C>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

impl<C: BlobClient + ?Sized> RangeSource for ClientRangeSource<C> {
    fn open_at(&mut self, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        self.client
            .range_read(&self.path, offset)
            .map_err(io::Error::from)
    }
}

#[derive(Debug)]
pub struct RetryState {
    /// 1-based number of the attempt currently in progress.
    pub attempt: u32,
    /// Bytes delivered to the caller so far.
    pub offset: u64,
    pub suppressed: Vec<io::Error>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt: 1,
            offset: 0,
            suppressed: Vec::new(),
        }
    }
}

pub struct ResumableReader<S: RangeSource> {
    source: S,
    path: String,
    max_attempts: u32,
    current: Option<Box<dyn Read + Send>>,
    state: RetryState,
}

impl<S: RangeSource> ResumableReader<S> {
    /// `max_attempts` includes the first attempt; values below 1 are treated as 1.
    pub fn new(source: S, path: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            source,
            path: path.into(),
            max_attempts: max_attempts.max(1),
            current: None,
            state: RetryState::default(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.state.attempt
    }

    pub fn offset(&self) -> u64 {
        self.state.offset
    }

    pub fn suppressed(&self) -> &[io::Error] {
        &self.state.suppressed
    }

    fn read_once(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.current.is_none() {
            self.current = Some(self.source.open_at(self.state.offset)?);
        }
        match self.current.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl<S: RangeSource> Read for ResumableReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let err = match self.read_once(buf) {
                Ok(n) => {
                    self.state.offset += n as u64;
                    return Ok(n);
                }
                Err(e) => e,
            };
            self.current = None;

            match self.source.classify(&err) {
                ErrorClass::NotFound => {
                    return Err(SnapcryptError::BlobNotFound {
                        path: self.path.clone(),
                    }
                    .into_io())
                }
                ErrorClass::Fatal => return Err(err),
                ErrorClass::Transient => {}
            }

            if self.state.attempt >= self.max_attempts {
                return Err(SnapcryptError::TransientIo {
                    path: self.path.clone(),
                    attempts: self.state.attempt,
                    source: err,
                    suppressed: std::mem::take(&mut self.state.suppressed),
                }
                .into_io());
            }

            warn!(
                path = %self.path,
                attempt = self.state.attempt,
                offset = self.state.offset,
                error = %err,
                "transient read failure, reopening at offset"
            );
            self.state.attempt += 1;
            if self.state.suppressed.len() < MAX_SUPPRESSED {
                self.state.suppressed.push(err);
            }
        }
    }
}

/// Only the current position can be queried; rewinding or skipping fails.
impl<S: RangeSource> Seek for ResumableReader<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.state.offset),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "resumable reads are forward-only",
            )),
        }
    }
}
