//! Chunked-mode codec: fixed-size, independently verifiable frames
//!
//! Frame format (binary):
//! ```text
//! [8 bytes: hash, u64 LE][16 bytes: random IV][N bytes: AES-256-CTR ciphertext]
//! hash = first 8 bytes of BLAKE3-keyed(frame_hash_key, ciphertext || iv)
//! ```
//!
//! Every frame carries `chunk_size` plaintext bytes except the last, which
//! may be shorter. Frames carry no length field, so the decoder must be
//! configured with the same chunk size as the encoder. A frame is verified
//! in full before any of its plaintext is released, and a mismatch is always
//! fatal.

use std::io::{self, Read, Write};

use tracing::warn;

use snapcrypt_core::{SnapcryptError, SnapcryptResult};

use crate::cipher::{apply_keystream, random_iv, tag_transport};
use crate::keys::{derive_frame_hash_key, DataKey};
use crate::{FRAME_HEADER_SIZE, HASH_SIZE, IV_SIZE, KEY_SIZE};

/// Truncated keyed hash over `ciphertext || iv`.
pub fn frame_hash(hash_key: &[u8; KEY_SIZE], ciphertext: &[u8], iv: &[u8; IV_SIZE]) -> u64 {
    let mut hasher = blake3::Hasher::new_keyed(hash_key);
    hasher.update(ciphertext);
    hasher.update(iv);
    let digest = hasher.finalize();

    let mut head = [0u8; HASH_SIZE];
    head.copy_from_slice(&digest.as_bytes()[..HASH_SIZE]);
    u64::from_le_bytes(head)
}

/// Encrypt one plaintext chunk into a complete frame.
pub fn seal_frame(key: &DataKey, hash_key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let iv = random_iv();
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + plaintext.len());
    frame.extend_from_slice(&[0u8; HASH_SIZE]);
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(plaintext);

    apply_keystream(key, &iv, &mut frame[FRAME_HEADER_SIZE..]);
    let hash = frame_hash(hash_key, &frame[FRAME_HEADER_SIZE..], &iv);
    frame[..HASH_SIZE].copy_from_slice(&hash.to_le_bytes());
    frame
}

/// Verify and decrypt one frame, replacing the contents of `out`.
///
/// `path` and `index` only label the error.
pub fn open_frame_into(
    key: &DataKey,
    hash_key: &[u8; KEY_SIZE],
    frame: &[u8],
    path: &str,
    index: u64,
    out: &mut Vec<u8>,
) -> SnapcryptResult<()> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(SnapcryptError::CorruptStream {
            path: path.to_string(),
            reason: format!(
                "frame {index} too short: {} bytes (minimum {FRAME_HEADER_SIZE})",
                frame.len()
            ),
        });
    }

    let (header, ciphertext) = frame.split_at(FRAME_HEADER_SIZE);
    let mut stored = [0u8; HASH_SIZE];
    stored.copy_from_slice(&header[..HASH_SIZE]);
    let expected = u64::from_le_bytes(stored);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&header[HASH_SIZE..]);

    let actual = frame_hash(hash_key, ciphertext, &iv);
    if actual != expected {
        return Err(SnapcryptError::Integrity {
            path: path.to_string(),
            chunk: index,
            expected,
            actual,
        });
    }

    out.clear();
    out.extend_from_slice(ciphertext);
    apply_keystream(key, &iv, out);
    Ok(())
}

/// Buffers plaintext and emits one frame per `chunk_size` bytes.
///
/// Frames are written whole, so a closed sink never holds half a frame.
/// Dropping the encoder without [`ChunkedEncoder::finish`] discards the
/// buffered tail instead of emitting it.
pub struct ChunkedEncoder<W: Write> {
    inner: W,
    key: DataKey,
    hash_key: [u8; KEY_SIZE],
    chunk_size: usize,
    pending: Vec<u8>,
    frames: u64,
}

impl<W: Write> ChunkedEncoder<W> {
    pub fn new(inner: W, key: &DataKey, chunk_size: usize) -> SnapcryptResult<Self> {
        if chunk_size == 0 {
            return Err(SnapcryptError::Config("chunk size must be > 0".into()));
        }
        Ok(Self {
            inner,
            key: key.clone(),
            hash_key: derive_frame_hash_key(key)?,
            chunk_size,
            pending: Vec::with_capacity(chunk_size),
            frames: 0,
        })
    }

    /// Number of frames emitted so far.
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Emit the final (possibly short) frame and return the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.emit_frame()?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn emit_frame(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let frame = seal_frame(&self.key, &self.hash_key, &self.pending);
        self.inner.write_all(&frame)?;
        self.pending.clear();
        self.frames += 1;
        Ok(())
    }
}

impl<W: Write> Write for ChunkedEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.chunk_size - self.pending.len();
        let take = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..take]);
        if self.pending.len() == self.chunk_size {
            self.emit_frame()?;
        }
        Ok(take)
    }

    /// Flushes the sink only: a short frame mid-stream would break decoding.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reads frames one at a time, verifying each before releasing plaintext.
/// Returns `Ok(0)` once the stream ends cleanly on a frame boundary.
pub struct ChunkedDecoder<R: Read> {
    inner: R,
    key: DataKey,
    hash_key: [u8; KEY_SIZE],
    chunk_size: usize,
    path: String,
    frame: Vec<u8>,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    done: bool,
}

impl<R: Read> ChunkedDecoder<R> {
    pub fn new(inner: R, key: &DataKey, chunk_size: usize, path: impl Into<String>) -> SnapcryptResult<Self> {
        if chunk_size == 0 {
            return Err(SnapcryptError::Config("chunk size must be > 0".into()));
        }
        Ok(Self {
            inner,
            key: key.clone(),
            hash_key: derive_frame_hash_key(key)?,
            chunk_size,
            path: path.into(),
            frame: Vec::new(),
            plain: Vec::new(),
            pos: 0,
            index: 0,
            done: false,
        })
    }

    /// Number of frames verified so far.
    pub fn frames_read(&self) -> u64 {
        self.index
    }

    fn next_frame(&mut self) -> io::Result<bool> {
        if self.done {
            return Ok(false);
        }

        let frame_len = FRAME_HEADER_SIZE + self.chunk_size;
        self.frame.resize(frame_len, 0);
        let filled = read_full(&mut self.inner, &mut self.frame)?;

        if filled < frame_len {
            self.done = true;
        }
        if filled == 0 {
            return Ok(false);
        }
        if filled <= FRAME_HEADER_SIZE {
            warn!(
                path = %self.path,
                bytes = filled,
                frame = self.index,
                "discarding truncated trailing frame"
            );
            return Ok(false);
        }

        open_frame_into(
            &self.key,
            &self.hash_key,
            &self.frame[..filled],
            &self.path,
            self.index,
            &mut self.plain,
        )
        .map_err(SnapcryptError::into_io)?;
        self.pos = 0;
        self.index += 1;
        Ok(true)
    }
}

impl<R: Read> Read for ChunkedDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.plain.len() {
            if !self.next_frame()? {
                return Ok(0);
            }
        }
        let n = (self.plain.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Fill `buf` unless EOF comes first; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(tag_transport(e)),
        }
    }
    Ok(filled)
}

/// Encode an in-memory buffer into chunked frames.
pub fn encode_chunked(key: &DataKey, chunk_size: usize, data: &[u8]) -> SnapcryptResult<Vec<u8>> {
    let mut encoder = ChunkedEncoder::new(Vec::new(), key, chunk_size)?;
    encoder.write_all(data).map_err(SnapcryptError::from_io)?;
    encoder.finish().map_err(SnapcryptError::from_io)
}

/// Drain a chunked stream into a single buffer.
pub fn decode_chunked_all<R: Read>(
    key: &DataKey,
    chunk_size: usize,
    path: &str,
    src: R,
) -> SnapcryptResult<Vec<u8>> {
    let mut decoder = ChunkedDecoder::new(src, key, chunk_size, path)?;
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(SnapcryptError::from_io)?;
    Ok(out)
}
