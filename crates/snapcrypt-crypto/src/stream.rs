//! Continuous-mode codec: one IV header, then a single enciphered stream
//!
//! Wire format:
//! ```text
//! [16 bytes: random IV][AES-256-CTR(zstd(plaintext))]
//! ```
//!
//! Nothing in this framing authenticates the body; corruption surfaces as a
//! zstd failure (or garbage when compression is off) and is reported as
//! `CorruptStream`. Use the chunked codec where tamper detection matters.

use std::io::{self, BufReader, Read, Write};

use snapcrypt_core::SnapcryptError;

use crate::cipher::{random_iv, tag_transport, CipherReader, CipherWriter};
use crate::keys::DataKey;
use crate::IV_SIZE;

enum EncodeSink<W: Write> {
    Plain(CipherWriter<W>),
    Compressed(zstd::stream::write::Encoder<'static, CipherWriter<W>>),
}

/// Streaming continuous-mode encoder. Call [`StreamEncoder::finish`] to flush
/// the compressor; dropping it early leaves a truncated body.
pub struct StreamEncoder<W: Write> {
    sink: EncodeSink<W>,
}

impl<W: Write> StreamEncoder<W> {
    /// Write a fresh IV header to `inner` and set up the cipher pipeline.
    /// `compression_level: None` disables zstd.
    pub fn new(mut inner: W, key: &DataKey, compression_level: Option<i32>) -> io::Result<Self> {
        let iv = random_iv();
        inner.write_all(&iv)?;
        let cipher = CipherWriter::new(inner, key, &iv);

        let sink = match compression_level {
            Some(level) => EncodeSink::Compressed(zstd::stream::write::Encoder::new(cipher, level)?),
            None => EncodeSink::Plain(cipher),
        };
        Ok(Self { sink })
    }

    pub fn finish(self) -> io::Result<W> {
        let mut cipher = match self.sink {
            EncodeSink::Plain(cipher) => cipher,
            EncodeSink::Compressed(encoder) => encoder.finish()?,
        };
        cipher.flush()?;
        Ok(cipher.into_inner())
    }
}

impl<W: Write> Write for StreamEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            EncodeSink::Plain(cipher) => cipher.write(buf),
            EncodeSink::Compressed(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            EncodeSink::Plain(cipher) => cipher.flush(),
            EncodeSink::Compressed(encoder) => encoder.flush(),
        }
    }
}

/// Turns any untyped failure from a decode pipeline into `CorruptStream`.
///
/// Transport errors are tagged before they reach the decompressor, so an
/// untyped error here can only come from the cipher/zstd layers.
pub(crate) struct DecodeGuard<R: Read> {
    inner: R,
    path: String,
}

impl<R: Read> DecodeGuard<R> {
    pub(crate) fn new(inner: R, path: String) -> Self {
        Self { inner, path }
    }
}

impl<R: Read> Read for DecodeGuard<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            if SnapcryptError::is_typed(&e) {
                e
            } else {
                SnapcryptError::CorruptStream {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }
                .into_io()
            }
        })
    }
}

enum DecodeSource<R: Read> {
    Plain(CipherReader<R>),
    Compressed(zstd::stream::read::Decoder<'static, BufReader<CipherReader<R>>>),
}

impl<R: Read> Read for DecodeSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecodeSource::Plain(cipher) => cipher.read(buf),
            DecodeSource::Compressed(decoder) => decoder.read(buf),
        }
    }
}

/// Streaming continuous-mode decoder.
pub struct StreamDecoder<R: Read> {
    source: DecodeGuard<DecodeSource<R>>,
}

impl<R: Read> StreamDecoder<R> {
    /// Read the IV header from `inner` and set up the inverse pipeline.
    /// `path` labels errors.
    pub fn new(mut inner: R, key: &DataKey, compressed: bool, path: impl Into<String>) -> io::Result<Self> {
        let path = path.into();
        let mut iv = [0u8; IV_SIZE];
        if let Err(e) = inner.read_exact(&mut iv) {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof if !SnapcryptError::is_typed(&e) => {
                    SnapcryptError::CorruptStream {
                        path,
                        reason: "stream shorter than its IV header".into(),
                    }
                    .into_io()
                }
                _ => tag_transport(e),
            });
        }

        let cipher = CipherReader::new(inner, key, &iv);
        let source = if compressed {
            DecodeSource::Compressed(zstd::stream::read::Decoder::new(cipher)?)
        } else {
            DecodeSource::Plain(cipher)
        };
        Ok(Self {
            source: DecodeGuard::new(source, path),
        })
    }
}

impl<R: Read> Read for StreamDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_data_key;

    fn encode(key: &DataKey, data: &[u8], level: Option<i32>) -> Vec<u8> {
        let mut encoder = StreamEncoder::new(Vec::new(), key, level).unwrap();
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn decode(key: &DataKey, data: &[u8], compressed: bool) -> io::Result<Vec<u8>> {
        let mut decoder = StreamDecoder::new(data, key, compressed, "test/blob")?;
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_compressed() {
        let key = generate_data_key();
        let data: Vec<u8> = b"snapshot segment ".iter().cycle().take(100_000).copied().collect();

        let encoded = encode(&key, &data, Some(3));
        assert!(encoded.len() < data.len(), "repetitive data must compress");
        assert_eq!(decode(&key, &encoded, true).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_uncompressed_preserves_length() {
        let key = generate_data_key();
        let data = vec![0x42u8; 4096];

        let encoded = encode(&key, &data, None);
        assert_eq!(encoded.len(), IV_SIZE + data.len());
        assert_eq!(decode(&key, &encoded, false).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_empty() {
        let key = generate_data_key();
        let encoded = encode(&key, b"", Some(3));
        assert_eq!(decode(&key, &encoded, true).unwrap(), b"");

        let encoded = encode(&key, b"", None);
        assert_eq!(encoded.len(), IV_SIZE);
        assert_eq!(decode(&key, &encoded, false).unwrap(), b"");
    }

    #[test]
    fn test_each_object_gets_fresh_iv() {
        let key = generate_data_key();
        let a = encode(&key, b"same payload", None);
        let b = encode(&key, b"same payload", None);
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_header_is_corrupt() {
        let key = generate_data_key();
        let err = decode(&key, &[1, 2, 3], true).unwrap_err();
        assert!(matches!(
            SnapcryptError::from_io(err),
            SnapcryptError::CorruptStream { .. }
        ));
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let key = generate_data_key();
        let encoded = encode(&key, &vec![7u8; 10_000], Some(3));

        let err = decode(&generate_data_key(), &encoded, true).unwrap_err();
        match SnapcryptError::from_io(err) {
            SnapcryptError::CorruptStream { path, .. } => assert_eq!(path, "test/blob"),
            other => panic!("expected CorruptStream, got {other}"),
        }
    }

    #[test]
    fn test_truncated_body_is_corrupt() {
        let key = generate_data_key();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = encode(&key, &data, Some(3));

        let truncated = &encoded[..encoded.len() / 2];
        let err = decode(&key, truncated, true).unwrap_err();
        assert!(matches!(
            SnapcryptError::from_io(err),
            SnapcryptError::CorruptStream { .. }
        ));
    }
}
