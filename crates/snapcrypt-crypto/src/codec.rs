//! Mode-selecting façade over the continuous and chunked codecs

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;

use snapcrypt_core::config::{CodecConfig, CodecMode};
use snapcrypt_core::{SnapcryptError, SnapcryptResult};

use crate::chunk::{ChunkedDecoder, ChunkedEncoder};
use crate::keys::DataKey;
use crate::stream::{DecodeGuard, StreamDecoder, StreamEncoder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSettings {
    pub mode: CodecMode,
    /// Plaintext bytes per frame (chunked mode only)
    pub chunk_size: usize,
    /// zstd level, or `None` to store uncompressed
    pub compression_level: Option<i32>,
}

impl CodecSettings {
    /// Resolve settings from config; `backend_mode` applies unless the
    /// config forces a mode.
    pub fn from_config(codec: &CodecConfig, backend_mode: CodecMode) -> Self {
        Self {
            mode: codec.mode.unwrap_or(backend_mode),
            chunk_size: codec.chunk_size,
            compression_level: codec.compress.then_some(codec.compression_level),
        }
    }
}

/// Encodes and decodes blob bodies with a repository's shared data key.
#[derive(Debug, Clone)]
pub struct BlobCodec {
    key: Arc<DataKey>,
    settings: CodecSettings,
}

impl BlobCodec {
    pub fn new(key: Arc<DataKey>, settings: CodecSettings) -> Self {
        Self { key, settings }
    }

    pub fn settings(&self) -> &CodecSettings {
        &self.settings
    }

    /// Pipe `src` through compression and encryption into `sink`.
    ///
    /// Returns the sink and the number of plaintext bytes consumed.
    pub fn encode<W: Write>(&self, src: &mut dyn Read, sink: W) -> SnapcryptResult<(W, u64)> {
        self.encode_io(src, sink).map_err(SnapcryptError::from_io)
    }

    fn encode_io<W: Write>(&self, src: &mut dyn Read, sink: W) -> io::Result<(W, u64)> {
        match self.settings.mode {
            CodecMode::Continuous => {
                let mut encoder = StreamEncoder::new(sink, &self.key, self.settings.compression_level)?;
                let n = io::copy(src, &mut encoder)?;
                Ok((encoder.finish()?, n))
            }
            CodecMode::Chunked => {
                let framed = ChunkedEncoder::new(sink, &self.key, self.settings.chunk_size)
                    .map_err(SnapcryptError::into_io)?;
                match self.settings.compression_level {
                    Some(level) => {
                        // Empty bodies store zero bytes, with no zstd frame.
                        let mut src = BufReader::new(src);
                        if fill_or_retry(&mut src)?.is_empty() {
                            return Ok((framed.finish()?, 0));
                        }
                        let mut encoder = zstd::stream::write::Encoder::new(framed, level)?;
                        let n = io::copy(&mut src, &mut encoder)?;
                        let framed = encoder.finish()?;
                        Ok((framed.finish()?, n))
                    }
                    None => {
                        let mut framed = framed;
                        let n = io::copy(src, &mut framed)?;
                        Ok((framed.finish()?, n))
                    }
                }
            }
        }
    }

    /// Wrap `src` in the inverse pipeline. `path` labels decode errors.
    pub fn decoder<'a, R>(&self, path: &str, src: R) -> SnapcryptResult<Box<dyn Read + Send + 'a>>
    where
        R: Read + Send + 'a,
    {
        let compressed = self.settings.compression_level.is_some();
        match self.settings.mode {
            CodecMode::Continuous => {
                let decoder = StreamDecoder::new(src, &self.key, compressed, path)
                    .map_err(SnapcryptError::from_io)?;
                Ok(Box::new(decoder))
            }
            CodecMode::Chunked => {
                let framed = ChunkedDecoder::new(src, &self.key, self.settings.chunk_size, path)?;
                if compressed {
                    Ok(Box::new(FramedZstd::Pending(Some((
                        BufReader::new(framed),
                        path.to_string(),
                    )))))
                } else {
                    Ok(Box::new(framed))
                }
            }
        }
    }

    /// Decode `src` completely into memory.
    pub fn decode_all<R: Read + Send>(&self, path: &str, src: R) -> SnapcryptResult<Vec<u8>> {
        let mut decoder = self.decoder(path, src)?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(SnapcryptError::from_io)?;
        Ok(out)
    }
}

fn fill_or_retry<R: BufRead>(src: &mut R) -> io::Result<&[u8]> {
    loop {
        match src.fill_buf() {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    src.fill_buf()
}

/// zstd over chunked frames. The decompressor starts on the first
/// non-empty read; an empty body decodes to nothing.
enum FramedZstd<'a, R: Read> {
    Pending(Option<(BufReader<R>, String)>),
    Active(Box<dyn Read + Send + 'a>),
    Drained,
}

impl<'a, R: Read + Send + 'a> Read for FramedZstd<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self {
                Self::Active(decoder) => return decoder.read(buf),
                Self::Drained => return Ok(0),
                Self::Pending(slot) => {
                    let Some((frames, _)) = slot.as_mut() else {
                        return Ok(0);
                    };
                    if frames.fill_buf()?.is_empty() {
                        *self = Self::Drained;
                        return Ok(0);
                    }
                    let Some((frames, path)) = slot.take() else {
                        return Ok(0);
                    };
                    let decoder = zstd::stream::read::Decoder::with_buffer(frames)?;
                    *self = Self::Active(Box::new(DecodeGuard::new(decoder, path)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_data_key;
    use proptest::prelude::*;

    fn codec(mode: CodecMode, chunk_size: usize, compression_level: Option<i32>) -> BlobCodec {
        BlobCodec::new(
            Arc::new(generate_data_key()),
            CodecSettings {
                mode,
                chunk_size,
                compression_level,
            },
        )
    }

    fn roundtrip(codec: &BlobCodec, data: &[u8]) -> Vec<u8> {
        let mut src = data;
        let (encoded, n) = codec.encode(&mut src, Vec::new()).unwrap();
        assert_eq!(n, data.len() as u64);
        codec.decode_all("roundtrip", encoded.as_slice()).unwrap()
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = CodecConfig::default();
        let settings = CodecSettings::from_config(&config, CodecMode::Chunked);
        assert_eq!(settings.mode, CodecMode::Chunked);
        assert_eq!(settings.compression_level, Some(3));

        config.mode = Some(CodecMode::Continuous);
        config.compress = false;
        let settings = CodecSettings::from_config(&config, CodecMode::Chunked);
        assert_eq!(settings.mode, CodecMode::Continuous);
        assert_eq!(settings.compression_level, None);
    }

    #[test]
    fn test_all_modes_roundtrip_boundaries() {
        let chunk = 128;
        let sizes = [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk, 3 * chunk + 77];
        for mode in [CodecMode::Continuous, CodecMode::Chunked] {
            for level in [None, Some(1)] {
                let codec = codec(mode, chunk, level);
                for size in sizes {
                    let data: Vec<u8> = (0..size).map(|i| (i * 13 % 256) as u8).collect();
                    assert_eq!(
                        roundtrip(&codec, &data),
                        data,
                        "mode={mode:?} level={level:?} size={size}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_chunked_empty_body_stores_nothing() {
        for level in [None, Some(3)] {
            let codec = codec(CodecMode::Chunked, 64, level);
            let mut src: &[u8] = &[];
            let (encoded, n) = codec.encode(&mut src, Vec::new()).unwrap();
            assert_eq!(n, 0);
            assert!(encoded.is_empty(), "level={level:?} wrote {} bytes", encoded.len());
            assert!(codec.decode_all("empty", io::empty()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_chunked_compressed_tamper_is_integrity_error() {
        let codec = codec(CodecMode::Chunked, 64, Some(3));
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        let mut src = data.as_slice();
        let (mut encoded, _) = codec.encode(&mut src, Vec::new()).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x10;

        let err = codec.decode_all("seg", encoded.as_slice()).unwrap_err();
        assert!(matches!(err, SnapcryptError::Integrity { .. }));
    }

    #[test]
    fn test_continuous_garbage_is_corrupt() {
        let codec = codec(CodecMode::Continuous, 64, Some(3));
        let garbage = vec![0x33u8; 200];
        let err = codec.decode_all("seg", garbage.as_slice()).unwrap_err();
        assert!(matches!(err, SnapcryptError::CorruptStream { .. }));
    }

    proptest! {
        #[test]
        fn continuous_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            let codec = codec(CodecMode::Continuous, 256, Some(1));
            prop_assert_eq!(roundtrip(&codec, &data), data);
        }

        #[test]
        fn chunked_compressed_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..=4096),
            chunk in 16usize..=512,
        ) {
            let codec = codec(CodecMode::Chunked, chunk, Some(1));
            prop_assert_eq!(roundtrip(&codec, &data), data);
        }
    }
}
