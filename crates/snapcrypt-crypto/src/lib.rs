//! snapcrypt-crypto: data-key lifecycle and the encrypted blob codecs
//!
//! Key hierarchy:
//! ```text
//! age X25519 keypair (operator supplied, loaded once)
//!   └── Data Key (256-bit random, one per repository, stored age-wrapped)
//!       ├── AES-256-CTR keystream (fresh 128-bit IV per object or per frame)
//!       └── Frame hash key (HKDF-SHA256 from data key, domain="snapcrypt-frame-hash")
//! ```
//!
//! Write pipeline: plaintext → zstd (optional) → AES-256-CTR → sink
//!
//! Two framings share that pipeline:
//! - continuous: `[16-byte IV][enciphered body]`, one IV per object
//! - chunked: repeated `[u64 LE hash][16-byte IV][ciphertext]` frames, each
//!   independently decryptable and verified before any plaintext is released

pub mod chunk;
pub mod cipher;
pub mod codec;
pub mod keys;
pub mod stream;
pub mod wrap;

pub use chunk::{decode_chunked_all, encode_chunked, ChunkedDecoder, ChunkedEncoder};
pub use codec::{BlobCodec, CodecSettings};
pub use keys::{derive_frame_hash_key, generate_data_key, DataKey};
pub use stream::{StreamDecoder, StreamEncoder};
pub use wrap::{unwrap_key, wrap_key, Keypair};

/// Size of a data key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-CTR initial counter block
pub const IV_SIZE: usize = 16;

/// Size of the truncated frame hash
pub const HASH_SIZE: usize = 8;

/// `hash | iv` prefix of every chunked frame
pub const FRAME_HEADER_SIZE: usize = HASH_SIZE + IV_SIZE;
