//! AES-256-CTR adapters over `std::io` readers and writers
//!
//! CTR mode keeps ciphertext length equal to plaintext length, so both
//! adapters are byte-for-byte transparent apart from the keystream.

use std::io::{self, Read, Write};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

use snapcrypt_core::SnapcryptError;

use crate::keys::DataKey;
use crate::IV_SIZE;

pub(crate) type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Generate a random 128-bit IV.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

pub(crate) fn new_cipher(key: &DataKey, iv: &[u8; IV_SIZE]) -> Aes256Ctr {
    Aes256Ctr::new(key.as_bytes().into(), iv.into())
}

/// Apply the keystream for `(key, iv)` to `buf` in place.
pub fn apply_keystream(key: &DataKey, iv: &[u8; IV_SIZE], buf: &mut [u8]) {
    new_cipher(key, iv).apply_keystream(buf);
}

/// Mark an error from the underlying transport so decode layers above do not
/// mistake it for corrupt data.
pub(crate) fn tag_transport(err: io::Error) -> io::Error {
    if SnapcryptError::is_typed(&err) {
        err
    } else {
        SnapcryptError::Io(err).into_io()
    }
}

/// Enciphers everything written through it.
pub struct CipherWriter<W: Write> {
    inner: W,
    cipher: Aes256Ctr,
    scratch: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, key: &DataKey, iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner,
            cipher: new_cipher(key, iv),
            scratch: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply_keystream(&mut self.scratch);
        // the keystream has advanced, so the whole buffer must land
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Deciphers everything read through it.
pub struct CipherReader<R: Read> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, key: &DataKey, iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner,
            cipher: new_cipher(key, iv),
        }
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).map_err(tag_transport)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}
