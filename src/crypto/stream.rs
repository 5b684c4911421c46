//! Segmented AES-256-GCM stream.
//!
//! Wire format:
//! ```text
//! NONCE (12) | SEGMENT_0 | SEGMENT_1 | ... | SEGMENT_n
//! SEGMENT_i = AES-256-GCM(key, nonce_i, aad = [final flag], plaintext_i) || TAG (16)
//! nonce_i   = NONCE xor (0^8 || be32(i))
//! ```
//! Every plaintext segment is [`SEGMENT_LEN`] bytes except the last one, which
//! may be shorter (or empty) and is the only one sealed with the final flag
//! set. Truncating, reordering or extending the stream fails authentication.

use std::io::{self, Read, Write};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{AeadInPlace, KeyInit},
};
use tracing::debug;
use zeroize::Zeroizing;

use super::{BackupKey, NONCE_LEN, SEGMENT_LEN, TAG_LEN, generate_nonce};
use crate::error::CryptoError;

const SEALED_SEGMENT_LEN: usize = SEGMENT_LEN + TAG_LEN;

fn segment_nonce(base: &[u8; NONCE_LEN], counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (n, c) in nonce[NONCE_LEN - 4..].iter_mut().zip(counter.to_be_bytes()) {
        *n ^= c;
    }
    nonce
}

fn new_cipher(key: &BackupKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

fn auth_failure() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, CryptoError::Authentication)
}

/// Writes a fresh nonce to `raw` and returns a sink that encrypts everything
/// written to it.
///
/// Nothing is authenticated until [`EncryptingWriter::finish`] seals the
/// final segment; a writer dropped without finishing leaves a stream that
/// will not decrypt.
pub fn open_encrypting_sink<W: Write>(
    raw: W,
    key: &BackupKey,
) -> Result<([u8; NONCE_LEN], EncryptingWriter<W>), CryptoError> {
    let nonce = generate_nonce()?;
    let writer = EncryptingWriter::with_nonce(raw, key, nonce)?;
    Ok((nonce, writer))
}

/// Reads the nonce header from `raw` and returns a source that decrypts and
/// verifies every subsequent read.
///
/// # Errors
///
/// Returns [`CryptoError::TruncatedHeader`] if fewer than [`NONCE_LEN`] bytes
/// are available.
pub fn open_decrypting_source<R: Read>(
    mut raw: R,
    key: &BackupKey,
) -> Result<DecryptingReader<R>, CryptoError> {
    let mut header = Vec::with_capacity(NONCE_LEN);
    (&mut raw).take(NONCE_LEN as u64).read_to_end(&mut header)?;

    let nonce: [u8; NONCE_LEN] = header
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::TruncatedHeader)?;

    Ok(DecryptingReader {
        inner: raw,
        cipher: new_cipher(key),
        base_nonce: nonce,
        counter: 0,
        plaintext: Zeroizing::new(Vec::with_capacity(SEALED_SEGMENT_LEN + 1)),
        pos: 0,
        lookahead: None,
        finished: false,
        poisoned: false,
    })
}

/// Encrypting half of the stream cipher.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    counter: u32,
    buffer: Zeroizing<Vec<u8>>,
    poisoned: bool,
}

impl<W: Write> EncryptingWriter<W> {
    pub(crate) fn with_nonce(
        mut raw: W,
        key: &BackupKey,
        nonce: [u8; NONCE_LEN],
    ) -> Result<Self, CryptoError> {
        raw.write_all(&nonce)?;

        Ok(Self {
            inner: raw,
            cipher: new_cipher(key),
            base_nonce: nonce,
            counter: 0,
            buffer: Zeroizing::new(Vec::with_capacity(SEALED_SEGMENT_LEN)),
            poisoned: false,
        })
    }

    // A segment that failed to reach the sink cannot be resent under the
    // same nonce, so the writer refuses everything afterwards.
    fn ensure_usable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(CryptoError::StreamFailed));
        }
        Ok(())
    }

    fn seal_segment(&mut self, last: bool) -> io::Result<()> {
        let result = self.try_seal_segment(last);
        if result.is_err() {
            self.buffer.clear();
            self.poisoned = true;
        }
        result
    }

    fn try_seal_segment(&mut self, last: bool) -> io::Result<()> {
        let nonce = segment_nonce(&self.base_nonce, self.counter);
        self.cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), &[last as u8], &mut *self.buffer)
            .map_err(|_| io::Error::other(CryptoError::Encryption))?;

        self.inner.write_all(&self.buffer)?;
        self.buffer.clear();

        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other(CryptoError::SegmentOverflow))?;
        Ok(())
    }

    /// Seals the final segment and hands back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.ensure_usable()?;
        self.seal_segment(true)?;
        self.inner.flush()?;
        debug!(segments = self.counter, "sealed encrypted stream");

        let Self { inner, .. } = self;
        Ok(inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.ensure_usable()?;
        if data.is_empty() {
            return Ok(0);
        }
        // A full buffer is only sealed once more data shows up, so that
        // finish() can always mark the last segment.
        if self.buffer.len() == SEGMENT_LEN {
            self.seal_segment(false)?;
        }

        let n = (SEGMENT_LEN - self.buffer.len()).min(data.len());
        self.buffer.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting half of the stream cipher.
pub struct DecryptingReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    counter: u32,
    plaintext: Zeroizing<Vec<u8>>,
    pos: usize,
    lookahead: Option<u8>,
    finished: bool,
    poisoned: bool,
}

impl<R: Read> DecryptingReader<R> {
    fn probe_eof(&mut self) -> io::Result<bool> {
        let mut probe = [0u8; 1];
        loop {
            match self.inner.read(&mut probe) {
                Ok(0) => return Ok(true),
                Ok(_) => {
                    self.lookahead = Some(probe[0]);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn open_segment(&mut self) -> io::Result<()> {
        self.plaintext.clear();
        self.pos = 0;

        if let Some(byte) = self.lookahead.take() {
            self.plaintext.push(byte);
        }
        let want = (SEALED_SEGMENT_LEN - self.plaintext.len()) as u64;
        (&mut self.inner)
            .take(want)
            .read_to_end(&mut *self.plaintext)?;

        let last = self.plaintext.len() < SEALED_SEGMENT_LEN || self.probe_eof()?;

        if self.plaintext.len() < TAG_LEN {
            return Err(auth_failure());
        }

        let nonce = segment_nonce(&self.base_nonce, self.counter);
        self.cipher
            .decrypt_in_place(Nonce::from_slice(&nonce), &[last as u8], &mut *self.plaintext)
            .map_err(|_| auth_failure())?;

        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other(CryptoError::SegmentOverflow))?;
        self.finished = last;
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.poisoned {
            return Err(auth_failure());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos == self.plaintext.len() {
            if self.finished {
                return Ok(0);
            }
            if let Err(e) = self.open_segment() {
                self.plaintext.clear();
                self.pos = 0;
                self.poisoned = true;
                return Err(e);
            }
        }

        let available = &self.plaintext[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}
