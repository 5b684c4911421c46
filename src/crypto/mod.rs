//! Cryptographic primitives for backups.
//!
//! Provides password based key derivation and the segmented AEAD stream
//! that wraps the archive.

pub mod kdf;
pub mod stream;

use getrandom::fill;

pub use kdf::{BackupKey, derive_key};
pub use stream::{DecryptingReader, EncryptingWriter, open_decrypting_source, open_encrypting_sink};

use crate::error::CryptoError;

/// Length of the stream nonce written in front of the ciphertext (96 bits).
pub const NONCE_LEN: usize = 12;
/// Length of the encryption key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;
/// Length of the GCM authentication tag appended to every segment.
pub const TAG_LEN: usize = 16;
/// Plaintext bytes sealed per segment.
pub const SEGMENT_LEN: usize = 64 * 1024;
/// PBKDF2-HMAC-SHA256 rounds.
pub const PBKDF2_ITERATIONS: u32 = 65_536;
/// Salt shared by every backup. See DESIGN.md before changing it: existing
/// backups become unreadable.
pub const BACKUP_SALT: &[u8] = b"SecureNotesBackupSalt";

/// Fill buffer with cryptographically secure random bytes
pub(crate) fn secure_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a fresh stream nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    secure_random(&mut nonce)?;
    Ok(nonce)
}
