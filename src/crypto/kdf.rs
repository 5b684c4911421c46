use std::fmt;

use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::Sha256;
use zeroize::Zeroize;

use super::{BACKUP_SALT, KEY_LEN, PBKDF2_ITERATIONS};
use crate::error::CryptoError;

/// Symmetric key for one export or import. Wiped when dropped.
pub struct BackupKey {
    bytes: [u8; KEY_LEN],
}

impl BackupKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupKey(..)")
    }
}

/// Derive the backup key from a password.
///
/// Deterministic: PBKDF2-HMAC-SHA256 over the fixed [`BACKUP_SALT`] with
/// [`PBKDF2_ITERATIONS`] rounds, so the same password reproduces the key at
/// import time without anything stored next to the backup.
pub fn derive_key(password: &str) -> Result<BackupKey, CryptoError> {
    derive_key_with(password, BACKUP_SALT, PBKDF2_ITERATIONS)
}

fn derive_key_with(password: &str, salt: &[u8], rounds: u32) -> Result<BackupKey, CryptoError> {
    if rounds == 0 {
        return Err(CryptoError::KeyDerivation(
            "PBKDF2 rounds must be >= 1".into(),
        ));
    }

    let mut key = BackupKey {
        bytes: [0u8; KEY_LEN],
    };
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, rounds, &mut key.bytes)
        .map_err(|e| CryptoError::KeyDerivation(format!("PBKDF2 failed: {e}")))?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_is_deterministic() {
        let k1 = derive_key("password").unwrap();
        let k2 = derive_key("password").unwrap();

        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn different_passwords_give_different_keys() {
        let k1 = derive_key("correct").unwrap();
        let k2 = derive_key("wrong").unwrap();

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn matches_pbkdf2_sha256_reference_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256 ("passwd", "salt", c = 1).
        let key = derive_key_with("passwd", b"salt", 1).unwrap();
        assert_eq!(
            &key.as_bytes()[..16],
            &[
                0x55, 0xac, 0x04, 0x6e, 0x56, 0xe3, 0x08, 0x9f, 0xec, 0x16, 0x91, 0xc2, 0x25, 0x44,
                0xb6, 0x05
            ]
        );
    }

    #[test]
    fn zero_rounds_fail_gracefully() {
        assert!(matches!(
            derive_key_with("pw", BACKUP_SALT, 0),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_key() {
        let key = derive_key("pw").unwrap();
        assert_eq!(format!("{key:?}"), "BackupKey(..)");
    }
}
