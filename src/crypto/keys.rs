//! Secret key material.

use std::fmt;

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;
use crate::protocol::{CHALLENGE_SIZE, GUID_SIZE};

/// Key material (secret bytes), wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Create new key material from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Derive a new key using HKDF-SHA256
    pub fn derive(
        &self,
        salt: &[u8],
        info: &[u8],
        output_len: usize,
    ) -> Result<KeyMaterial, CryptoError> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), &self.bytes);
        let mut okm = vec![0u8; output_len];

        hk.expand(info, &mut okm)
            .map_err(|e| CryptoError::DerivationFailed(format!("HKDF expand failed: {}", e)))?;

        Ok(KeyMaterial::new(okm))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED, {} bytes])", self.bytes.len())
    }
}

/// Fresh random challenge seed.
pub fn random_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut seed = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

/// Fresh random client/server identifier.
pub fn random_guid() -> [u8; GUID_SIZE] {
    let mut guid = [0u8; GUID_SIZE];
    rand::thread_rng().fill_bytes(&mut guid);
    guid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_material_debug_redacted() {
        let key = KeyMaterial::new(vec![0x42; 32]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }

    #[test]
    fn test_derive_deterministic() {
        let key = KeyMaterial::new(vec![1u8; 32]);
        let a = key.derive(b"salt", b"info", 32).unwrap();
        let b = key.derive(b"salt", b"info", 32).unwrap();
        assert_eq!(a, b);

        let other_salt = key.derive(b"pepper", b"info", 32).unwrap();
        assert_ne!(a, other_salt);
    }

    #[test]
    fn test_derive_exceeds_max_length() {
        // HKDF-SHA256 caps output at 255 * 32 bytes
        let key = KeyMaterial::new(vec![1u8; 32]);
        assert!(key.derive(b"", b"", 255 * 32 + 1).is_err());
    }

    #[test]
    fn test_random_challenges_differ() {
        assert_ne!(random_challenge(), random_challenge());
        assert_ne!(random_guid(), random_guid());
    }
}
