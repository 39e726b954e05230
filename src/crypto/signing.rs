//! HMAC-SHA256 frame signing.
//!
//! The signature covers the little-endian sequence number followed by the
//! signable image of the frame (see [`crate::protocol::signable`]) and is
//! truncated to [`SIGNATURE_SIZE`] bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{CryptoError, KeyMaterial, MIN_KEY_SIZE};
use crate::protocol::SIGNATURE_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies frames with a session key
#[derive(Clone)]
pub struct MessageSigner {
    mac: HmacSha256,
}

impl MessageSigner {
    /// Create a signer; keys under 16 bytes are rejected
    pub fn new(key: &KeyMaterial) -> Result<Self, CryptoError> {
        if key.len() < MIN_KEY_SIZE {
            return Err(CryptoError::KeyTooShort {
                len: key.len(),
                min: MIN_KEY_SIZE,
            });
        }
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::DerivationFailed(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Compute the signature of `data` at sequence number `seq`
    pub fn sign(&self, seq: u64, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let mut mac = self.mac.clone();
        mac.update(&seq.to_le_bytes());
        mac.update(data);
        let full = mac.finalize().into_bytes();

        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(&full[..SIGNATURE_SIZE]);
        sig
    }

    /// Check a received signature in constant time
    pub fn verify(&self, seq: u64, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let mut mac = self.mac.clone();
        mac.update(&seq.to_le_bytes());
        mac.update(data);
        mac.verify_truncated_left(signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageSigner([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> MessageSigner {
        MessageSigner::new(&KeyMaterial::new(vec![0x42; 32])).unwrap()
    }

    #[test]
    fn test_sign_verify() {
        let s = signer();
        let sig = s.sign(4, b"frame bytes");
        assert!(s.verify(4, b"frame bytes", &sig).is_ok());
    }

    #[test]
    fn test_sequence_is_bound() {
        let s = signer();
        let sig = s.sign(4, b"frame bytes");
        assert!(matches!(
            s.verify(5, b"frame bytes", &sig),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn test_tampered_data_fails() {
        let s = signer();
        let sig = s.sign(0, b"frame bytes");
        assert!(s.verify(0, b"frame bytez", &sig).is_err());
    }

    #[test]
    fn test_different_keys() {
        let other = MessageSigner::new(&KeyMaterial::new(vec![0x43; 32])).unwrap();
        let sig = signer().sign(0, b"data");
        assert!(other.verify(0, b"data", &sig).is_err());
    }

    #[test]
    fn test_short_key_rejected() {
        let result = MessageSigner::new(&KeyMaterial::new(vec![1; 8]));
        assert!(matches!(
            result,
            Err(CryptoError::KeyTooShort { len: 8, min: 16 })
        ));
    }
}
