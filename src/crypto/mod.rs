//! Cryptographic primitives for authentication and message signing.
//!
//! - **Secret hash**: SHA-256 of the shared secret, the only form in which
//!   the secret is kept after configuration is read
//! - **Challenge responses**: legacy (hash of secret hash and seed) and
//!   keyed (HMAC over both challenges under an identity-bound key)
//! - **Signing key**: HKDF-SHA256 from the secret hash, salted with the
//!   server challenge
//! - **Message signing**: HMAC-SHA256 over the sequence number and the
//!   frame, truncated to 16 bytes
//!
//! ```text
//! password ──SHA-256──► secret hash ──┬─ SHA-256(‖ seed) ─────────────► legacy response
//!                                     ├─ HMAC(user ‖ domain) ─► identity key
//!                                     │      └─ HMAC(server ‖ client) ► keyed response
//!                                     └─ HKDF(salt = server challenge) ► signing key
//! ```

mod keys;
mod response;
mod signing;

use thiserror::Error;

pub use keys::{random_challenge, random_guid, KeyMaterial};
pub use response::{identity_key, keyed_response, legacy_response, secret_hash, signing_key};
pub use signing::MessageSigner;

/// Output size of every response computation (SHA-256)
pub const RESPONSE_SIZE: usize = 32;

/// Size of derived signing keys
pub const SIGNING_KEY_SIZE: usize = 32;

/// Minimum accepted signing key size
pub const MIN_KEY_SIZE: usize = 16;

/// Errors from cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key is shorter than allowed
    #[error("Key too short: {len} bytes (minimum {min})")]
    KeyTooShort {
        /// Actual length
        len: usize,
        /// Required length
        min: usize,
    },

    /// Signature did not verify
    #[error("Signature verification failed")]
    VerificationFailed,

    /// HKDF could not produce the requested output
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CryptoError::KeyTooShort { len: 4, min: 16 };
        assert!(err.to_string().contains("4 bytes"));
        assert_eq!(
            CryptoError::VerificationFailed.to_string(),
            "Signature verification failed"
        );
    }
}
