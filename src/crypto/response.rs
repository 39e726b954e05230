//! Challenge responses and session key derivation.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{CryptoError, KeyMaterial, RESPONSE_SIZE, SIGNING_KEY_SIZE};
use crate::protocol::CHALLENGE_SIZE;

type HmacSha256 = Hmac<Sha256>;

const SIGNING_KEY_INFO: &[u8] = b"cifs-core signing key";

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; RESPONSE_SIZE], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::DerivationFailed(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; RESPONSE_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Hash of the shared secret.
pub fn secret_hash(password: &str) -> KeyMaterial {
    KeyMaterial::new(Sha256::digest(password.as_bytes()).to_vec())
}

/// Response for the legacy path: hash of the secret hash and the seed.
pub fn legacy_response(secret: &KeyMaterial, challenge: &[u8; CHALLENGE_SIZE]) -> [u8; RESPONSE_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(challenge);
    let mut out = [0u8; RESPONSE_SIZE];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Key binding the secret to an account. The user name is case-insensitive.
pub fn identity_key(
    secret: &KeyMaterial,
    username: &str,
    domain: &str,
) -> Result<KeyMaterial, CryptoError> {
    let user = username.to_uppercase();
    let tag = hmac(secret.as_bytes(), &[user.as_bytes(), domain.as_bytes()])?;
    Ok(KeyMaterial::new(tag.to_vec()))
}

/// Response for the keyed path, mixing both challenges.
pub fn keyed_response(
    identity: &KeyMaterial,
    server_challenge: &[u8; CHALLENGE_SIZE],
    client_challenge: &[u8; CHALLENGE_SIZE],
) -> Result<[u8; RESPONSE_SIZE], CryptoError> {
    hmac(identity.as_bytes(), &[server_challenge, client_challenge])
}

/// Per-session signing key.
pub fn signing_key(
    secret: &KeyMaterial,
    server_challenge: &[u8; CHALLENGE_SIZE],
) -> Result<KeyMaterial, CryptoError> {
    secret.derive(server_challenge, SIGNING_KEY_INFO, SIGNING_KEY_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_hash_is_sha256() {
        let hash = secret_hash("abc");
        // SHA-256("abc")
        assert_eq!(hash.as_bytes()[..4], [0xba, 0x78, 0x16, 0xbf]);
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn test_legacy_response_depends_on_challenge() {
        let secret = secret_hash("pw");
        let a = legacy_response(&secret, &[1; CHALLENGE_SIZE]);
        let b = legacy_response(&secret, &[2; CHALLENGE_SIZE]);
        assert_ne!(a, b);
        assert_eq!(a, legacy_response(&secret, &[1; CHALLENGE_SIZE]));
    }

    #[test]
    fn test_identity_key_ignores_user_case() {
        let secret = secret_hash("pw");
        let a = identity_key(&secret, "Alice", "CORP").unwrap();
        let b = identity_key(&secret, "ALICE", "CORP").unwrap();
        assert_eq!(a, b);
        let c = identity_key(&secret, "alice", "OTHER").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_keyed_response_uses_client_challenge() {
        let id = identity_key(&secret_hash("pw"), "alice", "").unwrap();
        let server = [7u8; CHALLENGE_SIZE];
        let a = keyed_response(&id, &server, &[1; CHALLENGE_SIZE]).unwrap();
        let b = keyed_response(&id, &server, &[2; CHALLENGE_SIZE]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_signing_key_per_challenge() {
        let secret = secret_hash("pw");
        let a = signing_key(&secret, &[1; CHALLENGE_SIZE]).unwrap();
        let b = signing_key(&secret, &[2; CHALLENGE_SIZE]).unwrap();
        assert_eq!(a.len(), SIGNING_KEY_SIZE);
        assert_ne!(a, b);
    }
}
