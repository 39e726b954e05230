//! Security blobs carried inside session setup.
//!
//! Three messages make up the extended exchange:
//!
//! ```text
//! Client                                Server
//!   |--- SessionSetup(NegotiateBlob) ---->|
//!   |<-- MoreProcessing(ChallengeBlob) ---|   server challenge, session id
//!   |--- SessionSetup(AuthenticateBlob) ->|   response over the challenge
//!   |<-- Success -------------------------|
//! ```
//!
//! All blobs start with the same 16 bytes: an 8-byte signature, a 4-byte
//! message type and 4 bytes of flags. Everything after is type specific.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::{get_string, put_string, CHALLENGE_SIZE};
use crate::error::{CifsError, Result};

/// Blob signature
pub const BLOB_SIGNATURE: [u8; 8] = *b"CIFSSSP\0";

/// Blob flags
pub mod blob_flags {
    /// Client asks for (or server grants) the keyed response variant
    pub const KEYED: u32 = 1 << 0;
    /// Identity strings are present
    pub const IDENTITY: u32 = 1 << 1;
}

const TYPE_NEGOTIATE: u32 = 1;
const TYPE_CHALLENGE: u32 = 2;
const TYPE_AUTHENTICATE: u32 = 3;

const PREAMBLE_SIZE: usize = 16;

fn put_preamble(buf: &mut BytesMut, kind: u32, flags: u32) {
    buf.put_slice(&BLOB_SIGNATURE);
    buf.put_u32_le(kind);
    buf.put_u32_le(flags);
}

fn take_preamble(buf: &mut Bytes, expected: u32) -> Result<u32> {
    if buf.len() < PREAMBLE_SIZE || buf[..8] != BLOB_SIGNATURE {
        return Err(CifsError::InvalidMessage(
            "Security blob signature missing".to_string(),
        ));
    }
    buf.advance(8);
    let kind = buf.get_u32_le();
    if kind != expected {
        return Err(CifsError::InvalidMessage(format!(
            "Expected security blob type {expected}, got {kind}"
        )));
    }
    Ok(buf.get_u32_le())
}

/// Read the message type of any blob.
pub fn blob_type(blob: &[u8]) -> Option<u32> {
    if blob.len() < PREAMBLE_SIZE || blob[..8] != BLOB_SIGNATURE {
        return None;
    }
    Some(u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]))
}

/// First client leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateBlob {
    /// Requested features
    pub flags: u32,
    /// Client host name
    pub workstation: String,
    /// Client domain
    pub domain: String,
}

impl NegotiateBlob {
    /// Message type on the wire
    pub const TYPE: u32 = TYPE_NEGOTIATE;

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_preamble(&mut buf, Self::TYPE, self.flags);
        put_string(&mut buf, &self.workstation);
        put_string(&mut buf, &self.domain);
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let flags = take_preamble(&mut buf, Self::TYPE)?;
        Ok(Self {
            flags,
            workstation: get_string(&mut buf, "workstation")?,
            domain: get_string(&mut buf, "domain")?,
        })
    }
}

/// Server leg carrying the random challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeBlob {
    /// Granted features
    pub flags: u32,
    /// Fixed-size random seed
    pub server_challenge: [u8; CHALLENGE_SIZE],
    /// Server's name for itself
    pub target_name: String,
}

impl ChallengeBlob {
    /// Message type on the wire
    pub const TYPE: u32 = TYPE_CHALLENGE;

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_preamble(&mut buf, Self::TYPE, self.flags);
        buf.put_slice(&self.server_challenge);
        put_string(&mut buf, &self.target_name);
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let flags = take_preamble(&mut buf, Self::TYPE)?;
        if buf.remaining() < CHALLENGE_SIZE {
            return Err(CifsError::InvalidMessage(
                "Challenge blob truncated".to_string(),
            ));
        }
        let mut server_challenge = [0u8; CHALLENGE_SIZE];
        buf.copy_to_slice(&mut server_challenge);
        Ok(Self {
            flags,
            server_challenge,
            target_name: get_string(&mut buf, "target name")?,
        })
    }

    /// Server agreed to the keyed variant
    pub fn keyed(&self) -> bool {
        self.flags & blob_flags::KEYED != 0
    }
}

/// Final client leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateBlob {
    /// Features in use
    pub flags: u32,
    /// Computed response
    pub response: Bytes,
    /// Client nonce mixed into the keyed response
    pub client_challenge: [u8; CHALLENGE_SIZE],
    /// Account domain
    pub domain: String,
    /// Account name
    pub username: String,
    /// Client host name
    pub workstation: String,
}

impl AuthenticateBlob {
    /// Message type on the wire
    pub const TYPE: u32 = TYPE_AUTHENTICATE;

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_preamble(&mut buf, Self::TYPE, self.flags);
        buf.put_slice(&self.client_challenge);
        buf.put_u16_le(self.response.len() as u16);
        buf.put_slice(&self.response);
        put_string(&mut buf, &self.domain);
        put_string(&mut buf, &self.username);
        put_string(&mut buf, &self.workstation);
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let flags = take_preamble(&mut buf, Self::TYPE)?;
        if buf.remaining() < CHALLENGE_SIZE + 2 {
            return Err(CifsError::InvalidMessage(
                "Authenticate blob truncated".to_string(),
            ));
        }
        let mut client_challenge = [0u8; CHALLENGE_SIZE];
        buf.copy_to_slice(&mut client_challenge);
        let len = usize::from(buf.get_u16_le());
        if buf.remaining() < len {
            return Err(CifsError::InvalidMessage(
                "Authenticate response truncated".to_string(),
            ));
        }
        let response = buf.copy_to_bytes(len);
        Ok(Self {
            flags,
            response,
            client_challenge,
            domain: get_string(&mut buf, "domain")?,
            username: get_string(&mut buf, "username")?,
            workstation: get_string(&mut buf, "workstation")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_blob_roundtrip() {
        let blob = ChallengeBlob {
            flags: blob_flags::KEYED,
            server_challenge: [0x5A; CHALLENGE_SIZE],
            target_name: "FILESRV".to_string(),
        };
        let encoded = blob.encode();
        assert_eq!(blob_type(&encoded), Some(ChallengeBlob::TYPE));

        let decoded = ChallengeBlob::decode(encoded).unwrap();
        assert!(decoded.keyed());
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_authenticate_blob_roundtrip() {
        let blob = AuthenticateBlob {
            flags: blob_flags::KEYED | blob_flags::IDENTITY,
            response: Bytes::from(vec![0xAA; 32]),
            client_challenge: [3u8; CHALLENGE_SIZE],
            domain: "CORP".to_string(),
            username: "bob".to_string(),
            workstation: "laptop".to_string(),
        };
        assert_eq!(AuthenticateBlob::decode(blob.encode()).unwrap(), blob);
    }

    #[test]
    fn test_wrong_blob_type() {
        let negotiate = NegotiateBlob {
            flags: 0,
            workstation: "ws".to_string(),
            domain: String::new(),
        }
        .encode();
        assert!(ChallengeBlob::decode(negotiate.clone()).is_err());
        assert!(NegotiateBlob::decode(negotiate).is_ok());
        assert_eq!(blob_type(b"not a blob"), None);
    }
}
