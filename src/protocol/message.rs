//! Payload layouts for the session-level commands.
//!
//! Each request/response pair encodes to the bytes that follow the fixed
//! header. Ids the server assigns (session id, tree id) travel in the header,
//! not here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::capabilities::{CapabilityFlags, Capabilities, SecurityMode};
use crate::error::{CifsError, Result};

/// Size of the server challenge seed
pub const CHALLENGE_SIZE: usize = 8;

/// Size of client/server GUIDs
pub const GUID_SIZE: usize = 16;

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(CifsError::InvalidMessage(format!(
            "{what} truncated: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut impl Buf, what: &str) -> Result<String> {
    need(buf, 2, what)?;
    let len = usize::from(buf.get_u16_le());
    need(buf, len, what)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| CifsError::InvalidMessage(format!("{what} is not UTF-8")))
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

fn get_bytes(buf: &mut impl Buf, what: &str) -> Result<Bytes> {
    need(buf, 2, what)?;
    let len = usize::from(buf.get_u16_le());
    need(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

/// Negotiate request: the client's offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateRequest {
    /// Offered capabilities
    pub capabilities: Capabilities,
    /// Random per-client identifier
    pub client_guid: [u8; GUID_SIZE],
}

impl NegotiateRequest {
    /// Encode to payload bytes
    pub fn encode(&self) -> Bytes {
        let caps = &self.capabilities;
        let mut buf = BytesMut::new();
        buf.put_u16_le(caps.dialects.len() as u16);
        for dialect in &caps.dialects {
            buf.put_u16_le(*dialect);
        }
        buf.put_u32_le(caps.flags.bits());
        buf.put_u8(caps.security.as_byte());
        buf.put_u32_le(caps.max_frame_size);
        buf.put_u16_le(caps.max_in_flight);
        buf.put_slice(&self.client_guid);
        buf.freeze()
    }

    /// Decode from payload bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 2, "negotiate request")?;
        let count = usize::from(buf.get_u16_le());
        need(&buf, count * 2 + 4 + 1 + 4 + 2 + GUID_SIZE, "negotiate request")?;
        let dialects = (0..count).map(|_| buf.get_u16_le()).collect();
        let flags = CapabilityFlags::from_bits(buf.get_u32_le());
        let security = SecurityMode::from_byte(buf.get_u8());
        let max_frame_size = buf.get_u32_le();
        let max_in_flight = buf.get_u16_le();
        let mut client_guid = [0u8; GUID_SIZE];
        buf.copy_to_slice(&mut client_guid);

        Ok(Self {
            capabilities: Capabilities {
                dialects,
                flags,
                security,
                max_frame_size,
                max_in_flight,
            },
            client_guid,
        })
    }
}

/// Negotiate response: what the server picked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    /// Chosen dialect
    pub dialect: u16,
    /// Server capability bits
    pub flags: CapabilityFlags,
    /// Server signing policy
    pub security: SecurityMode,
    /// Largest frame the server accepts
    pub max_frame_size: u32,
    /// Requests the server allows in flight
    pub max_in_flight: u16,
    /// Server identifier
    pub server_guid: [u8; GUID_SIZE],
    /// Per-connection challenge seed, used by the legacy response
    pub challenge: [u8; CHALLENGE_SIZE],
}

impl NegotiateResponse {
    /// The server's side of the negotiation as a capability set.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            dialects: vec![self.dialect],
            flags: self.flags,
            security: self.security,
            max_frame_size: self.max_frame_size,
            max_in_flight: self.max_in_flight,
        }
    }

    /// Encode to payload bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(self.dialect);
        buf.put_u32_le(self.flags.bits());
        buf.put_u8(self.security.as_byte());
        buf.put_u32_le(self.max_frame_size);
        buf.put_u16_le(self.max_in_flight);
        buf.put_slice(&self.server_guid);
        buf.put_slice(&self.challenge);
        buf.freeze()
    }

    /// Decode from payload bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 2 + 4 + 1 + 4 + 2 + GUID_SIZE + CHALLENGE_SIZE, "negotiate response")?;
        let dialect = buf.get_u16_le();
        let flags = CapabilityFlags::from_bits(buf.get_u32_le());
        let security = SecurityMode::from_byte(buf.get_u8());
        let max_frame_size = buf.get_u32_le();
        let max_in_flight = buf.get_u16_le();
        let mut server_guid = [0u8; GUID_SIZE];
        buf.copy_to_slice(&mut server_guid);
        let mut challenge = [0u8; CHALLENGE_SIZE];
        buf.copy_to_slice(&mut challenge);

        Ok(Self {
            dialect,
            flags,
            security,
            max_frame_size,
            max_in_flight,
            server_guid,
            challenge,
        })
    }
}

/// Session setup request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSetupRequest {
    /// Single-leg logon with the response computed from the negotiate seed
    Legacy {
        /// Account name
        username: String,
        /// Account domain
        domain: String,
        /// Hash of the secret and the connection challenge
        response: Bytes,
    },
    /// One leg of the blob exchange
    Blob(Bytes),
}

impl SessionSetupRequest {
    const LEGACY: u8 = 0;
    const BLOB: u8 = 1;

    /// Encode to payload bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            SessionSetupRequest::Legacy {
                username,
                domain,
                response,
            } => {
                buf.put_u8(Self::LEGACY);
                put_string(&mut buf, username);
                put_string(&mut buf, domain);
                put_bytes(&mut buf, response);
            },
            SessionSetupRequest::Blob(blob) => {
                buf.put_u8(Self::BLOB);
                put_bytes(&mut buf, blob);
            },
        }
        buf.freeze()
    }

    /// Decode from payload bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 1, "session setup request")?;
        match buf.get_u8() {
            Self::LEGACY => Ok(SessionSetupRequest::Legacy {
                username: get_string(&mut buf, "username")?,
                domain: get_string(&mut buf, "domain")?,
                response: get_bytes(&mut buf, "legacy response")?,
            }),
            Self::BLOB => Ok(SessionSetupRequest::Blob(get_bytes(
                &mut buf,
                "security blob",
            )?)),
            other => Err(CifsError::InvalidMessage(format!(
                "Unknown session setup mode {other}"
            ))),
        }
    }
}

/// Session setup response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSetupResponse {
    /// Logged on as guest
    pub guest: bool,
    /// Server blob (challenge leg), empty otherwise
    pub blob: Bytes,
}

impl SessionSetupResponse {
    /// Encode to payload bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(u8::from(self.guest));
        put_bytes(&mut buf, &self.blob);
        buf.freeze()
    }

    /// Decode from payload bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 1, "session setup response")?;
        let guest = buf.get_u8() != 0;
        let blob = get_bytes(&mut buf, "security blob")?;
        Ok(Self { guest, blob })
    }
}

/// Tree connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConnectRequest {
    /// UNC path, `\\host\share`
    pub path: String,
}

impl TreeConnectRequest {
    /// Encode to payload bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.path);
        buf.freeze()
    }

    /// Decode from payload bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(Self {
            path: get_string(&mut buf, "share path")?,
        })
    }
}

/// Tree connect response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeConnectResponse {
    /// Share type (disk, pipe, printer)
    pub share_type: u8,
    /// Access mask granted on the share
    pub maximal_access: u32,
}

impl TreeConnectResponse {
    /// Encode to payload bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.share_type);
        buf.put_u32_le(self.maximal_access);
        buf.freeze()
    }

    /// Decode from payload bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 5, "tree connect response")?;
        Ok(Self {
            share_type: buf.get_u8(),
            maximal_access: buf.get_u32_le(),
        })
    }
}

/// Unsolicited oplock break notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplockBreak {
    /// File the break applies to
    pub file_id: u64,
    /// Level the client must drop to
    pub new_level: u8,
}

impl OplockBreak {
    /// Encode to payload bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.file_id);
        buf.put_u8(self.new_level);
        buf.freeze()
    }

    /// Decode from payload bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 9, "oplock break")?;
        Ok(Self {
            file_id: buf.get_u64_le(),
            new_level: buf.get_u8(),
        })
    }
}
