//! Frame layout for the session wire format.
//!
//! Every frame is a 4-byte length prefix followed by a body:
//!
//! ```text
//! prefix: | kind:1 | length:3 (big endian) |
//!
//! body:   | magic:4 | command:2 | flags:2 | status:4 | tag:8 | session_id:8 |
//!         | tree_id:4 | credits:2 | reserved:2 | checksum:4 | signature:16 |
//!         | payload ... |
//! ```
//!
//! Body fields are little endian. The checksum is a CRC-32 over the whole body
//! with the checksum field zeroed. The signature covers the body with both
//! checksum and signature zeroed, so a frame is signed first and sealed last.

#![allow(missing_docs)]

use bytes::{BufMut, Bytes, BytesMut};

use super::command::{Command, Status};
use crate::error::{CifsError, Result};

/// Length prefix size in bytes
pub const PREFIX_SIZE: usize = 4;

/// Fixed body header size in bytes
pub const HEADER_SIZE: usize = 56;

/// Largest length a 24-bit prefix can express
pub const MAX_PREFIX_LENGTH: usize = 0x00FF_FFFF;

/// Body magic
pub const PROTOCOL_MAGIC: [u8; 4] = [0xFE, b'C', b'S', b'F'];

/// Tag used by server-initiated frames that answer no request
pub const NOTIFICATION_TAG: u64 = u64::MAX;

/// Truncated HMAC signature size
pub const SIGNATURE_SIZE: usize = 16;

const TAG_OFFSET: usize = 12;
const CHECKSUM_OFFSET: usize = 36;
const SIGNATURE_OFFSET: usize = 40;

/// Kind byte of the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Regular session message
    Session = 0x00,
    /// Keepalive, carries no body
    Keepalive = 0x85,
}

impl FrameKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(FrameKind::Session),
            0x85 => Some(FrameKind::Keepalive),
            _ => None,
        }
    }
}

/// Decoded length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// Keepalive with the given (ignored) body length
    Keepalive(usize),
    /// Session message with the given body length
    Session(usize),
}

impl Prefix {
    /// Parse the 4 prefix bytes.
    pub fn parse(bytes: [u8; PREFIX_SIZE]) -> Result<Self> {
        let len = (usize::from(bytes[1]) << 16) | (usize::from(bytes[2]) << 8) | usize::from(bytes[3]);
        match FrameKind::from_byte(bytes[0]) {
            Some(FrameKind::Session) => Ok(Prefix::Session(len)),
            Some(FrameKind::Keepalive) => Ok(Prefix::Keepalive(len)),
            None => Err(CifsError::Protocol(format!(
                "Unknown frame kind 0x{:02X}",
                bytes[0]
            ))),
        }
    }

    /// Encode a session message prefix.
    ///
    /// Fails when `len` does not fit in 24 bits.
    pub fn session(len: usize) -> Result<[u8; PREFIX_SIZE]> {
        if len > MAX_PREFIX_LENGTH {
            return Err(CifsError::InvalidMessage(format!(
                "Body of {len} bytes exceeds prefix limit {MAX_PREFIX_LENGTH}"
            )));
        }
        let mut bytes = (len as u32).to_be_bytes();
        bytes[0] = FrameKind::Session as u8;
        Ok(bytes)
    }

    /// Encode a keepalive prefix.
    pub fn keepalive() -> [u8; PREFIX_SIZE] {
        [FrameKind::Keepalive as u8, 0, 0, 0]
    }
}

/// Reject a declared body length outside `[HEADER_SIZE, max_frame_size]`.
pub fn validate_length(len: usize, max_frame_size: usize) -> Result<()> {
    if len < HEADER_SIZE {
        return Err(CifsError::Protocol(format!(
            "Frame length {} below header size {}",
            len, HEADER_SIZE
        )));
    }
    if len > max_frame_size {
        return Err(CifsError::Protocol(format!(
            "Frame length {} exceeds negotiated maximum {}",
            len, max_frame_size
        )));
    }
    Ok(())
}

/// Header flags (16 bits)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags(u16);

impl HeaderFlags {
    /// Frame travels server → client
    pub const RESPONSE: u16 = 1 << 0;
    /// Interim or asynchronous response
    pub const ASYNC: u16 = 1 << 1;
    /// Signature field is populated
    pub const SIGNED: u16 = 1 << 3;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    pub fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }
}

/// Fixed body header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub flags: HeaderFlags,
    pub status: Status,
    /// Correlation tag, unique among in-flight requests on a transport
    pub tag: u64,
    pub session_id: u64,
    pub tree_id: u32,
    /// Requests: credits asked for. Responses: credits granted.
    pub credits: u16,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Header {
    /// Request header for `command` with zeroed ids.
    pub fn request(command: Command) -> Self {
        Self {
            command,
            flags: HeaderFlags::new(),
            status: Status::Success,
            tag: 0,
            session_id: 0,
            tree_id: 0,
            credits: 1,
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    /// Response header answering `request` with `status`.
    pub fn response_to(request: &Header, status: Status) -> Self {
        let mut flags = HeaderFlags::new();
        flags.set(HeaderFlags::RESPONSE);
        Self {
            command: request.command,
            flags,
            status,
            tag: request.tag,
            session_id: request.session_id,
            tree_id: request.tree_id,
            credits: request.credits.max(1),
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.has(HeaderFlags::RESPONSE)
    }

    /// Interim response that does not complete the request.
    pub fn is_interim(&self) -> bool {
        self.flags.has(HeaderFlags::ASYNC) && self.status == Status::Pending
    }

    pub fn is_signed(&self) -> bool {
        self.flags.has(HeaderFlags::SIGNED)
    }

    /// Encode with a zero checksum.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&PROTOCOL_MAGIC);
        buf.put_u16_le(self.command.as_u16());
        buf.put_u16_le(self.flags.bits());
        buf.put_u32_le(self.status.as_u32());
        buf.put_u64_le(self.tag);
        buf.put_u64_le(self.session_id);
        buf.put_u32_le(self.tree_id);
        buf.put_u16_le(self.credits);
        buf.put_u16_le(0);
        buf.put_u32_le(0);
        buf.put_slice(&self.signature);
    }

    /// Decode from the first `HEADER_SIZE` bytes of a body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CifsError::Protocol(format!(
                "Header too short: {} < {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        if bytes[0..4] != PROTOCOL_MAGIC {
            return Err(CifsError::Protocol("Bad header magic".to_string()));
        }

        let command_code = u16::from_le_bytes([bytes[4], bytes[5]]);
        let command = Command::from_u16(command_code).ok_or_else(|| {
            CifsError::InvalidMessage(format!("Unknown command 0x{command_code:04X}"))
        })?;

        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE]);

        Ok(Self {
            command,
            flags: HeaderFlags::from_bits(u16::from_le_bytes([bytes[6], bytes[7]])),
            status: Status::from_u32(read_u32(bytes, 8)),
            tag: read_u64(bytes, TAG_OFFSET),
            session_id: read_u64(bytes, 20),
            tree_id: read_u32(bytes, 28),
            credits: u16::from_le_bytes([bytes[32], bytes[33]]),
            signature,
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Read the correlation tag at its fixed offset without decoding the header.
pub fn peek_tag(body: &[u8]) -> Option<u64> {
    (body.len() >= HEADER_SIZE).then(|| read_u64(body, TAG_OFFSET))
}

/// CRC-32 of `body` with the checksum field treated as zero.
pub fn checksum(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&body[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Write the checksum field. Must run after signing.
pub fn seal(body: &mut [u8]) {
    let sum = checksum(body);
    body[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
}

/// Check the embedded checksum against the body contents.
pub fn verify_checksum(body: &[u8]) -> Result<()> {
    if body.len() < HEADER_SIZE {
        return Err(CifsError::Protocol("Body shorter than header".to_string()));
    }
    let declared = read_u32(body, CHECKSUM_OFFSET);
    let actual = checksum(body);
    if declared != actual {
        return Err(CifsError::Protocol(format!(
            "Checksum mismatch: declared 0x{declared:08X}, computed 0x{actual:08X}"
        )));
    }
    Ok(())
}

/// Copy of `body` with checksum, signature and the SIGNED flag cleared, the
/// input to signing.
pub fn signable(body: &[u8]) -> Vec<u8> {
    let mut copy = body.to_vec();
    let mut flags = HeaderFlags::from_bits(u16::from_le_bytes([copy[6], copy[7]]));
    flags.clear(HeaderFlags::SIGNED);
    copy[6..8].copy_from_slice(&flags.bits().to_le_bytes());
    copy[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
    copy[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].fill(0);
    copy
}

/// Place a signature into an encoded body and set the SIGNED flag.
pub fn write_signature(body: &mut [u8], signature: &[u8; SIGNATURE_SIZE]) {
    let mut flags = HeaderFlags::from_bits(u16::from_le_bytes([body[6], body[7]]));
    flags.set(HeaderFlags::SIGNED);
    body[6..8].copy_from_slice(&flags.bits().to_le_bytes());
    body[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].copy_from_slice(signature);
}

/// A decoded frame: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Body length (header + payload).
    pub fn body_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode the body with zero checksum, ready for signing and sealing.
    pub fn to_body(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.body_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    /// Full wire encoding: prefix plus sealed body, unsigned unless the
    /// header already carries a signature.
    pub fn encode(&self) -> Result<BytesMut> {
        let mut body = self.to_body();
        seal(&mut body);
        let prefix = Prefix::session(body.len())?;
        let mut out = BytesMut::with_capacity(PREFIX_SIZE + body.len());
        out.put_slice(&prefix);
        out.put_slice(&body);
        Ok(out)
    }

    /// Decode a complete body, verifying magic and checksum.
    pub fn decode(body: Bytes) -> Result<Self> {
        verify_checksum(&body)?;
        let header = Header::decode(&body)?;
        let payload = body.slice(HEADER_SIZE..);
        Ok(Self { header, payload })
    }
}
