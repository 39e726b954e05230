//! Wire protocol for the session engine.
//!
//! A deliberately small dialect in the shape of SMB2: length-prefixed
//! frames, a fixed header with a correlation tag at a fixed offset, and
//! the negotiate / session setup / tree connect commands needed to bring a
//! session up.
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Server
//!    |------ NEGOTIATE (dialects) ------>|
//!    |<----- NEGOTIATE (choice, seed) ---|
//!    |------ SESSION_SETUP ------------->|  legacy response, or blob legs
//!    |<----- SESSION_SETUP (session id) -|
//!    |------ TREE_CONNECT (\\h\share) -->|
//!    |<----- TREE_CONNECT (tree id) -----|
//!    |====== REQUEST / ECHO ============>|
//!    |<===== RESPONSE ===================|
//!    |<----- OPLOCK_BREAK (unsolicited) -|
//!    |------ TREE_DISCONNECT / LOGOFF -->|
//! ```

mod blob;
mod capabilities;
mod command;
mod frame;
mod message;

pub use blob::{blob_flags, blob_type, AuthenticateBlob, ChallengeBlob, NegotiateBlob, BLOB_SIGNATURE};
pub use capabilities::{
    CapabilityFlags, Capabilities, NegotiatedCaps, SecurityMode, DIALECT_2_1, DIALECT_3_0,
    DIALECT_3_1, SUPPORTED_DIALECTS,
};
pub use command::{Command, Status};
pub use frame::{
    checksum, peek_tag, seal, signable, validate_length, verify_checksum, write_signature, Frame,
    FrameKind, Header, HeaderFlags, Prefix, HEADER_SIZE, MAX_PREFIX_LENGTH, NOTIFICATION_TAG,
    PREFIX_SIZE, PROTOCOL_MAGIC, SIGNATURE_SIZE,
};
pub use message::{
    NegotiateRequest, NegotiateResponse, OplockBreak, SessionSetupRequest, SessionSetupResponse,
    TreeConnectRequest, TreeConnectResponse, CHALLENGE_SIZE, GUID_SIZE,
};

/// Primary well-known port
pub const PRIMARY_PORT: u16 = 445;

/// Fallback port tried when the primary refuses
pub const FALLBACK_PORT: u16 = 139;

/// Frame size limit before negotiation (64 KiB payload plus header)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 + HEADER_SIZE;
