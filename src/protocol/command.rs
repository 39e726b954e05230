//! Command codes and wire status values.

#![allow(missing_docs)]

use std::fmt;

/// Command carried in the body header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Capability negotiation
    Negotiate = 0x0000,
    /// Authentication round (may take two legs)
    SessionSetup = 0x0001,
    /// Session teardown
    Logoff = 0x0002,
    /// Attach to a named share
    TreeConnect = 0x0003,
    /// Detach from a share
    TreeDisconnect = 0x0004,
    /// Liveness probe, payload is echoed back
    Echo = 0x000D,
    /// Server-initiated lease/oplock break notification
    OplockBreak = 0x0012,
    /// Opaque request issued by the file layer
    Request = 0x0100,
}

impl Command {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0000 => Some(Command::Negotiate),
            0x0001 => Some(Command::SessionSetup),
            0x0002 => Some(Command::Logoff),
            0x0003 => Some(Command::TreeConnect),
            0x0004 => Some(Command::TreeDisconnect),
            0x000D => Some(Command::Echo),
            0x0012 => Some(Command::OplockBreak),
            0x0100 => Some(Command::Request),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Commands the server may send without a matching request.
    pub fn is_notification(&self) -> bool {
        matches!(self, Command::OplockBreak)
    }
}

/// Wire status returned in every response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    /// Authentication needs another leg
    MoreProcessingRequired,
    /// Interim response, the real one follows
    Pending,
    LogonFailure,
    AccessDenied,
    BadNetworkName,
    NotSupported,
    InvalidParameter,
    /// Server dropped the session; re-authenticate
    NetworkSessionExpired,
    /// Server no longer knows the session id
    UserSessionDeleted,
    Other(u32),
}

impl Status {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0000_0000 => Status::Success,
            0xC000_0016 => Status::MoreProcessingRequired,
            0x0000_0103 => Status::Pending,
            0xC000_006D => Status::LogonFailure,
            0xC000_0022 => Status::AccessDenied,
            0xC000_00CC => Status::BadNetworkName,
            0xC000_00BB => Status::NotSupported,
            0xC000_000D => Status::InvalidParameter,
            0xC000_035C => Status::NetworkSessionExpired,
            0xC000_0203 => Status::UserSessionDeleted,
            other => Status::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Status::Success => 0x0000_0000,
            Status::MoreProcessingRequired => 0xC000_0016,
            Status::Pending => 0x0000_0103,
            Status::LogonFailure => 0xC000_006D,
            Status::AccessDenied => 0xC000_0022,
            Status::BadNetworkName => 0xC000_00CC,
            Status::NotSupported => 0xC000_00BB,
            Status::InvalidParameter => 0xC000_000D,
            Status::NetworkSessionExpired => 0xC000_035C,
            Status::UserSessionDeleted => 0xC000_0203,
            Status::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    /// The server invalidated the session; the session must be set up again.
    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            Status::NetworkSessionExpired | Status::UserSessionDeleted
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Other(code) => write!(f, "0x{code:08X}"),
            known => write!(f, "{:?} (0x{:08X})", known, known.as_u32()),
        }
    }
}
