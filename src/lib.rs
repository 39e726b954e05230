//! # cifs-core - Network Filesystem Session Engine
//!
//! Client-side connection and session layer for a CIFS/SMB-style network
//! filesystem protocol. It keeps one TCP stream per server, multiplexes
//! concurrent requests over it, authenticates identities and connects
//! shares, and recovers the whole stack transparently when the stream drops.
//!
//! ## Features
//!
//! - **Multiplexing**: many requests in flight per stream, matched to
//!   responses by tag through a pending-request table
//! - **Background reader**: one task per transport reads frames and wakes
//!   the waiting caller
//! - **Reconnect**: a failed stream is replaced once; every session and tree
//!   on it is invalidated and re-established lazily on next use
//! - **Deduplication**: one session per `(server, identity)` and one tree
//!   connection per `(server, identity, share)`, reference counted
//! - **Authentication**: negotiate, challenge, authenticate, with legacy,
//!   blob and keyed response variants and a derived signing key
//! - **Signing**: HMAC-SHA256 request and response signatures when
//!   negotiated
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► SessionDirectory ──► TreeConnection ──► Session ──► Transport ──► TCP
//!                  │                                     │            │
//!                  │ dedup + refcounts                   │ auth       ├─ writer lock
//!                  ▼                                     ▼            ├─ PendingTable
//!             (endpoint, identity[, share])        signing key        └─ reader task
//!                                                                           │
//!                                   responses / notifications ◄─────────────┘
//! ```
//!
//! ### Connection States
//!
//! ```text
//!                  connect ok
//!   [NeedsReconnect] ─────────► [Good]
//!          ▲                      │
//!          └──── read/write ──────┘
//!                  failure
//!
//!   any ──── shutdown ────► [Exiting]   (terminal)
//! ```
//!
//! ### Wire Format
//!
//! | Field   | Size | Notes                                          |
//! |---------|------|------------------------------------------------|
//! | Prefix  | 4    | kind byte (0x00 session, 0x85 keepalive) + 24-bit big-endian length |
//! | Header  | 56   | magic `FE 43 53 46`, command, flags, status, tag, ids, checksum, signature |
//! | Payload | n    | command specific                               |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cifs::{ConnectionConfig, Credentials, Endpoint, SessionDirectory};
//! use cifs::protocol::Command;
//!
//! let directory = SessionDirectory::new(ConnectionConfig::new("fileserver"));
//! let endpoint = Endpoint::new("fileserver");
//! let credentials = Credentials::new("alice", "CORP", "secret");
//!
//! let session = directory.find_or_create_session(&endpoint, &credentials).await?;
//! let tree = directory.find_or_create_tree_connection(&session, "public").await?;
//!
//! let reply = tree.send_request(Command::Request, bytes::Bytes::from_static(b"hello")).await?;
//!
//! directory.release_tree_connection(&tree).await;
//! directory.release_session(&session).await;
//! ```
//!
//! ## Errors
//!
//! Every [`CifsError`] is either [`ErrorClass::Retryable`] (re-issue the
//! operation; the stack re-validates itself first) or [`ErrorClass::Fatal`].
//!
//! ## Modules
//!
//! - [`transport`]: TCP stream, reconnect, frame reader, pending table
//! - [`session`]: sessions, tree connections, authentication, directory
//! - [`protocol`]: frame codec, commands, capabilities, messages
//! - [`crypto`]: response computation, key derivation, message signing
//! - [`server`]: reference responder
//! - [`config`]: configuration management
//! - [`error`]: error types and result aliases

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{Config, ConnectionConfig, Credentials};
pub use error::{CifsError, ErrorClass, Result};
pub use protocol::{Capabilities, Command, Frame, Header, Status};
pub use server::{Responder, ResponderHandle, ServerConfig};
pub use session::{AuthState, Identity, Session, SessionDirectory, TreeConnection};
pub use transport::{ConnectionStatus, Endpoint, Notification, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
