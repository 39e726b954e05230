//! Reference responder.
//!
//! A small in-process server speaking the same wire protocol as the
//! client engine. It negotiates, authenticates against a static account
//! table, connects configured shares and echoes generic requests back,
//! which is enough to drive the engine end to end in tests and from the
//! `cifs serve` command.
//!
//! Test hooks on [`ServerState`] simulate a server restart
//! ([`ServerState::forget_sessions`]), a network drop
//! ([`ServerState::drop_connections`]) and unsolicited notifications
//! ([`ServerState::push`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use cifs::server::{Responder, ServerConfig};
//!
//! let config = ServerConfig::default()
//!     .with_port(0)
//!     .with_user("alice", "CORP", "secret")
//!     .with_share("public");
//! let handle = Responder::bind(config).await?.spawn();
//! println!("listening on {}", handle.addr());
//! ```

mod config;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub use config::{ServerConfig, UserEntry};
pub use state::{ServerSessionState, ServerState, ServerStats};

use crate::error::{CifsError, Result};
use crate::protocol::{validate_length, Frame, Prefix, PREFIX_SIZE};
use crate::transport::Endpoint;
use handlers::Connection;

/// Bound, not yet running responder
#[derive(Debug)]
pub struct Responder {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Responder {
    /// Bind the configured address.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CifsError::Transport(format!("Failed to bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            state: ServerState::new(config),
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Responder listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            ServerStats::bump(&self.state.stats.connections);
            tracing::debug!(%peer, "Accepted connection");
            tokio::spawn(serve_connection(Arc::clone(&self.state), stream));
        }
    }

    /// Run on a background task.
    pub fn spawn(self) -> ResponderHandle {
        let addr = self
            .listener
            .local_addr()
            .unwrap_or_else(|_| self.state.config.addr);
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!(error = %e, "Responder stopped");
            }
        });
        ResponderHandle { addr, state, task }
    }
}

/// Running responder
#[derive(Debug)]
pub struct ResponderHandle {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl ResponderHandle {
    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint a client uses to reach this responder
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_addr(self.addr)
    }

    /// Shared state
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&self) {
        self.task.abort();
        self.state.drop_connections();
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pull the next complete frame body out of `buf`.
///
/// Keepalives are consumed silently. A declared length outside the
/// accepted range is an error and ends the connection.
fn next_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
    loop {
        if buf.len() < PREFIX_SIZE {
            return Ok(None);
        }
        let prefix = Prefix::parse([buf[0], buf[1], buf[2], buf[3]])?;
        match prefix {
            Prefix::Keepalive(len) => {
                if buf.len() < PREFIX_SIZE + len {
                    return Ok(None);
                }
                buf.advance(PREFIX_SIZE + len);
            }
            Prefix::Session(len) => {
                validate_length(len, max_frame_size)?;
                if buf.len() < PREFIX_SIZE + len {
                    return Ok(None);
                }
                buf.advance(PREFIX_SIZE);
                let body = buf.split_to(len).freeze();
                return Frame::decode(body).map(Some);
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.encode()?).await?;
    Ok(())
}

async fn serve_connection(state: Arc<ServerState>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let (mut reader, mut writer) = stream.into_split();
    let mut connection = Connection::new(Arc::clone(&state));
    let mut kill = state.kill_signal();
    let mut push = state.push_channel();
    let max_frame_size = state.config.capabilities.frame_limit();
    let mut buf = BytesMut::with_capacity(8 * 1024);

    'conn: loop {
        loop {
            let frame = match next_frame(&mut buf, max_frame_size) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(?peer, error = %e, "Dropping connection");
                    break 'conn;
                }
            };
            for response in connection.handle(frame).await {
                if let Err(e) = write_frame(&mut writer, &response).await {
                    tracing::debug!(?peer, error = %e, "Write failed");
                    break 'conn;
                }
            }
        }

        tokio::select! {
            _ = kill.recv() => {
                tracing::debug!(?peer, "Connection killed");
                break;
            }
            pushed = push.recv() => match pushed {
                Ok(frame) => {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(?peer, skipped, "Dropped pushed frames");
                }
                Err(RecvError::Closed) => break,
            },
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(?peer, "Peer closed");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(?peer, error = %e, "Read failed");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Header, Prefix, HEADER_SIZE};

    #[test]
    fn test_next_frame_waits_for_full_body() {
        let frame = Frame::new(Header::request(Command::Echo), bytes::Bytes::new());
        let wire = frame.encode().unwrap();

        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(next_frame(&mut buf, 1024).unwrap().is_none());

        buf.extend_from_slice(&wire[wire.len() - 1..]);
        let decoded = next_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(decoded.header.command, Command::Echo);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_next_frame_skips_keepalive() {
        let frame = Frame::new(Header::request(Command::Echo), bytes::Bytes::new());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Prefix::keepalive());
        buf.extend_from_slice(&frame.encode().unwrap());

        assert!(next_frame(&mut buf, 1024).unwrap().is_some());
    }

    #[test]
    fn test_next_frame_rejects_oversized() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Prefix::session(HEADER_SIZE + 4096).unwrap());
        assert!(next_frame(&mut buf, HEADER_SIZE + 1024).is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let responder = Responder::bind(ServerConfig::default().with_port(0))
            .await
            .unwrap();
        assert_ne!(responder.local_addr().unwrap().port(), 0);
    }
}
