//! Responder state and session bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use super::config::ServerConfig;
use crate::crypto::{KeyMaterial, MessageSigner};
use crate::protocol::{Frame, CHALLENGE_SIZE};

/// Counters of what the responder has seen
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections accepted
    pub connections: AtomicUsize,
    /// Negotiate requests answered
    pub negotiates: AtomicUsize,
    /// Session setup legs answered
    pub session_setups: AtomicUsize,
    /// Tree connect requests answered
    pub tree_connects: AtomicUsize,
    /// Logoffs answered
    pub logoffs: AtomicUsize,
    /// Generic requests answered
    pub requests: AtomicUsize,
}

impl ServerStats {
    /// Read a counter
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Acquire)
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// Authentication progress of a server-side session
#[derive(Debug)]
pub enum ServerSessionState {
    /// Challenge sent, waiting for the authenticate blob
    Challenged {
        /// Seed sent in the challenge blob
        server_challenge: [u8; CHALLENGE_SIZE],
        /// Keyed response granted
        keyed: bool,
    },
    /// Authenticated
    Established {
        /// Account name
        username: String,
        /// Present when the session signs its traffic
        signer: Option<MessageSigner>,
        /// Next expected request sequence number
        next_seq: u64,
        /// Connected trees by id
        trees: HashMap<u32, String>,
    },
}

/// Shared responder state
#[derive(Debug)]
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Counters
    pub stats: ServerStats,
    /// Sessions by id, across all connections
    pub sessions: RwLock<HashMap<u64, ServerSessionState>>,
    next_session_id: AtomicU64,
    next_tree_id: AtomicU32,
    kill: broadcast::Sender<()>,
    push: broadcast::Sender<Frame>,
}

impl ServerState {
    /// Create state for `config`
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (kill, _) = broadcast::channel(4);
        let (push, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            stats: ServerStats::default(),
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            next_tree_id: AtomicU32::new(1),
            kill,
            push,
        })
    }

    /// Allocate a session id
    pub fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Allocate a tree id
    pub fn allocate_tree_id(&self) -> u32 {
        self.next_tree_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Number of established sessions
    pub async fn established_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| matches!(s, ServerSessionState::Established { .. }))
            .count()
    }

    /// Forget every session, as a server restart would
    pub async fn forget_sessions(&self) {
        self.sessions.write().await.clear();
    }

    pub(crate) fn kill_signal(&self) -> broadcast::Receiver<()> {
        self.kill.subscribe()
    }

    pub(crate) fn push_channel(&self) -> broadcast::Receiver<Frame> {
        self.push.subscribe()
    }

    /// Close every open connection
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Send an unsolicited frame on every open connection
    pub fn push(&self, frame: Frame) -> usize {
        self.push.send(frame).unwrap_or(0)
    }
}

/// Build the signer for a newly established session.
pub(crate) fn session_signer(key: &KeyMaterial, signing: bool) -> Option<MessageSigner> {
    if !signing {
        return None;
    }
    match MessageSigner::new(key) {
        Ok(signer) => Some(signer),
        Err(e) => {
            tracing::warn!(error = %e, "Could not build session signer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_unique() {
        let state = ServerState::new(ServerConfig::default());
        let a = state.allocate_session_id();
        let b = state.allocate_session_id();
        assert_ne!(a, b);
        assert_ne!(state.allocate_tree_id(), state.allocate_tree_id());
    }

    #[tokio::test]
    async fn test_established_count() {
        let state = ServerState::new(ServerConfig::default());
        {
            let mut sessions = state.sessions.write().await;
            sessions.insert(
                1,
                ServerSessionState::Challenged {
                    server_challenge: [0; CHALLENGE_SIZE],
                    keyed: false,
                },
            );
            sessions.insert(
                2,
                ServerSessionState::Established {
                    username: "alice".to_string(),
                    signer: None,
                    next_seq: 0,
                    trees: HashMap::new(),
                },
            );
        }
        assert_eq!(state.established_count().await, 1);

        state.forget_sessions().await;
        assert_eq!(state.established_count().await, 0);
    }

    #[test]
    fn test_push_without_connections() {
        let state = ServerState::new(ServerConfig::default());
        assert_eq!(state.push(Frame::new(
            crate::protocol::Header::request(crate::protocol::Command::Echo),
            bytes::Bytes::new(),
        )), 0);
    }
}
