//! Session and tree-connection directory.
//!
//! Process-wide registry mapping `(endpoint, identity)` to a session and
//! `(endpoint, identity, share)` to a tree connection, plus the transport
//! per endpoint. All three maps sit behind one `tokio::sync::RwLock`.
//!
//! New entries are inserted under the write lock before their (slow)
//! authentication or tree connect runs, so concurrent callers for the same
//! key find the same object and wait on its setup instead of starting
//! another one. An entry whose setup is rejected is removed again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{AuthState, Identity, Session, TreeConnection};
use crate::config::{ConnectionConfig, Credentials};
use crate::error::Result;
use crate::transport::{ConnectionStatus, Endpoint, Transport};

type SessionKey = (Endpoint, Identity);
type TreeKey = (Endpoint, Identity, String);

#[derive(Default)]
struct Registry {
    transports: HashMap<Endpoint, Arc<Transport>>,
    sessions: HashMap<SessionKey, Arc<Session>>,
    trees: HashMap<TreeKey, Arc<TreeConnection>>,
}

/// Registry of live transports, sessions and tree connections
pub struct SessionDirectory {
    config: ConnectionConfig,
    registry: RwLock<Registry>,
}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn tree_key(session: &Session, share: &str) -> TreeKey {
    (
        session.transport().endpoint().clone(),
        session.identity().clone(),
        share.trim_matches('\\').to_lowercase(),
    )
}

impl SessionDirectory {
    /// Create an empty directory; new transports use `config`
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Connection parameters for new transports
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Return the session for `(endpoint, identity)`, creating and
    /// authenticating it if there is none.
    ///
    /// Each successful call holds one reference, to be returned with
    /// [`release_session`](Self::release_session). A rejected session is
    /// removed before the error is returned.
    pub async fn find_or_create_session(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<Session>> {
        let key: SessionKey = (endpoint.clone(), Identity::from(credentials));

        let session = {
            let mut registry = self.registry.write().await;
            match registry.sessions.get(&key) {
                Some(existing)
                    if existing.status() != ConnectionStatus::Exiting
                        && existing.auth_state() != AuthState::Failed =>
                {
                    existing.acquire();
                    tracing::debug!(%endpoint, identity = %key.1, refs = existing.ref_count(), "Reusing session");
                    Arc::clone(existing)
                }
                _ => {
                    let transport = match registry.transports.get(endpoint) {
                        Some(t) if t.status() != ConnectionStatus::Exiting => Arc::clone(t),
                        _ => {
                            let t = Transport::new(endpoint.clone(), self.config.clone());
                            registry.transports.insert(endpoint.clone(), Arc::clone(&t));
                            t
                        }
                    };
                    let session = Session::new(
                        transport,
                        credentials,
                        self.config.capabilities(),
                        self.config.workstation.clone(),
                    );
                    registry.sessions.insert(key.clone(), Arc::clone(&session));
                    tracing::debug!(%endpoint, identity = %key.1, "Created session");
                    session
                }
            }
        };

        if let Err(e) = session.ensure_valid().await {
            self.abandon_session(&key, &session).await;
            return Err(e);
        }
        Ok(session)
    }

    /// Return the tree connection for `share` on `session`, issuing the
    /// tree connect if there is none. Holds a reference on the session for
    /// as long as the tree lives.
    pub async fn find_or_create_tree_connection(
        &self,
        session: &Arc<Session>,
        share: &str,
    ) -> Result<Arc<TreeConnection>> {
        let key = tree_key(session, share);

        let tree = {
            let mut registry = self.registry.write().await;
            match registry.trees.get(&key) {
                Some(existing)
                    if existing.status() != ConnectionStatus::Exiting
                        && Arc::ptr_eq(existing.session(), session) =>
                {
                    existing.acquire();
                    tracing::debug!(share, refs = existing.ref_count(), "Reusing tree connection");
                    Arc::clone(existing)
                }
                _ => {
                    session.acquire();
                    let tree = TreeConnection::new(Arc::clone(session), share.to_string());
                    registry.trees.insert(key.clone(), Arc::clone(&tree));
                    tree
                }
            }
        };

        if let Err(e) = tree.ensure_valid().await {
            if tree.release() == 0 {
                self.retire_tree(&key, &tree).await;
            }
            return Err(e);
        }
        Ok(tree)
    }

    /// Drop one session reference; the last one logs off and removes it.
    pub async fn release_session(&self, session: &Arc<Session>) {
        if session.release() > 0 {
            return;
        }
        let key: SessionKey = (session.transport().endpoint().clone(), session.identity().clone());
        self.retire_session(&key, session).await;
    }

    /// Drop one tree reference; the last one disconnects it and releases
    /// its session reference.
    pub async fn release_tree_connection(&self, tree: &Arc<TreeConnection>) {
        if tree.release() > 0 {
            return;
        }
        let key = tree_key(tree.session(), tree.share());
        self.retire_tree(&key, tree).await;
    }

    async fn retire_tree(&self, key: &TreeKey, tree: &Arc<TreeConnection>) {
        {
            let mut registry = self.registry.write().await;
            // Someone may have picked it up again before we got the lock
            if tree.ref_count() > 0 {
                return;
            }
            if registry.trees.get(key).is_some_and(|t| Arc::ptr_eq(t, tree)) {
                registry.trees.remove(key);
            }
        }
        tree.disconnect().await;
        self.release_session(tree.session()).await;
    }

    /// Called when a caller's setup attempt failed.
    async fn abandon_session(&self, key: &SessionKey, session: &Arc<Session>) {
        let remaining = session.release();
        if remaining == 0 {
            self.retire_session(key, session).await;
        } else if session.auth_state() == AuthState::Failed {
            let mut registry = self.registry.write().await;
            if registry.sessions.get(key).is_some_and(|s| Arc::ptr_eq(s, session)) {
                registry.sessions.remove(key);
            }
        }
    }

    async fn retire_session(&self, key: &SessionKey, session: &Arc<Session>) {
        let transport = Arc::clone(session.transport());
        let transport_unused = {
            let mut registry = self.registry.write().await;
            if session.ref_count() > 0 {
                return;
            }
            if registry.sessions.get(key).is_some_and(|s| Arc::ptr_eq(s, session)) {
                registry.sessions.remove(key);
            }

            let unused = !registry
                .sessions
                .values()
                .any(|s| Arc::ptr_eq(s.transport(), &transport));
            if unused
                && registry
                    .transports
                    .get(transport.endpoint())
                    .is_some_and(|t| Arc::ptr_eq(t, &transport))
            {
                registry.transports.remove(transport.endpoint());
            }
            unused
        };

        session.logoff().await;
        tracing::debug!(identity = %session.identity(), "Session released");

        if transport_unused {
            transport.shutdown().await;
        }
    }

    /// Whether a live session exists for `(endpoint, identity)`
    pub async fn contains_session(&self, endpoint: &Endpoint, credentials: &Credentials) -> bool {
        let key: SessionKey = (endpoint.clone(), Identity::from(credentials));
        self.registry.read().await.sessions.contains_key(&key)
    }

    /// Transport registered for `endpoint`
    pub async fn transport(&self, endpoint: &Endpoint) -> Option<Arc<Transport>> {
        self.registry.read().await.transports.get(endpoint).cloned()
    }

    /// Number of registered sessions
    pub async fn session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    /// Number of registered tree connections
    pub async fn tree_count(&self) -> usize {
        self.registry.read().await.trees.len()
    }

    /// Number of registered transports
    pub async fn transport_count(&self) -> usize {
        self.registry.read().await.transports.len()
    }

    /// Disconnect everything and shut every transport down.
    pub async fn shutdown(&self) {
        let registry = {
            let mut registry = self.registry.write().await;
            std::mem::take(&mut *registry)
        };

        for tree in registry.trees.values() {
            tree.disconnect().await;
        }
        for session in registry.sessions.values() {
            session.logoff().await;
        }
        for transport in registry.transports.values() {
            transport.shutdown().await;
        }
        tracing::info!(
            transports = registry.transports.len(),
            sessions = registry.sessions.len(),
            "Directory shut down"
        );
    }
}

impl Drop for SessionDirectory {
    fn drop(&mut self) {
        if let Ok(registry) = self.registry.try_read() {
            if !registry.sessions.is_empty() {
                tracing::warn!(
                    sessions = registry.sessions.len(),
                    "Directory dropped with live sessions"
                );
            }
        }
    }
}
