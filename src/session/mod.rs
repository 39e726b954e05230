//! Sessions and tree connections.
//!
//! A [`Session`] binds an authenticated identity to a [`Transport`]; a
//! [`TreeConnection`] binds a named share to a session. Both are handed out
//! by the [`SessionDirectory`], which reuses existing objects instead of
//! authenticating or tree-connecting again.
//!
//! Either handle validates itself before every request: after the transport
//! reconnects, the session re-runs authentication and the tree re-issues
//! its tree connect, so callers only ever see a retryable error for the
//! request that was in flight at the moment of failure.

mod auth;
mod directory;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;

use crate::config::Credentials;
use crate::crypto::{KeyMaterial, MessageSigner};
use crate::error::{CifsError, Result};
use crate::protocol::{
    signable, write_signature, Capabilities, Command, Frame, Header, NegotiatedCaps, Status,
    TreeConnectRequest, TreeConnectResponse,
};
use crate::transport::{ConnectionStatus, Dependent, FrameSigner, Transport};

pub use auth::AuthState;
pub use directory::SessionDirectory;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Account identity a session is matched by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Account name
    pub username: String,
    /// Account domain
    pub domain: String,
}

impl Identity {
    /// Create an identity
    pub fn new(username: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
        }
    }
}

impl From<&Credentials> for Identity {
    fn from(credentials: &Credentials) -> Self {
        Self::new(&credentials.username, &credentials.domain)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.username)
        } else {
            write!(f, "{}\\{}", self.domain, self.username)
        }
    }
}

/// Per-session request signing with a sequence counter.
///
/// Requests take even sequence numbers; the response to request `n` is
/// signed with `n + 1`.
#[derive(Debug)]
pub(crate) struct SessionSigner {
    signer: MessageSigner,
    next_seq: AtomicU64,
}

impl SessionSigner {
    pub(crate) fn new(key: &KeyMaterial) -> Result<Self> {
        Ok(Self {
            signer: MessageSigner::new(key)?,
            next_seq: AtomicU64::new(0),
        })
    }
}

impl FrameSigner for SessionSigner {
    fn sign_request(&self, body: &mut [u8]) -> u64 {
        let seq = self.next_seq.fetch_add(2, Ordering::AcqRel);
        let signature = self.signer.sign(seq, &signable(body));
        write_signature(body, &signature);
        seq
    }

    fn verify_response(&self, seq: u64, response: &Frame) -> Result<()> {
        if !response.header.is_signed() {
            return Err(CifsError::Protocol(
                "Unsigned response on a signed session".to_string(),
            ));
        }
        let body = response.to_body();
        self.signer
            .verify(seq + 1, &signable(&body), &response.header.signature)
            .map_err(|_| CifsError::Protocol("Response signature mismatch".to_string()))
    }
}

#[derive(Debug)]
struct SessionState {
    status: ConnectionStatus,
    auth: AuthState,
    generation: u64,
    session_id: u64,
    caps: Option<NegotiatedCaps>,
    signing_key: Option<KeyMaterial>,
    signer: Option<Arc<SessionSigner>>,
    /// Bumped on every successful authentication
    epoch: u64,
}

/// An identity authenticated over a transport.
#[derive(Debug)]
pub struct Session {
    transport: Arc<Transport>,
    identity: Identity,
    secret: KeyMaterial,
    workstation: String,
    offer: Capabilities,
    state: Mutex<SessionState>,
    refs: AtomicUsize,
    setup: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create an unauthenticated session with one reference.
    pub(crate) fn new(
        transport: Arc<Transport>,
        credentials: &Credentials,
        offer: Capabilities,
        workstation: String,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            identity: Identity::from(credentials),
            secret: credentials.secret(),
            workstation,
            offer,
            state: Mutex::new(SessionState {
                status: ConnectionStatus::NeedsReconnect,
                auth: AuthState::Initial,
                generation: 0,
                session_id: 0,
                caps: None,
                signing_key: None,
                signer: None,
                epoch: 0,
            }),
            refs: AtomicUsize::new(1),
            setup: tokio::sync::Mutex::new(()),
            transport,
        });
        let weak: Weak<dyn Dependent> = Arc::downgrade(&session) as Weak<dyn Dependent>;
        session.transport.register_dependent(weak);
        session
    }

    /// Transport this session runs over
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Identity the session is matched by
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    /// Progress of the authentication state machine
    pub fn auth_state(&self) -> AuthState {
        lock(&self.state).auth
    }

    /// Server-assigned session id (0 before authentication)
    pub fn session_id(&self) -> u64 {
        lock(&self.state).session_id
    }

    /// Capabilities negotiated for the current incarnation
    pub fn negotiated(&self) -> Option<NegotiatedCaps> {
        lock(&self.state).caps.clone()
    }

    /// Signing key derived during authentication
    pub fn signing_key(&self) -> Option<KeyMaterial> {
        lock(&self.state).signing_key.clone()
    }

    /// Whether requests on this session are signed
    pub fn is_signing(&self) -> bool {
        lock(&self.state).signer.is_some()
    }

    /// Outstanding references
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Number of successful authentications so far
    pub(crate) fn epoch(&self) -> u64 {
        lock(&self.state).epoch
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, returning how many remain.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Good and established on the transport's current stream
    pub fn is_ready(&self) -> bool {
        let (status, generation) = {
            let state = lock(&self.state);
            (state.status, state.generation)
        };
        let transport = self.transport.snapshot();
        status == ConnectionStatus::Good
            && transport.status == ConnectionStatus::Good
            && transport.generation == generation
    }

    fn rejected_error() -> CifsError {
        CifsError::Authentication {
            status: None,
            message: "Session was rejected by the server".to_string(),
        }
    }

    /// Make the session usable, authenticating (again) if needed.
    ///
    /// Concurrent callers share one authentication run.
    pub async fn ensure_valid(self: &Arc<Self>) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        self.check_usable()?;

        let _setup = self.setup.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        self.check_usable()?;

        self.transport.connect().await?;
        auth::authenticate(self).await
    }

    fn check_usable(&self) -> Result<()> {
        let state = lock(&self.state);
        if state.status == ConnectionStatus::Exiting {
            return Err(CifsError::Exiting);
        }
        if state.auth == AuthState::Failed {
            return Err(Self::rejected_error());
        }
        Ok(())
    }

    fn set_auth_state(&self, auth: AuthState) {
        let mut state = lock(&self.state);
        tracing::trace!(identity = %self.identity, from = ?state.auth, to = ?auth, "Auth state");
        state.auth = auth;
    }

    /// Record a successful authentication.
    ///
    /// Fails with `NeedsReconnect` if the transport moved on while the
    /// exchange was running.
    fn establish(
        &self,
        generation: u64,
        session_id: u64,
        caps: NegotiatedCaps,
        signing_key: KeyMaterial,
        signer: Option<Arc<SessionSigner>>,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.status == ConnectionStatus::Exiting {
            return Err(CifsError::Exiting);
        }
        let current = self.transport.snapshot();
        if current.generation != generation || current.status != ConnectionStatus::Good {
            return Err(CifsError::NeedsReconnect);
        }
        state.status = ConnectionStatus::Good;
        state.auth = AuthState::Authenticated;
        state.generation = generation;
        state.session_id = session_id;
        state.caps = Some(caps);
        state.signing_key = Some(signing_key);
        state.signer = signer;
        state.epoch += 1;
        Ok(())
    }

    fn fail(&self) {
        let mut state = lock(&self.state);
        state.auth = AuthState::Failed;
        state.signer = None;
    }

    fn mark_exiting(&self) {
        let mut state = lock(&self.state);
        state.status = ConnectionStatus::Exiting;
        state.signer = None;
    }

    /// Send a frame under this session's id and signing state.
    ///
    /// Statuses meaning the server forgot the session invalidate it and
    /// surface as `NeedsReconnect`.
    async fn exchange(self: &Arc<Self>, mut header: Header, payload: Bytes) -> Result<Frame> {
        let (session_id, signer) = {
            let state = lock(&self.state);
            (state.session_id, state.signer.clone())
        };
        header.session_id = session_id;

        let command = header.command;
        let response = self
            .transport
            .request_signed(
                Frame::new(header, payload),
                signer.as_deref().map(|s| s as &dyn FrameSigner),
            )
            .await?;

        let status = response.header.status;
        if status.is_session_expired() {
            tracing::info!(identity = %self.identity, %status, "Server expired the session");
            self.invalidate();
            return Err(CifsError::NeedsReconnect);
        }
        if !status.is_success() {
            return Err(CifsError::Remote { command, status });
        }
        Ok(response)
    }

    /// Send a session-scoped request and return the response payload.
    pub async fn send_request(self: &Arc<Self>, command: Command, payload: Bytes) -> Result<Bytes> {
        self.ensure_valid().await?;
        let response = self.exchange(Header::request(command), payload).await?;
        Ok(response.payload)
    }

    /// Best-effort logoff; the session is Exiting afterwards.
    pub(crate) async fn logoff(self: &Arc<Self>) {
        if self.is_ready() {
            match self.exchange(Header::request(Command::Logoff), Bytes::new()).await {
                Ok(_) => tracing::debug!(identity = %self.identity, "Logged off"),
                Err(e) => tracing::debug!(identity = %self.identity, error = %e, "Logoff failed"),
            }
        }
        self.mark_exiting();
    }
}

impl Dependent for Session {
    fn invalidate(&self) {
        let mut state = lock(&self.state);
        if state.status == ConnectionStatus::Good {
            state.status = ConnectionStatus::NeedsReconnect;
            state.signer = None;
        }
    }
}

#[derive(Debug)]
struct TreeState {
    status: ConnectionStatus,
    tree_id: u32,
    session_epoch: u64,
    share_type: u8,
}

/// A share connected through a session.
#[derive(Debug)]
pub struct TreeConnection {
    session: Arc<Session>,
    share: String,
    state: Mutex<TreeState>,
    refs: AtomicUsize,
    setup: tokio::sync::Mutex<()>,
}

impl TreeConnection {
    /// Create an unconnected tree with one reference
    pub(crate) fn new(session: Arc<Session>, share: String) -> Arc<Self> {
        let tree = Arc::new(Self {
            share,
            state: Mutex::new(TreeState {
                status: ConnectionStatus::NeedsReconnect,
                tree_id: 0,
                session_epoch: 0,
                share_type: 0,
            }),
            refs: AtomicUsize::new(1),
            setup: tokio::sync::Mutex::new(()),
            session,
        });
        let weak: Weak<dyn Dependent> = Arc::downgrade(&tree) as Weak<dyn Dependent>;
        tree.session.transport().register_dependent(weak);
        tree
    }

    /// Owning session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Share name as requested
    pub fn share(&self) -> &str {
        &self.share
    }

    /// UNC path sent in the tree connect
    pub fn path(&self) -> String {
        format!(r"\\{}\{}", self.session.transport().endpoint().host(), self.share)
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    /// Server-assigned tree id
    pub fn tree_id(&self) -> u32 {
        lock(&self.state).tree_id
    }

    /// Share type reported by the server
    pub fn share_type(&self) -> u8 {
        lock(&self.state).share_type
    }

    /// Outstanding references
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Good and connected under the session's current authentication
    pub fn is_ready(&self) -> bool {
        let (status, epoch) = {
            let state = lock(&self.state);
            (state.status, state.session_epoch)
        };
        status == ConnectionStatus::Good
            && self.session.is_ready()
            && self.session.epoch() == epoch
    }

    /// Make the tree usable, re-validating the session and re-issuing the
    /// tree connect if needed. Concurrent callers share one tree connect.
    pub async fn ensure_valid(self: &Arc<Self>) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        if self.status() == ConnectionStatus::Exiting {
            return Err(CifsError::Exiting);
        }

        let _setup = self.setup.lock().await;
        self.session.ensure_valid().await?;
        if self.is_ready() {
            return Ok(());
        }

        let epoch = self.session.epoch();
        let request = TreeConnectRequest { path: self.path() };
        let response = self
            .session
            .exchange(Header::request(Command::TreeConnect), request.encode())
            .await?;
        let reply = TreeConnectResponse::decode(response.payload.clone())?;

        let mut state = lock(&self.state);
        if state.status == ConnectionStatus::Exiting {
            return Err(CifsError::Exiting);
        }
        if self.session.epoch() != epoch {
            return Err(CifsError::NeedsReconnect);
        }
        state.status = ConnectionStatus::Good;
        state.tree_id = response.header.tree_id;
        state.session_epoch = epoch;
        state.share_type = reply.share_type;
        tracing::info!(share = %self.share, tree_id = state.tree_id, "Tree connected");
        Ok(())
    }

    /// Send a tree-scoped request and return the response payload.
    pub async fn send_request(self: &Arc<Self>, command: Command, payload: Bytes) -> Result<Bytes> {
        self.ensure_valid().await?;
        let mut header = Header::request(command);
        header.tree_id = self.tree_id();
        let response = self.session.exchange(header, payload).await?;
        Ok(response.payload)
    }

    /// Best-effort tree disconnect; the tree is Exiting afterwards.
    pub(crate) async fn disconnect(self: &Arc<Self>) {
        if self.is_ready() {
            let mut header = Header::request(Command::TreeDisconnect);
            header.tree_id = self.tree_id();
            if let Err(e) = self.session.exchange(header, Bytes::new()).await {
                tracing::debug!(share = %self.share, error = %e, "Tree disconnect failed");
            }
        }
        lock(&self.state).status = ConnectionStatus::Exiting;
    }
}

impl Dependent for TreeConnection {
    fn invalidate(&self) {
        let mut state = lock(&self.state);
        if state.status == ConnectionStatus::Good {
            state.status = ConnectionStatus::NeedsReconnect;
        }
    }
}

/// Wire status that ended an authentication leg, as an error
pub(crate) fn rejection(command: Command, status: Status) -> CifsError {
    CifsError::Authentication {
        status: Some(status),
        message: format!("{command:?} rejected with {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::crypto::signing_key;
    use crate::protocol::HeaderFlags;
    use crate::transport::Endpoint;

    fn session() -> Arc<Session> {
        let transport = Transport::new(
            Endpoint::with_port("127.0.0.1", 1),
            ConnectionConfig::new("127.0.0.1"),
        );
        Session::new(
            transport,
            &Credentials::new("alice", "CORP", "pw"),
            Capabilities::default(),
            "ws".to_string(),
        )
    }

    fn signer() -> SessionSigner {
        let key = signing_key(&crate::crypto::secret_hash("pw"), &[1; 8]).unwrap();
        SessionSigner::new(&key).unwrap()
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::new("alice", "CORP").to_string(), "CORP\\alice");
        assert_eq!(Identity::new("alice", "").to_string(), "alice");
    }

    #[test]
    fn test_signer_sequence_numbers() {
        let signer = signer();
        let mut body = Frame::new(Header::request(Command::Request), Bytes::new()).to_body();
        assert_eq!(signer.sign_request(&mut body), 0);
        assert_eq!(signer.sign_request(&mut body), 2);
        assert!(HeaderFlags::from_bits(u16::from_le_bytes([body[6], body[7]]))
            .has(HeaderFlags::SIGNED));
    }

    #[test]
    fn test_signer_verifies_response() {
        let client = signer();
        let server = signer();
        let mut request = Header::request(Command::Request);
        request.tag = 3;

        let mut response = Frame::new(
            Header::response_to(&request, Status::Success),
            Bytes::from_static(b"data"),
        );
        let signature = server.signer.sign(1, &signable(&response.to_body()));
        response.header.signature = signature;
        response.header.flags.set(HeaderFlags::SIGNED);

        assert!(client.verify_response(0, &response).is_ok());
        assert!(client.verify_response(2, &response).is_err());

        response.header.flags.clear(HeaderFlags::SIGNED);
        assert!(client.verify_response(0, &response).is_err());
    }

    #[test]
    fn test_new_session_state() {
        let session = session();
        assert_eq!(session.status(), ConnectionStatus::NeedsReconnect);
        assert_eq!(session.auth_state(), AuthState::Initial);
        assert_eq!(session.session_id(), 0);
        assert_eq!(session.ref_count(), 1);
        assert!(!session.is_ready());
        assert!(session.signing_key().is_none());
    }

    #[test]
    fn test_release_saturates() {
        let session = session();
        session.acquire();
        assert_eq!(session.release(), 1);
        assert_eq!(session.release(), 0);
        assert_eq!(session.release(), 0);
    }

    #[tokio::test]
    async fn test_failed_session_is_not_retried() {
        let session = session();
        session.fail();
        let err = session.ensure_valid().await.unwrap_err();
        assert!(matches!(err, CifsError::Authentication { status: None, .. }));
    }

    #[test]
    fn test_tree_path() {
        let session = session();
        let tree = TreeConnection::new(session, "public".to_string());
        assert_eq!(tree.path(), r"\\127.0.0.1\public");
        assert!(!tree.is_ready());
    }
}
