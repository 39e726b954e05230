//! Transport Manager.
//!
//! One [`Transport`] owns the stream to one remote endpoint. It opens the
//! stream, re-opens it after failures, and shuts it down for good when its
//! last session goes away. A single background Frame Reader task per
//! transport reads responses and wakes the caller waiting on each tag.
//!
//! ## Status
//!
//! ```text
//!            connect ok
//!   ┌──────────────────────────┐
//!   ▼                          │
//! Good ──failure──► NeedsReconnect ──shutdown──► Exiting (terminal)
//!   │                                               ▲
//!   └───────────────────shutdown────────────────────┘
//! ```
//!
//! Every successful (re)connect starts a new *generation*. Callers record
//! the generation they sent under; a response can only satisfy a request
//! from the same generation, and a reconnect request naming an old
//! generation is a no-op.
//!
//! Status changes are published on a `tokio::sync::watch` channel, which
//! plays the role of the transport's condition variable.

mod pending;
mod reader;
mod tcp;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};

use crate::config::ConnectionConfig;
use crate::error::{CifsError, Result};
use crate::protocol::{
    seal, Command, Frame, Header, NegotiatedCaps, OplockBreak, Prefix, CHALLENGE_SIZE, GUID_SIZE,
    PREFIX_SIZE,
};

pub use pending::{Delivery, EntryState, PendingRequest, PendingTable};
pub use tcp::{Endpoint, TcpConnector};

/// Capacity of the notification broadcast channel
const NOTIFICATION_CAPACITY: usize = 64;

/// Status shared by transports, sessions and tree connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Usable
    Good,
    /// Must be re-established before use
    NeedsReconnect,
    /// Shutting down, never usable again
    Exiting,
}

/// Status plus generation, as published to watchers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Current status
    pub status: ConnectionStatus,
    /// Incarnation counter, bumped on every successful connect
    pub generation: u64,
}

/// Something whose validity depends on the transport's current stream.
///
/// Sessions and tree connections register themselves so a reconnect can
/// mark them `NeedsReconnect` before anyone reuses them.
pub trait Dependent: Send + Sync {
    /// The stream this object was established on is gone
    fn invalidate(&self);
}

/// Signs outgoing requests and checks the matching responses.
///
/// `sign_request` runs while the transport's write lock is held, so
/// sequence numbers are assigned in wire order.
pub trait FrameSigner: Send + Sync {
    /// Sign an encoded body in place and return the sequence number used
    fn sign_request(&self, body: &mut [u8]) -> u64;

    /// Verify a response to the request signed with `seq`
    fn verify_response(&self, seq: u64, response: &Frame) -> Result<()>;
}

/// What the negotiate exchange established for the current generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Agreed capabilities and limits
    pub caps: NegotiatedCaps,
    /// Per-connection challenge seed
    pub challenge: [u8; CHALLENGE_SIZE],
    /// Server identifier
    pub server_guid: [u8; GUID_SIZE],
}

/// Unsolicited server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Server revokes or downgrades a cached lock
    OplockBreak {
        /// Session the break applies to
        session_id: u64,
        /// Tree the break applies to
        tree_id: u32,
        /// Break details
        brk: OplockBreak,
    },
}

#[derive(Debug)]
struct State {
    status: ConnectionStatus,
    generation: u64,
    recovering: bool,
    negotiation: Option<Negotiation>,
    max_frame_size: usize,
}

/// One stream connection to a remote endpoint.
pub struct Transport {
    endpoint: Endpoint,
    config: ConnectionConfig,
    connector: TcpConnector,
    state: Mutex<State>,
    status_tx: watch::Sender<Snapshot>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    read_half: Mutex<Option<(u64, OwnedReadHalf)>>,
    connect_lock: tokio::sync::Mutex<()>,
    negotiate_lock: tokio::sync::Mutex<()>,
    pending: PendingTable,
    reader_started: AtomicBool,
    readers: AtomicUsize,
    recoveries: AtomicUsize,
    dependents: Mutex<Vec<Weak<dyn Dependent>>>,
    notifications: broadcast::Sender<Notification>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("generation", &self.generation())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolves once the stream of `generation` is retired, with the error a
/// writer on that stream should report.
async fn stream_retired(watch: &mut watch::Receiver<Snapshot>, generation: u64) -> CifsError {
    loop {
        let snapshot = *watch.borrow_and_update();
        match snapshot.status {
            ConnectionStatus::Exiting => return CifsError::Exiting,
            ConnectionStatus::NeedsReconnect => return CifsError::NeedsReconnect,
            ConnectionStatus::Good if snapshot.generation != generation => {
                return CifsError::NeedsReconnect;
            }
            ConnectionStatus::Good => {}
        }
        if watch.changed().await.is_err() {
            return CifsError::Exiting;
        }
    }
}

impl Transport {
    /// Create an unconnected transport for `endpoint`
    pub fn new(endpoint: Endpoint, config: ConnectionConfig) -> Arc<Self> {
        let connector = TcpConnector::new(endpoint.clone(), config.connect_timeout());
        let (status_tx, _) = watch::channel(Snapshot {
            status: ConnectionStatus::NeedsReconnect,
            generation: 0,
        });
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Arc::new(Self {
            endpoint,
            pending: PendingTable::new(usize::from(config.max_in_flight)),
            state: Mutex::new(State {
                status: ConnectionStatus::NeedsReconnect,
                generation: 0,
                recovering: false,
                negotiation: None,
                max_frame_size: config.frame_limit(),
            }),
            config,
            connector,
            status_tx,
            writer: tokio::sync::Mutex::new(None),
            read_half: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            negotiate_lock: tokio::sync::Mutex::new(()),
            reader_started: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            recoveries: AtomicUsize::new(0),
            dependents: Mutex::new(Vec::new()),
            notifications,
        })
    }

    /// Remote endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connection parameters
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Status and generation read together
    pub fn snapshot(&self) -> Snapshot {
        let state = lock(&self.state);
        Snapshot {
            status: state.status,
            generation: state.generation,
        }
    }

    /// Watch status changes
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.status_tx.subscribe()
    }

    /// Pending-request table of this transport
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Number of registered pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Frame Reader tasks currently running (0 or 1)
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Recovery loops started so far
    pub fn recovery_count(&self) -> usize {
        self.recoveries.load(Ordering::Acquire)
    }

    /// Largest frame body currently accepted
    pub fn max_frame_size(&self) -> usize {
        lock(&self.state).max_frame_size
    }

    /// Negotiation result for the current generation, if any
    pub fn negotiation(&self) -> Option<Negotiation> {
        lock(&self.state).negotiation.clone()
    }

    /// Serializes negotiate exchanges on this transport
    pub(crate) async fn negotiate_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.negotiate_lock.lock().await
    }

    /// Record the negotiation result and apply its limits.
    ///
    /// Fails with `NeedsReconnect` if the stream it was negotiated on is gone.
    pub fn set_negotiation(&self, generation: u64, negotiation: Negotiation) -> Result<()> {
        let mut state = lock(&self.state);
        if state.generation != generation || state.status != ConnectionStatus::Good {
            return Err(CifsError::NeedsReconnect);
        }
        state.max_frame_size = negotiation.caps.max_frame_size;
        self.pending.set_limit(negotiation.caps.max_in_flight);
        tracing::debug!(
            endpoint = %self.endpoint,
            dialect = format_args!("0x{:04X}", negotiation.caps.dialect),
            max_frame_size = negotiation.caps.max_frame_size,
            max_in_flight = negotiation.caps.max_in_flight,
            "Negotiated"
        );
        state.negotiation = Some(negotiation);
        Ok(())
    }

    /// Register an object to be invalidated on reconnect
    pub fn register_dependent(&self, dependent: Weak<dyn Dependent>) {
        let mut dependents = lock(&self.dependents);
        dependents.retain(|d| d.strong_count() > 0);
        dependents.push(dependent);
    }

    fn invalidate_dependents(&self) {
        let live: Vec<Arc<dyn Dependent>> = lock(&self.dependents)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for dependent in live {
            dependent.invalidate();
        }
    }

    /// Subscribe to unsolicited notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    fn publish(&self, state: &State) {
        self.status_tx.send_replace(Snapshot {
            status: state.status,
            generation: state.generation,
        });
    }

    /// Open the stream if it is not already open.
    ///
    /// Returns immediately when the transport is Good. If a recovery loop is
    /// running, waits for it instead of racing it. Spawns the Frame Reader
    /// on first success.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (status, recovering) = {
            let state = lock(&self.state);
            (state.status, state.recovering)
        };
        match status {
            ConnectionStatus::Good => return Ok(()),
            ConnectionStatus::Exiting => return Err(CifsError::Exiting),
            ConnectionStatus::NeedsReconnect if recovering => {
                return self.wait_recovery().await;
            }
            ConnectionStatus::NeedsReconnect => {}
        }

        let guard = self.connect_lock.lock().await;
        let (status, recovering) = {
            let state = lock(&self.state);
            (state.status, state.recovering)
        };
        match status {
            ConnectionStatus::Good => return Ok(()),
            ConnectionStatus::Exiting => return Err(CifsError::Exiting),
            ConnectionStatus::NeedsReconnect if recovering => {
                drop(guard);
                return self.wait_recovery().await;
            }
            ConnectionStatus::NeedsReconnect => {}
        }

        let stream = self.connector.connect().await?;
        self.install(stream).await?;
        self.spawn_reader();
        tracing::info!(endpoint = %self.endpoint, "Transport connected");
        Ok(())
    }

    /// Wait for a running recovery, bounded by the request timeout.
    async fn wait_recovery(&self) -> Result<()> {
        let bound = self.config.request_timeout();
        tokio::time::timeout(bound, self.wait_ready())
            .await
            .map_err(|_| CifsError::Timeout(bound))?
    }

    /// Hand a fresh stream to the writer and the Frame Reader and start a
    /// new generation.
    async fn install(&self, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut writer = self.writer.lock().await;

        let mut state = lock(&self.state);
        if state.status == ConnectionStatus::Exiting {
            return Err(CifsError::Exiting);
        }
        state.generation += 1;
        state.status = ConnectionStatus::Good;
        state.recovering = false;
        state.negotiation = None;
        state.max_frame_size = self.config.frame_limit();
        self.pending.set_limit(usize::from(self.config.max_in_flight));

        *writer = Some(write_half);
        *lock(&self.read_half) = Some((state.generation, read_half));
        self.publish(&state);
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>) {
        if self
            .reader_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(Arc::clone(self).run_reader());
        }
    }

    /// Take the read half installed for the current generation.
    fn take_read_half(&self) -> Option<(u64, OwnedReadHalf)> {
        lock(&self.read_half).take()
    }

    /// Wait until the transport is Good (Ok) or Exiting (Err).
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.status_tx.subscribe();
        loop {
            let snapshot = *rx.borrow_and_update();
            match snapshot.status {
                ConnectionStatus::Good => return Ok(()),
                ConnectionStatus::Exiting => return Err(CifsError::Exiting),
                ConnectionStatus::NeedsReconnect => {}
            }
            if rx.changed().await.is_err() {
                return Err(CifsError::Exiting);
            }
        }
    }

    /// Re-establish the stream of the current generation.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        let generation = self.generation();
        self.reconnect_from(generation).await
    }

    /// Re-establish the stream, unless `generation` has already been
    /// replaced.
    ///
    /// Only one recovery loop runs at a time: a caller that finds one in
    /// progress waits for it to finish. Dependents are invalidated before
    /// the old stream is closed. Connect attempts repeat with a fixed delay
    /// until one succeeds or the transport is shut down.
    pub async fn reconnect_from(self: &Arc<Self>, generation: u64) -> Result<()> {
        let already_recovering = {
            let mut state = lock(&self.state);
            if state.status == ConnectionStatus::Exiting {
                return Err(CifsError::Exiting);
            }
            if state.generation != generation {
                return Ok(());
            }
            if !state.recovering {
                state.status = ConnectionStatus::NeedsReconnect;
                state.recovering = true;
                self.publish(&state);
                false
            } else {
                true
            }
        };
        if already_recovering {
            return self.wait_ready().await;
        }

        self.recoveries.fetch_add(1, Ordering::AcqRel);
        tracing::info!(endpoint = %self.endpoint, generation, "Reconnecting transport");

        self.invalidate_dependents();
        {
            let _guard = self.connect_lock.lock().await;
            if self.generation() != generation {
                // A concurrent connect already installed a stream
                return Ok(());
            }
            self.close_stream().await;
        }

        let delay = self.config.reconnect_delay();
        let mut watch = self.status_tx.subscribe();
        let mut attempts = 0u32;

        loop {
            if self.status() == ConnectionStatus::Exiting {
                return Err(CifsError::Exiting);
            }

            attempts += 1;
            let guard = self.connect_lock.lock().await;
            if self.generation() != generation {
                // A concurrent connect already installed a stream
                return Ok(());
            }
            match self.connector.connect().await {
                Ok(stream) => {
                    self.install(stream).await?;
                    drop(guard);
                    self.spawn_reader();
                    tracing::info!(
                        endpoint = %self.endpoint,
                        attempts,
                        generation = self.generation(),
                        "Transport reconnected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    drop(guard);
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        attempts,
                        error = %e,
                        "Reconnect attempt failed, retrying in {:?}",
                        delay
                    );
                }
            }

            watch.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = watch.changed() => {}
            }
        }
    }

    /// Start a recovery in the background, for paths that must not block.
    pub(crate) fn spawn_reconnect(self: &Arc<Self>, generation: u64) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = transport.reconnect_from(generation).await {
                tracing::debug!(error = %e, "Background reconnect ended");
            }
        });
    }

    /// Writers watch the status and release the lock once it leaves Good,
    /// so callers must publish the new status first.
    async fn close_stream(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        lock(&self.read_half).take();
    }

    /// Shut the transport down for good.
    ///
    /// The Frame Reader exits once it observes the status. If requests are
    /// still registered, the transport stays alive as long as their callers
    /// hold it and a leak warning is logged.
    pub async fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if state.status == ConnectionStatus::Exiting {
                return;
            }
            state.status = ConnectionStatus::Exiting;
            state.recovering = false;
            self.publish(&state);
        }

        self.close_stream().await;

        let outstanding = self.pending.len();
        if outstanding > 0 {
            tracing::warn!(
                endpoint = %self.endpoint,
                outstanding,
                "Transport exiting with pending requests; keeping it alive until they are abandoned"
            );
        } else {
            tracing::info!(endpoint = %self.endpoint, "Transport shut down");
        }
    }

    /// Send an unsigned request and wait for its response.
    pub async fn request(self: &Arc<Self>, frame: Frame) -> Result<Frame> {
        self.request_signed(frame, None).await
    }

    /// Send a request, optionally signed, and wait for its response.
    ///
    /// The tag is assigned here. The wait ends with the matching response,
    /// the request timeout (retryable, no reconnect), the transport coming
    /// back in a new generation (`NeedsReconnect`, retryable) or shutdown
    /// (`Exiting`). While a recovery is running the entry stays registered.
    pub async fn request_signed(
        self: &Arc<Self>,
        mut frame: Frame,
        signer: Option<&dyn FrameSigner>,
    ) -> Result<Frame> {
        let Snapshot { status, generation } = self.snapshot();
        match status {
            ConnectionStatus::Good => {}
            ConnectionStatus::NeedsReconnect => return Err(CifsError::NeedsReconnect),
            ConnectionStatus::Exiting => return Err(CifsError::Exiting),
        }

        let mut pending = self.pending.register(frame.header.command)?;
        frame.header.tag = pending.tag();

        let mut body = frame.to_body();
        if body.len() > self.max_frame_size() {
            return Err(CifsError::InvalidMessage(format!(
                "Request of {} bytes exceeds frame limit {}",
                body.len(),
                self.max_frame_size()
            )));
        }

        let seq = self.write_body(&mut body, signer, generation).await?;
        let response = self.wait_response(&mut pending, generation).await?;
        drop(pending);

        if let (Some(signer), Some(seq)) = (signer, seq) {
            if let Err(e) = signer.verify_response(seq, &response) {
                tracing::warn!(tag = response.header.tag, error = %e, "Response signature rejected");
                self.spawn_reconnect(generation);
                return Err(e);
            }
        }
        Ok(response)
    }

    /// Write one request body under the writer lock.
    ///
    /// Both waiting for the lock and the write itself are bounded by the
    /// request timeout, and both give up as soon as the stream is retired by
    /// shutdown or recovery. A write that fails or stalls leaves the stream
    /// in an unknown state, so it starts a recovery.
    async fn write_body(
        self: &Arc<Self>,
        body: &mut BytesMut,
        signer: Option<&dyn FrameSigner>,
        generation: u64,
    ) -> Result<Option<u64>> {
        let prefix = Prefix::session(body.len())?;
        let timeout = self.config.request_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut watch = self.status_tx.subscribe();

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = &mut deadline => return Err(CifsError::Timeout(timeout)),
            err = stream_retired(&mut watch, generation) => return Err(err),
        };
        if self.generation() != generation {
            return Err(CifsError::NeedsReconnect);
        }
        let Some(stream) = writer.as_mut() else {
            return Err(CifsError::NeedsReconnect);
        };

        let seq = signer.map(|s| s.sign_request(body));
        seal(body);

        let mut wire = BytesMut::with_capacity(PREFIX_SIZE + body.len());
        wire.put_slice(&prefix);
        wire.put_slice(body);

        let failure = tokio::select! {
            written = stream.write_all(&wire) => match written {
                Ok(()) => return Ok(seq),
                Err(e) => format!("Write failed: {e}"),
            },
            _ = &mut deadline => format!("Write stalled for {timeout:?}"),
            err = stream_retired(&mut watch, generation) => return Err(err),
        };

        drop(writer);
        tracing::warn!(endpoint = %self.endpoint, generation, reason = %failure, "Dropping stream");
        self.spawn_reconnect(generation);
        Err(CifsError::Transport(failure))
    }

    async fn wait_response(
        &self,
        pending: &mut PendingRequest,
        generation: u64,
    ) -> Result<Frame> {
        let tag = pending.tag();
        let timeout = self.config.request_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut watch = self.status_tx.subscribe();

        loop {
            tokio::select! {
                response = pending.response() => {
                    return response.map_err(|_| CifsError::Cancelled);
                }
                _ = &mut deadline => {
                    tracing::debug!(tag, "Request timed out");
                    return Err(CifsError::Timeout(timeout));
                }
                changed = watch.changed() => {
                    if changed.is_err() {
                        return Err(CifsError::Exiting);
                    }
                    let snapshot = *watch.borrow_and_update();
                    match snapshot.status {
                        ConnectionStatus::Exiting => return Err(CifsError::Exiting),
                        ConnectionStatus::Good if snapshot.generation != generation => {
                            return Err(CifsError::NeedsReconnect);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Round-trip an Echo and return the elapsed time
    pub async fn echo(self: &Arc<Self>) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .request(Frame::new(Header::request(Command::Echo), Bytes::new()))
            .await?;
        if !response.header.status.is_success() {
            return Err(CifsError::Remote {
                command: Command::Echo,
                status: response.header.status,
            });
        }
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CapabilityFlags, DIALECT_3_1};

    fn transport() -> Arc<Transport> {
        Transport::new(
            Endpoint::with_port("127.0.0.1", 1),
            ConnectionConfig::new("127.0.0.1"),
        )
    }

    fn negotiation(max_frame_size: usize, max_in_flight: usize) -> Negotiation {
        Negotiation {
            caps: NegotiatedCaps {
                dialect: DIALECT_3_1,
                flags: CapabilityFlags::new(),
                signing: false,
                max_frame_size,
                max_in_flight,
            },
            challenge: [0; CHALLENGE_SIZE],
            server_guid: [0; GUID_SIZE],
        }
    }

    struct Flag(Mutex<bool>);

    impl Dependent for Flag {
        fn invalidate(&self) {
            *lock(&self.0) = true;
        }
    }

    #[test]
    fn test_new_transport_is_unconnected() {
        let t = transport();
        assert_eq!(t.status(), ConnectionStatus::NeedsReconnect);
        assert_eq!(t.generation(), 0);
        assert_eq!(t.reader_count(), 0);
        assert!(t.negotiation().is_none());
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let t = transport();
        let frame = Frame::new(Header::request(Command::Echo), Bytes::new());
        let err = t.request(frame).await.unwrap_err();
        assert!(matches!(err, CifsError::NeedsReconnect));
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let t = transport();
        t.shutdown().await;
        t.shutdown().await;
        assert_eq!(t.status(), ConnectionStatus::Exiting);
        assert!(matches!(t.connect().await, Err(CifsError::Exiting)));
        assert!(matches!(t.reconnect().await, Err(CifsError::Exiting)));
        assert!(matches!(t.wait_ready().await, Err(CifsError::Exiting)));
    }

    #[test]
    fn test_negotiation_needs_live_generation() {
        let t = transport();
        let err = t.set_negotiation(0, negotiation(4096, 4)).unwrap_err();
        assert!(matches!(err, CifsError::NeedsReconnect));
        assert!(t.negotiation().is_none());
    }

    #[test]
    fn test_dependents_invalidated() {
        let t = transport();
        let flag = Arc::new(Flag(Mutex::new(false)));
        let weak: Weak<dyn Dependent> = Arc::downgrade(&flag) as Weak<dyn Dependent>;
        t.register_dependent(weak);

        t.invalidate_dependents();
        assert!(*lock(&flag.0));

        // Dropped dependents are skipped
        drop(flag);
        t.invalidate_dependents();
    }

    #[tokio::test]
    async fn test_status_watch() {
        let t = transport();
        let rx = t.watch();
        t.shutdown().await;
        assert_eq!(rx.borrow().status, ConnectionStatus::Exiting);
    }
}
