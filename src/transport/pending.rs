//! Pending-request table.
//!
//! Maps correlation tags to the caller waiting on them. Each entry is
//! created just before its request is written and removed exactly once,
//! when the caller's [`PendingRequest`] handle is dropped (response
//! consumed, timeout, or abandonment). The Frame Reader only fills in
//! responses; it never removes entries, so a tag stays reserved for as long
//! as its caller holds the handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{CifsError, Result};
use crate::protocol::{Command, Frame, NOTIFICATION_TAG};

/// Lifecycle of a pending entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Request written, response not yet seen
    Sent,
    /// Response handed to the waiting caller
    ResponseReceived,
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    command: Command,
    sent_at: Instant,
    waiter: Option<oneshot::Sender<Frame>>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<u64, Entry>,
    next_tag: u64,
    limit: usize,
}

/// Outcome of offering a response frame to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The waiting caller was woken
    Delivered,
    /// No entry carries this tag (late, abandoned, or unsolicited)
    Unmatched,
    /// The entry already received its response
    Duplicate,
}

/// Tag → waiting caller map, shared by senders and the Frame Reader.
#[derive(Debug, Clone)]
pub struct PendingTable {
    inner: Arc<Mutex<Inner>>,
}

impl PendingTable {
    /// Create a table admitting at most `limit` concurrent entries
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                next_tag: 0,
                limit: limit.max(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries stay consistent across a panicking holder
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a fresh tag for `command`.
    ///
    /// Fails with `ResourceExhausted` when the in-flight limit is reached;
    /// the caller is expected to wait and retry locally.
    pub fn register(&self, command: Command) -> Result<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();

        if inner.entries.len() >= inner.limit {
            return Err(CifsError::ResourceExhausted { limit: inner.limit });
        }

        let mut tag = inner.next_tag;
        while tag == NOTIFICATION_TAG || inner.entries.contains_key(&tag) {
            tag = tag.wrapping_add(1);
        }
        inner.next_tag = tag.wrapping_add(1);

        inner.entries.insert(
            tag,
            Entry {
                state: EntryState::Sent,
                command,
                sent_at: Instant::now(),
                waiter: Some(tx),
            },
        );

        Ok(PendingRequest {
            tag,
            table: self.clone(),
            response: rx,
        })
    }

    /// Hand `frame` to the caller registered under its tag.
    pub fn complete(&self, frame: Frame) -> Delivery {
        let tag = frame.header.tag;
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(&tag) else {
            return Delivery::Unmatched;
        };
        let Some(waiter) = entry.waiter.take() else {
            return Delivery::Duplicate;
        };

        entry.state = EntryState::ResponseReceived;
        if entry.command != frame.header.command {
            tracing::debug!(
                tag,
                expected = ?entry.command,
                got = ?frame.header.command,
                "Response command differs from request"
            );
        }
        tracing::trace!(tag, elapsed = ?entry.sent_at.elapsed(), "Response matched");

        // A dropped receiver means the caller gave up between lookup and send
        let _ = waiter.send(frame);
        Delivery::Delivered
    }

    /// State of the entry registered under `tag`, if any
    pub fn state(&self, tag: u64) -> Option<EntryState> {
        self.lock().entries.get(&tag).map(|e| e.state)
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no entry is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current in-flight limit
    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Apply the negotiated in-flight limit
    pub fn set_limit(&self, limit: usize) {
        self.lock().limit = limit.max(1);
    }

    fn remove(&self, tag: u64) {
        self.lock().entries.remove(&tag);
    }
}

/// A registered request. Dropping it removes the entry.
#[derive(Debug)]
pub struct PendingRequest {
    tag: u64,
    table: PendingTable,
    response: oneshot::Receiver<Frame>,
}

impl PendingRequest {
    /// Correlation tag to stamp into the request header
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Receiver side, polled by the sender while it waits
    pub(crate) fn response(&mut self) -> &mut oneshot::Receiver<Frame> {
        &mut self.response
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.remove(self.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn response(tag: u64, command: Command) -> Frame {
        let mut request = Header::request(command);
        request.tag = tag;
        Frame::new(
            Header::response_to(&request, crate::protocol::Status::Success),
            Bytes::new(),
        )
    }

    #[test]
    fn test_register_and_complete() {
        let table = PendingTable::new(8);
        let mut pending = table.register(Command::Echo).unwrap();
        assert_eq!(table.state(pending.tag()), Some(EntryState::Sent));

        let delivery = table.complete(response(pending.tag(), Command::Echo));
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(
            table.state(pending.tag()),
            Some(EntryState::ResponseReceived)
        );

        let frame = pending.response().try_recv().unwrap();
        assert_eq!(frame.header.tag, pending.tag());

        drop(pending);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_response_dropped() {
        let table = PendingTable::new(8);
        let pending = table.register(Command::Echo).unwrap();
        let tag = pending.tag();

        assert_eq!(table.complete(response(tag, Command::Echo)), Delivery::Delivered);
        assert_eq!(table.complete(response(tag, Command::Echo)), Delivery::Duplicate);
    }

    #[test]
    fn test_unknown_tag_unmatched() {
        let table = PendingTable::new(8);
        assert_eq!(table.complete(response(99, Command::Echo)), Delivery::Unmatched);
    }

    #[test]
    fn test_abandoned_entry_drops_late_response() {
        let table = PendingTable::new(8);
        let pending = table.register(Command::Request).unwrap();
        let tag = pending.tag();
        drop(pending);

        assert_eq!(table.complete(response(tag, Command::Request)), Delivery::Unmatched);
    }

    #[test]
    fn test_limit_enforced() {
        let table = PendingTable::new(2);
        let _a = table.register(Command::Echo).unwrap();
        let b = table.register(Command::Echo).unwrap();
        assert!(matches!(
            table.register(Command::Echo),
            Err(CifsError::ResourceExhausted { limit: 2 })
        ));

        drop(b);
        assert!(table.register(Command::Echo).is_ok());
    }

    #[test]
    fn test_set_limit() {
        let table = PendingTable::new(50);
        table.set_limit(0);
        assert_eq!(table.limit(), 1);
    }

    #[test]
    fn test_notification_tag_never_issued() {
        let table = PendingTable::new(4);
        table.lock().next_tag = NOTIFICATION_TAG - 1;

        let a = table.register(Command::Echo).unwrap();
        let b = table.register(Command::Echo).unwrap();
        assert_eq!(a.tag(), NOTIFICATION_TAG - 1);
        assert_eq!(b.tag(), 0);
    }

    proptest! {
        #[test]
        fn prop_tags_unique_while_registered(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let table = PendingTable::new(64);
            let mut held: Vec<PendingRequest> = Vec::new();

            for register in ops {
                if register || held.is_empty() {
                    if let Ok(p) = table.register(Command::Request) {
                        held.push(p);
                    }
                } else {
                    held.remove(0);
                }

                let tags: HashSet<u64> = held.iter().map(|p| p.tag()).collect();
                prop_assert_eq!(tags.len(), held.len());
                prop_assert_eq!(table.len(), held.len());
                prop_assert!(!tags.contains(&NOTIFICATION_TAG));
            }
        }
    }
}
