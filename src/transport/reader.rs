//! Frame Reader / demultiplexer.
//!
//! One task per transport, started on the first successful connect:
//!
//! ```text
//! ReadHeader ─► ValidateLength ─► ReadBody ─► Dispatch ─┐
//!     ▲                │                                │
//!     │                └─ out of range: reconnect ──────┤
//!     └─────────────────────────────────────────────────┘
//!                                        Exiting ─► Exited
//! ```
//!
//! Bytes are accumulated in a buffer and the length prefix is inspected
//! before any body byte is consumed. A prefix outside
//! `[HEADER_SIZE, max_frame_size]` is never read past: the stream is
//! dropped and the transport reconnects. Checksum failures are treated the
//! same way. A stream retired by shutdown or recovery is drained first:
//! responses already received are still delivered.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;

use super::{ConnectionStatus, Delivery, Notification, Snapshot, Transport};
use crate::error::{CifsError, Result};
use crate::protocol::{
    peek_tag, validate_length, Command, Frame, OplockBreak, Prefix, HEADER_SIZE,
    NOTIFICATION_TAG, PREFIX_SIZE,
};

const READ_BUFFER_SIZE: usize = 16 * 1024;

impl Transport {
    /// Reader task body. Runs until the transport is shut down.
    pub(super) async fn run_reader(self: Arc<Self>) {
        self.readers.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        tracing::debug!(endpoint = %self.endpoint, "Frame reader started");

        let mut status_rx = self.status_tx.subscribe();
        loop {
            let snapshot = *status_rx.borrow_and_update();
            if snapshot.status == ConnectionStatus::Exiting {
                break;
            }

            let Some((generation, half)) = self.take_read_half() else {
                if status_rx.changed().await.is_err() {
                    break;
                }
                continue;
            };
            if generation != self.generation() {
                // Superseded before we picked it up
                continue;
            }

            match self.read_stream(half, generation, &mut status_rx).await {
                Ok(()) => {}
                Err(e) => {
                    if self.status() == ConnectionStatus::Exiting {
                        break;
                    }
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        generation,
                        error = %e,
                        "Frame reader lost the stream"
                    );
                    if let Err(CifsError::Exiting) = self.reconnect_from(generation).await {
                        break;
                    }
                }
            }
        }

        self.readers.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        tracing::debug!(endpoint = %self.endpoint, "Frame reader exited");
    }

    /// Read and dispatch frames from one stream incarnation.
    ///
    /// `Ok` means the stream was retired by someone else (shutdown or a
    /// recovery started on the write side); `Err` means this reader found it
    /// broken.
    async fn read_stream(
        &self,
        mut half: OwnedReadHalf,
        generation: u64,
        status_rx: &mut watch::Receiver<Snapshot>,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            self.dispatch_buffered(&mut buf)?;

            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        self.drain(&half, &mut buf);
                        return Ok(());
                    }
                    let snapshot = *status_rx.borrow_and_update();
                    if snapshot.status != ConnectionStatus::Good || snapshot.generation != generation {
                        self.drain(&half, &mut buf);
                        return Ok(());
                    }
                }
                read = half.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            return Err(CifsError::Transport("Connection closed by peer".to_string()));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    fn dispatch_buffered(&self, buf: &mut BytesMut) -> Result<()> {
        while let Some(body) = self.next_body(buf)? {
            self.dispatch(body)?;
        }
        Ok(())
    }

    /// Deliver what a retired stream already holds, without waiting for
    /// more bytes.
    fn drain(&self, half: &OwnedReadHalf, buf: &mut BytesMut) {
        loop {
            if let Err(e) = self.dispatch_buffered(buf) {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Stopped draining retired stream");
                return;
            }
            match half.try_read_buf(buf) {
                Ok(n) if n > 0 => {}
                _ => return,
            }
        }
    }

    /// Split the next complete body off the buffer, skipping keepalives.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    fn next_body(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            if buf.len() < PREFIX_SIZE {
                return Ok(None);
            }

            match Prefix::parse([buf[0], buf[1], buf[2], buf[3]])? {
                Prefix::Keepalive(len) => {
                    if len > HEADER_SIZE {
                        return Err(CifsError::Protocol(format!(
                            "Keepalive with {len} byte body"
                        )));
                    }
                    if buf.len() < PREFIX_SIZE + len {
                        return Ok(None);
                    }
                    buf.advance(PREFIX_SIZE + len);
                    tracing::trace!(endpoint = %self.endpoint, "Keepalive discarded");
                }
                Prefix::Session(len) => {
                    validate_length(len, self.max_frame_size())?;
                    let total = PREFIX_SIZE + len;
                    if buf.len() < total {
                        buf.reserve(total - buf.len());
                        return Ok(None);
                    }
                    buf.advance(PREFIX_SIZE);
                    return Ok(Some(buf.split_to(len).freeze()));
                }
            }
        }
    }

    /// Route one body to its waiting caller or the notification channel.
    fn dispatch(&self, body: Bytes) -> Result<()> {
        let frame = match Frame::decode(body.clone()) {
            Ok(frame) => frame,
            Err(CifsError::InvalidMessage(reason)) => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    tag = ?peek_tag(&body),
                    %reason,
                    "Discarding undecodable frame"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, tag = ?peek_tag(&body), error = %e, "Corrupt frame");
                return Err(e);
            }
        };

        let header = &frame.header;
        if !header.is_response() {
            tracing::warn!(
                endpoint = %self.endpoint,
                command = ?header.command,
                "Discarding request-shaped frame from server"
            );
            return Ok(());
        }
        if header.is_interim() {
            tracing::debug!(tag = header.tag, "Interim response, still waiting");
            return Ok(());
        }

        let tag = header.tag;
        let unsolicited = tag == NOTIFICATION_TAG
            || (header.command.is_notification() && self.pending.state(tag).is_none());
        if unsolicited {
            self.notify(frame);
            return Ok(());
        }

        match self.pending.complete(frame) {
            Delivery::Delivered => {}
            Delivery::Unmatched => {
                tracing::debug!(tag, "No pending request for tag, dropping response");
            }
            Delivery::Duplicate => {
                tracing::debug!(tag, "Duplicate response dropped");
            }
        }
        Ok(())
    }

    fn notify(&self, frame: Frame) {
        match frame.header.command {
            Command::OplockBreak => match OplockBreak::decode(frame.payload) {
                Ok(brk) => {
                    tracing::debug!(file_id = brk.file_id, level = brk.new_level, "Oplock break");
                    // No subscribers is fine
                    let _ = self.notifications.send(Notification::OplockBreak {
                        session_id: frame.header.session_id,
                        tree_id: frame.header.tree_id,
                        brk,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed oplock break discarded");
                }
            },
            other => {
                tracing::debug!(command = ?other, "Unsolicited frame discarded");
            }
        }
    }
}
