//! Per-connection dispatch: handshake steps, broadcast, and teardown.
//!
//! `Relay` is independent of the poller. The event loop tells it which slot
//! became readable or writable; the relay reads, frames, advances the
//! handshake or broadcasts, and records two things for the loop to act on:
//! connections it released (to deregister and drop) and slots whose
//! outbound backlog changed (to adjust write interest).
//!
//! A readable event dispatches at most `FRAMES_PER_EVENT` messages. A sender
//! with more queued goes on the ready list and is resumed on the next pass
//! of the event loop, after everyone else has had a turn.

use bytes::Bytes;
use chrono::Utc;
use std::io::{Read, Write};
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::runtime::approval::{prompt, welcome_messages, Step};
use crate::runtime::broadcast::broadcast;
use crate::runtime::connection::{ConnState, Connection, ConnectionId, ConnectionRegistry, Fill};

/// Messages dispatched per readable event before yielding to the loop.
pub const FRAMES_PER_EVENT: usize = 16;

/// Where `drain_inbound` stopped.
enum Drain {
    /// No complete frame left in the inbound buffer.
    Empty,
    /// Out of budget with frames possibly still buffered.
    Exhausted,
    /// The connection was released.
    Gone,
}

pub struct Relay<S> {
    registry: ConnectionRegistry<S>,
    max_name_len: usize,
    max_message_len: usize,
    /// Released connections not yet handed back to the event loop.
    closed: Vec<Connection<S>>,
    /// Slots whose outbound buffer may have changed.
    dirty: Vec<usize>,
    /// Senders that ran out of budget with input left to process.
    ready: Vec<(usize, ConnectionId)>,
}

impl<S> Relay<S> {
    pub fn new(config: &Config) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.max_clients, config.max_pending_output),
            max_name_len: config.max_name_len,
            max_message_len: config.max_message_len,
            closed: Vec::new(),
            dirty: Vec::new(),
            ready: Vec::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry<S> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry<S> {
        &mut self.registry
    }

    /// Connections released since the last call.
    pub fn take_closed(&mut self) -> Vec<Connection<S>> {
        std::mem::take(&mut self.closed)
    }

    /// Slots whose write interest may need updating, deduplicated.
    pub fn take_dirty(&mut self) -> Vec<usize> {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        dirty
    }

    /// Check if some sender still has input to process without waiting for
    /// a new readiness event.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Release the connection in `slot` because of `reason`.
    ///
    /// A no-op if the slot is already free.
    pub fn release(&mut self, slot: usize, reason: RelayError) {
        if let Some(conn) = self.registry.release(slot) {
            self.retire(conn, reason);
        }
    }

    /// Release every connection.
    pub fn shutdown(&mut self) -> usize {
        self.ready.clear();
        let all = self.registry.release_all();
        let count = all.len();
        for conn in all {
            debug!(conn_id = conn.id(), "Closing connection for shutdown");
            self.closed.push(conn);
        }
        count
    }

    fn retire(&mut self, conn: Connection<S>, reason: RelayError) {
        let connected_secs = (Utc::now() - conn.connected_at()).num_seconds();
        let peer = conn.peer().map(|p| p.to_string()).unwrap_or_default();
        match &reason {
            RelayError::ConnectionClosed | RelayError::Io(_) => debug!(
                conn_id = conn.id(),
                peer,
                state = conn.state().label(),
                connected_secs,
                kind = reason.kind(),
                reason = %reason,
                "Connection released"
            ),
            _ => warn!(
                conn_id = conn.id(),
                peer,
                state = conn.state().label(),
                connected_secs,
                kind = reason.kind(),
                reason = %reason,
                "Connection released"
            ),
        }
        self.closed.push(conn);
    }
}

impl<S: Read + Write> Relay<S> {
    /// Register a newly accepted stream and send it the name prompt.
    ///
    /// On `RegistryFull`, or if the prompt cannot be written, the stream is
    /// dropped, which closes it.
    pub fn admit(&mut self, stream: S, peer: Option<SocketAddr>) -> Result<usize> {
        let slot = self.registry.accept(stream, peer)?;
        let conn = &mut self.registry[slot];
        let id = conn.id();
        if let Err(e) = conn.send(&prompt(id, self.max_name_len)) {
            self.registry.release(slot);
            return Err(e);
        }
        self.dirty.push(slot);

        debug!(
            conn_id = id,
            slot,
            clients = self.registry.len(),
            capacity = self.registry.capacity(),
            "Accepted connection"
        );
        Ok(slot)
    }

    /// Read from `slot` and act on each complete message, up to
    /// `FRAMES_PER_EVENT` messages.
    ///
    /// Buffered frames are dispatched before the socket is read again, so
    /// frames that arrived before a FIN are delivered before the release.
    pub fn on_readable(&mut self, slot: usize) {
        let Some(id) = self.registry.get(slot).map(|conn| conn.id()) else {
            return;
        };

        let mut budget = FRAMES_PER_EVENT;
        loop {
            match self.drain_inbound(slot, id, &mut budget) {
                Drain::Empty => {}
                Drain::Exhausted => {
                    trace!(conn_id = id, "Read budget spent, yielding");
                    self.ready.push((slot, id));
                    return;
                }
                Drain::Gone => return,
            }

            let Some(conn) = self.registry.get_mut(slot) else {
                return;
            };
            match conn.fill() {
                Ok(Fill::Data(n)) => trace!(conn_id = id, bytes = n, "Read"),
                Ok(Fill::WouldBlock) => return,
                Ok(Fill::Eof) => {
                    self.release(slot, RelayError::ConnectionClosed);
                    return;
                }
                Err(e) => {
                    self.release(slot, e);
                    return;
                }
            }
        }
    }

    /// Give every sender that ran out of budget another turn.
    pub fn resume_ready(&mut self) {
        for (slot, id) in std::mem::take(&mut self.ready) {
            if self.registry.is_live(slot, id) {
                self.on_readable(slot);
            }
        }
    }

    /// Continue writing a backlog.
    pub fn on_writable(&mut self, slot: usize) {
        let Some(conn) = self.registry.get_mut(slot) else {
            return;
        };
        match conn.flush() {
            Ok(_) => {
                trace!(slot, pending = conn.pending_output(), "Flushed");
                self.dirty.push(slot);
            }
            Err(e) => self.release(slot, e),
        }
    }

    /// Dispatch complete frames buffered on `slot`, in arrival order, while
    /// `budget` lasts.
    fn drain_inbound(&mut self, slot: usize, id: ConnectionId, budget: &mut usize) -> Drain {
        loop {
            if *budget == 0 {
                return Drain::Exhausted;
            }
            let Some(conn) = self.registry.get_mut(slot).filter(|c| c.id() == id) else {
                return Drain::Gone;
            };
            let max_len = match conn.state() {
                ConnState::Pending(approval) => {
                    approval.max_inbound(self.max_name_len, self.max_message_len)
                }
                ConnState::Approved { .. } => self.max_message_len,
            };
            match conn.next_message(max_len) {
                Ok(Some(message)) => {
                    *budget -= 1;
                    self.dispatch(slot, message);
                }
                Ok(None) => return Drain::Empty,
                Err(e) => {
                    self.release(slot, e);
                    return Drain::Gone;
                }
            }
        }
    }

    fn dispatch(&mut self, slot: usize, message: Bytes) {
        let Some(conn) = self.registry.get_mut(slot) else {
            return;
        };
        let id = conn.id();

        let step = match conn.state_mut() {
            ConnState::Pending(approval) => approval.advance(message),
            ConnState::Approved { .. } => return self.relay_message(slot, message),
        };
        match step {
            Step::Acknowledge(ack) => {
                debug!(conn_id = id, "Name received, awaiting confirmation");
                self.send_to(slot, &ack);
            }
            Step::Approve(name) => self.approve(slot, name),
            Step::Reject => self.release(slot, RelayError::HandshakeMismatch),
        }
    }

    fn approve(&mut self, slot: usize, name: Bytes) {
        let roster = self.registry.roster(slot);
        let Some(conn) = self.registry.get_mut(slot) else {
            return;
        };
        conn.approve(name.clone());
        info!(
            conn_id = conn.id(),
            name = %String::from_utf8_lossy(&name),
            users = roster.len() + 1,
            "User approved"
        );

        let welcome = welcome_messages(roster.iter().map(|(id, name)| (*id, name)));
        for message in welcome {
            if !self.send_to(slot, &message) {
                return;
            }
        }
    }

    fn relay_message(&mut self, sender: usize, message: Bytes) {
        let report = broadcast(&mut self.registry, sender, &message);
        trace!(
            slot = sender,
            bytes = message.len(),
            recipients = report.delivered.len(),
            dropped = report.released.len(),
            "Broadcast"
        );
        self.dirty.extend(report.delivered);
        for (conn, reason) in report.released {
            self.retire(conn, reason);
        }
    }

    /// Send one message to `slot`, releasing it on failure.
    fn send_to(&mut self, slot: usize, payload: &[u8]) -> bool {
        let Some(conn) = self.registry.get_mut(slot) else {
            return false;
        };
        match conn.send(payload) {
            Ok(_) => {
                self.dirty.push(slot);
                true
            }
            Err(e) => {
                self.release(slot, e);
                false
            }
        }
    }
}
