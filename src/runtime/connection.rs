//! Connection state and the bounded connection registry.
//!
//! Each connection tracks its lifecycle state (pending handshake or
//! approved), its inbound bytes not yet framed, and its outbound bytes not
//! yet written. The registry owns every live connection; once a connection
//! is released it is gone, and nothing else holds on to it.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};

use crate::error::{RelayError, Result};
use crate::runtime::approval::ApprovalState;
use crate::runtime::buffer::{FlushStatus, OutboundBuffer};
use crate::runtime::codec::decode_frame;

/// Identifier assigned at accept time. Never reused, unlike slots.
pub type ConnectionId = u64;

/// Bytes pulled from the socket per read call.
const READ_CHUNK: usize = 4096;

/// Lifecycle state of a live connection.
///
/// There is no `Closed` variant: a closed connection is one the registry no
/// longer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Going through the name handshake.
    Pending(ApprovalState),
    /// Admitted to broadcast under this display name.
    Approved { name: Bytes },
}

impl ConnState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnState::Pending(_) => "pending",
            ConnState::Approved { .. } => "approved",
        }
    }
}

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Read this many bytes into the inbound buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// Peer closed its side.
    Eof,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    id: ConnectionId,
    stream: S,
    state: ConnState,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    /// Received bytes not yet split into frames.
    inbound: BytesMut,
    outbound: OutboundBuffer,
    /// Whether the poller is currently watching for writability.
    pub(crate) write_interest: bool,
}

impl<S> Connection<S> {
    /// Create a new connection awaiting its name.
    pub fn new(
        id: ConnectionId,
        stream: S,
        peer: Option<SocketAddr>,
        max_pending_output: usize,
    ) -> Self {
        Self {
            id,
            stream,
            state: ConnState::Pending(ApprovalState::AwaitingName),
            peer,
            connected_at: Utc::now(),
            inbound: BytesMut::new(),
            outbound: OutboundBuffer::new(max_pending_output),
            write_interest: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConnState {
        &mut self.state
    }

    /// Display name, once approved.
    pub fn name(&self) -> Option<&Bytes> {
        match &self.state {
            ConnState::Approved { name } => Some(name),
            ConnState::Pending(_) => None,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self.state, ConnState::Approved { .. })
    }

    /// Admit the connection under `name`, dropping any handshake record.
    pub fn approve(&mut self, name: Bytes) {
        self.state = ConnState::Approved { name };
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes queued but not yet written.
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Check if frames are still waiting for the socket.
    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Split the next complete frame off the inbound buffer.
    pub fn next_message(&mut self, max_len: usize) -> Result<Option<Bytes>> {
        decode_frame(&mut self.inbound, max_len)
    }
}

impl<S: Read> Connection<S> {
    /// Read one chunk from the socket into the inbound buffer.
    pub fn fill(&mut self) -> Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    return Ok(Fill::Data(n));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<S: Write> Connection<S> {
    /// Queue one message and push out as much as the socket takes.
    ///
    /// Whatever does not fit now is written on the next writable event, in
    /// order, ahead of anything queued later.
    pub fn send(&mut self, payload: &[u8]) -> Result<FlushStatus> {
        self.outbound.push_frame(payload)?;
        self.flush()
    }

    /// Continue writing queued output.
    pub fn flush(&mut self) -> Result<FlushStatus> {
        self.outbound.flush_into(&mut self.stream)
    }
}

/// Registry of live connections using slab allocation.
///
/// Slots are reused after release; connection ids are not. Code that
/// remembers a slot across a call that may release connections should check
/// `is_live(slot, id)` before touching it again.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
    max_pending_output: usize,
    next_id: ConnectionId,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize, max_pending_output: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
            max_pending_output,
            // 0 is the "everyone" entry in the roster
            next_id: 1,
        }
    }

    /// Take ownership of a freshly accepted stream.
    ///
    /// Fails with `RegistryFull` when every slot is taken; the stream is
    /// dropped (and so closed) in that case.
    pub fn accept(&mut self, stream: S, peer: Option<SocketAddr>) -> Result<usize> {
        if self.connections.len() >= self.max_connections {
            return Err(RelayError::RegistryFull {
                capacity: self.max_connections,
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(self
            .connections
            .insert(Connection::new(id, stream, peer, self.max_pending_output)))
    }

    /// Remove a connection, freeing its slot.
    ///
    /// Returns `None` if the slot was already free. Dropping the returned
    /// connection closes its stream.
    pub fn release(&mut self, slot: usize) -> Option<Connection<S>> {
        self.connections.try_remove(slot)
    }

    /// Remove every connection.
    pub fn release_all(&mut self) -> Vec<Connection<S>> {
        self.connections.drain().collect()
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, slot: usize) -> Option<&Connection<S>> {
        self.connections.get(slot)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(slot)
    }

    /// Check if a connection occupies the slot.
    #[cfg(test)]
    pub fn contains(&self, slot: usize) -> bool {
        self.connections.contains(slot)
    }

    /// Check that `slot` still holds the connection known as `id`.
    pub fn is_live(&self, slot: usize, id: ConnectionId) -> bool {
        self.connections.get(slot).is_some_and(|conn| conn.id == id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Id and name of every approved connection except the one in `except`.
    pub fn roster(&self, except: usize) -> Vec<(ConnectionId, Bytes)> {
        self.connections
            .iter()
            .filter(|(slot, _)| *slot != except)
            .filter_map(|(_, conn)| conn.name().map(|name| (conn.id, name.clone())))
            .collect()
    }

    /// Apply `f` to every approved connection in slot order.
    ///
    /// The approved set is captured before the first call, so connections
    /// approved by `f` itself are not visited. When `f` fails for a
    /// connection, that connection is released and iteration carries on with
    /// the next one. Released connections are returned with their error.
    pub fn for_each_approved<F>(&mut self, mut f: F) -> Vec<(Connection<S>, RelayError)>
    where
        F: FnMut(usize, &mut Connection<S>) -> Result<()>,
    {
        let snapshot: Vec<(usize, ConnectionId)> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_approved())
            .map(|(slot, conn)| (slot, conn.id))
            .collect();

        let mut released = Vec::new();
        for (slot, id) in snapshot {
            if !self.is_live(slot, id) {
                continue;
            }
            let conn = &mut self.connections[slot];
            if let Err(e) = f(slot, conn) {
                if let Some(conn) = self.release(slot) {
                    released.push((conn, e));
                }
            }
        }
        released
    }
}

impl<S> Index<usize> for ConnectionRegistry<S> {
    type Output = Connection<S>;

    /// Panics if the slot is free.
    fn index(&self, slot: usize) -> &Connection<S> {
        &self.connections[slot]
    }
}

impl<S> IndexMut<usize> for ConnectionRegistry<S> {
    fn index_mut(&mut self, slot: usize) -> &mut Connection<S> {
        &mut self.connections[slot]
    }
}
