//! Per-connection outbound buffering.
//!
//! Sockets are non-blocking, so a frame handed to a connection may only be
//! partly written before the kernel send buffer fills. `OutboundBuffer`
//! holds the unsent tail and resumes from the exact byte it stopped at when
//! the socket becomes writable again. Frames are appended whole and drained
//! strictly in order, so a recipient never sees frames interleave.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};

use crate::error::{RelayError, Result};
use crate::runtime::codec::{encode_frame, LENGTH_PREFIX_LEN};

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything queued has been handed to the kernel.
    Drained,
    /// The socket would block; `remaining` bytes wait for writability.
    Pending { remaining: usize },
}

/// Bounded queue of encoded frames awaiting transmission.
#[derive(Debug)]
pub struct OutboundBuffer {
    pending: BytesMut,
    /// Cap on unsent bytes.
    max_pending: usize,
}

impl OutboundBuffer {
    /// Create an empty buffer that refuses to hold more than `max_pending` bytes.
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_pending,
        }
    }

    /// Frame `payload` and append it.
    ///
    /// Fails with `OutputOverflow` when the frame would push the backlog past
    /// the cap; the buffer is left unchanged in that case.
    pub fn push_frame(&mut self, payload: &[u8]) -> Result<()> {
        let after = self.pending.len() + LENGTH_PREFIX_LEN + payload.len();
        if after > self.max_pending {
            return Err(RelayError::OutputOverflow {
                pending: after,
                max: self.max_pending,
            });
        }
        encode_frame(payload, &mut self.pending)
    }

    /// Write as much as the socket accepts.
    ///
    /// Short writes are retried immediately; `WouldBlock` ends the attempt
    /// with the remainder kept for later. A zero-length write or any other
    /// error means the connection is unusable.
    pub fn flush_into<W: Write>(&mut self, writer: &mut W) -> Result<FlushStatus> {
        while !self.pending.is_empty() {
            match writer.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
                }
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending {
                        remaining: self.pending.len(),
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(FlushStatus::Drained)
    }

    /// Bytes not yet written.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
