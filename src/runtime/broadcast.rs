//! Fan-out of one approved sender's message to every other approved
//! connection.
//!
//! Recipients are visited in registry (slot) order. Each gets its own copy
//! of the full frame, queued behind whatever it already has pending, so
//! messages from one sender reach every recipient in the order sent. A
//! recipient whose write fails is released on the spot and the fan-out
//! carries on; nothing a recipient does can take the sender or the other
//! recipients down.

use bytes::Bytes;
use std::io::Write;

use crate::error::RelayError;
use crate::runtime::connection::{Connection, ConnectionRegistry};

/// What happened to one broadcast.
#[derive(Debug)]
pub struct BroadcastReport<S> {
    /// Slots the message was queued on (written fully or partly).
    pub delivered: Vec<usize>,
    /// Recipients that failed and were released.
    pub released: Vec<(Connection<S>, RelayError)>,
}

/// Deliver `payload` to every approved connection except `sender`.
pub fn broadcast<S: Write>(
    registry: &mut ConnectionRegistry<S>,
    sender: usize,
    payload: &Bytes,
) -> BroadcastReport<S> {
    let mut delivered = Vec::new();
    let released = registry.for_each_approved(|slot, conn| {
        if slot == sender {
            return Ok(());
        }
        conn.send(payload)?;
        delivered.push(slot);
        Ok(())
    });

    BroadcastReport {
        delivered,
        released,
    }
}
