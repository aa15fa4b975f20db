//! Relay runtime.
//!
//! The mio event loop owns the sockets; everything below it is generic over
//! `Read + Write` so it can be driven by an in-memory stream in tests:
//! - `codec`: length-prefixed framing
//! - `buffer`: bounded per-connection outbound queue
//! - `connection`: connection state and the slab-backed registry
//! - `approval`: the two-message name handshake
//! - `broadcast`: fan-out to every other approved connection
//! - `relay`: dispatch of readiness to the pieces above

pub mod approval;
mod broadcast;
mod buffer;
pub mod codec;
pub mod connection;
mod event_loop;
mod relay;

#[cfg(test)]
mod mock;

pub use event_loop::{Server, ShutdownHandle};
