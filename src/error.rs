//! Error types for relay connections.
//!
//! Every variant is local to one connection: the runtime releases the
//! offending connection and keeps serving everyone else.

use thiserror::Error;

/// Why a connection stopped being usable.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Peer ended the stream cleanly (zero-byte read).
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Read or write failed at the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every registry slot is taken.
    #[error("registry full ({capacity} connections)")]
    RegistryFull { capacity: usize },

    /// Second handshake message did not match the acknowledgment we sent.
    #[error("handshake confirmation mismatch")]
    HandshakeMismatch,

    /// Declared frame length is above the receiver's limit.
    #[error("message too large: {len} > {max}")]
    MessageTooLarge { len: usize, max: usize },

    /// Peer is not draining its socket and the unsent backlog hit the cap.
    #[error("outbound backlog too large: {pending} > {max}")]
    OutputOverflow { pending: usize, max: usize },
}

impl RelayError {
    /// Short, stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "closed",
            Self::Io(_) => "io",
            Self::RegistryFull { .. } => "registry_full",
            Self::HandshakeMismatch => "handshake_mismatch",
            Self::MessageTooLarge { .. } => "too_large",
            Self::OutputOverflow { .. } => "overflow",
        }
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let err: RelayError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, RelayError::Io(_)));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_display() {
        let err = RelayError::MessageTooLarge { len: 500, max: 400 };
        assert_eq!(err.to_string(), "message too large: 500 > 400");

        let err = RelayError::RegistryFull { capacity: 2 };
        assert_eq!(err.to_string(), "registry full (2 connections)");
    }
}
