//! Two-message name handshake.
//!
//! ```text
//! AwaitingName --name--> AwaitingConfirmation --exact ack--> Approved
//!                                 |
//!                                 +--anything else--> Rejected
//! ```
//!
//! The first message is taken verbatim as the display name. No validation
//! and no uniqueness check: two users may share a name. The server answers
//! with `User <name> approved!` and the client must send that exact text
//! back. Any difference is a rejection; there is no second try.

use bytes::{BufMut, Bytes, BytesMut};

use crate::runtime::connection::ConnectionId;

const ACK_PREFIX: &[u8] = b"User ";
const ACK_SUFFIX: &[u8] = b" approved!";

/// Bytes the acknowledgment adds around the name.
pub const ACK_OVERHEAD: usize = ACK_PREFIX.len() + ACK_SUFFIX.len();

pub const WELCOME_BANNER: &str =
    "Welcome to the chat relay! Active users available for messaging:";

/// Roster entry standing for "everyone".
pub const BROADCAST_ENTRY: &str = "0 - Send to all users";

/// Last message of the welcome sequence.
pub const INSTRUCTIONS: &str =
    "Type a message and press enter to send it to every other user.";

/// The acknowledgment a client must echo to finish the handshake.
pub fn acknowledgment(name: &[u8]) -> Bytes {
    let mut ack = BytesMut::with_capacity(ACK_OVERHEAD + name.len());
    ack.put_slice(ACK_PREFIX);
    ack.put_slice(name);
    ack.put_slice(ACK_SUFFIX);
    ack.freeze()
}

/// First message a new connection receives.
pub fn prompt(id: ConnectionId, max_name_len: usize) -> Bytes {
    Bytes::from(format!(
        "Welcome, client {id}! Type a user name of up to {max_name_len} bytes to be approved on the relay."
    ))
}

/// Messages sent once a connection is approved, in order.
///
/// `roster` lists every *other* approved connection.
pub fn welcome_messages<'a, I>(roster: I) -> Vec<Bytes>
where
    I: IntoIterator<Item = (ConnectionId, &'a Bytes)>,
{
    let mut messages = vec![
        Bytes::from_static(WELCOME_BANNER.as_bytes()),
        Bytes::from_static(BROADCAST_ENTRY.as_bytes()),
    ];
    for (id, name) in roster {
        let mut line = BytesMut::from(format!("{id} - ").as_bytes());
        line.put_slice(name);
        messages.push(line.freeze());
    }
    messages.push(Bytes::from_static(INSTRUCTIONS.as_bytes()));
    messages
}

/// Candidate name plus the exact text we expect back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRecord {
    pub name: Bytes,
    pub ack: Bytes,
}

/// Handshake progress of a pending connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApprovalState {
    #[default]
    AwaitingName,
    AwaitingConfirmation(ApprovalRecord),
}

/// What the caller must do after feeding one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this acknowledgment back and wait for the confirmation.
    Acknowledge(Bytes),
    /// Handshake complete under this name.
    Approve(Bytes),
    /// Confirmation did not match; release the connection.
    Reject,
}

impl ApprovalState {
    /// Feed the next message received from the connection.
    pub fn advance(&mut self, message: Bytes) -> Step {
        match std::mem::take(self) {
            ApprovalState::AwaitingName => {
                let ack = acknowledgment(&message);
                *self = ApprovalState::AwaitingConfirmation(ApprovalRecord {
                    name: message,
                    ack: ack.clone(),
                });
                Step::Acknowledge(ack)
            }
            ApprovalState::AwaitingConfirmation(record) => {
                if message == record.ack {
                    Step::Approve(record.name)
                } else {
                    Step::Reject
                }
            }
        }
    }

    /// Largest message accepted in this state.
    pub fn max_inbound(&self, max_name_len: usize, max_message_len: usize) -> usize {
        match self {
            ApprovalState::AwaitingName => max_name_len,
            ApprovalState::AwaitingConfirmation(_) => max_message_len,
        }
    }
}
