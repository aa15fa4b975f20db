//! Client side of the relay protocol.

use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::runtime::approval::{acknowledgment, BROADCAST_ENTRY, INSTRUCTIONS};
use crate::runtime::codec::{read_frame, write_frame};

/// What the server sends once a name is approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub banner: Bytes,
    /// `"<id> - <name>"` for every other approved user.
    pub users: Vec<Bytes>,
    pub instructions: Bytes,
}

/// A connection to a relay server.
#[derive(Debug)]
pub struct ChatClient {
    stream: TcpStream,
    max_len: usize,
    prompt: Option<Bytes>,
}

impl ChatClient {
    /// Connect to `addr`, accepting messages of up to `max_len` bytes.
    pub async fn connect(addr: SocketAddr, max_len: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "Connected");
        Ok(Self {
            stream,
            max_len,
            prompt: None,
        })
    }

    /// The greeting sent on connect, read on first use.
    pub async fn prompt(&mut self) -> Result<&Bytes> {
        if self.prompt.is_none() {
            let prompt = self.recv().await?;
            self.prompt = Some(prompt);
        }
        Ok(self.prompt.get_or_insert_with(Bytes::new))
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Result<Bytes> {
        read_frame(&mut self.stream, self.max_len).await
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, payload).await
    }

    /// Run the client half of the name handshake.
    ///
    /// Fails with `HandshakeMismatch` if the server acknowledges anything
    /// other than the name we sent.
    pub async fn join(&mut self, name: &str) -> Result<Welcome> {
        self.prompt().await?;
        self.send(name.as_bytes()).await?;

        let ack = self.recv().await?;
        if ack != acknowledgment(name.as_bytes()) {
            return Err(RelayError::HandshakeMismatch);
        }
        self.send(&ack).await?;

        let banner = self.recv().await?;
        let mut users = Vec::new();
        loop {
            let line = self.recv().await?;
            if line == INSTRUCTIONS.as_bytes() {
                return Ok(Welcome {
                    banner,
                    users,
                    instructions: line,
                });
            }
            if line != BROADCAST_ENTRY.as_bytes() {
                users.push(line);
            }
        }
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::approval::WELCOME_BANNER;
    use tokio::net::TcpListener;

    /// Accept one connection and play the server side from a script.
    async fn scripted_server(ack: &'static [u8], roster: Vec<&'static [u8]>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(&mut stream, b"Welcome, client 1!").await.unwrap();
            read_frame(&mut stream, 100).await.unwrap();
            write_frame(&mut stream, ack).await.unwrap();
            if read_frame(&mut stream, 400).await.is_err() {
                return;
            }
            write_frame(&mut stream, WELCOME_BANNER.as_bytes()).await.unwrap();
            write_frame(&mut stream, BROADCAST_ENTRY.as_bytes()).await.unwrap();
            for line in roster {
                write_frame(&mut stream, line).await.unwrap();
            }
            write_frame(&mut stream, INSTRUCTIONS.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_join_collects_roster() {
        let addr = scripted_server(b"User zoe approved!", vec![&b"4 - amy"[..], b"9 - ben"]).await;
        let mut client = ChatClient::connect(addr, 400).await.unwrap();

        let welcome = client.join("zoe").await.unwrap();

        assert_eq!(
            client.prompt().await.unwrap(),
            &Bytes::from_static(b"Welcome, client 1!")
        );
        assert_eq!(&welcome.banner[..], WELCOME_BANNER.as_bytes());
        assert_eq!(
            welcome.users,
            vec![Bytes::from_static(b"4 - amy"), Bytes::from_static(b"9 - ben")]
        );
        assert_eq!(&welcome.instructions[..], INSTRUCTIONS.as_bytes());
    }

    #[tokio::test]
    async fn test_join_rejects_wrong_ack() {
        let addr = scripted_server(b"User someone-else approved!", vec![]).await;
        let mut client = ChatClient::connect(addr, 400).await.unwrap();

        let result = client.join("zoe").await;
        assert!(matches!(result, Err(RelayError::HandshakeMismatch)));
    }
}
