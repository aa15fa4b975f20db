//! Interactive terminal session for the `connect` subcommand.

use chrono::Local;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::ChatClient;
use crate::error::RelayError;
use crate::runtime::codec::{read_frame, write_frame};

/// Lines that end the session instead of being sent.
const QUIT_COMMANDS: [&str; 3] = ["/quit", "S", "s"];

fn is_quit(line: &str) -> bool {
    QUIT_COMMANDS.contains(&line.trim())
}

/// Connect, join under `name` (asking on stdin if absent) and relay lines
/// between the terminal and the server until either side quits.
pub async fn run(
    server: SocketAddr,
    name: Option<String>,
    max_len: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = ChatClient::connect(server, max_len).await?;
    println!("{}", String::from_utf8_lossy(client.prompt().await?));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let name = match name {
        Some(name) => name,
        None => lines.next_line().await?.unwrap_or_default(),
    };

    let welcome = client.join(name.trim_end()).await?;
    println!("{}", String::from_utf8_lossy(&welcome.banner));
    for user in &welcome.users {
        println!("  {}", String::from_utf8_lossy(user));
    }
    println!("{}", String::from_utf8_lossy(&welcome.instructions));
    println!("Type /quit (or S) to leave.");

    let (mut reader, mut writer) = client.into_inner().into_split();
    let (tx, mut rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader, max_len).await;
            let done = frame.is_err();
            if tx.send(frame).await.is_err() || done {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if is_quit(&line) {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                if line.len() > max_len {
                    warn!(len = line.len(), max = max_len, "Message too long, not sent");
                    continue;
                }
                write_frame(&mut writer, line.as_bytes()).await?;
            }
            frame = rx.recv() => match frame {
                Some(Ok(message)) => {
                    println!(
                        "[{}] {}",
                        Local::now().format("%H:%M:%S"),
                        String::from_utf8_lossy(&message)
                    );
                }
                Some(Err(RelayError::ConnectionClosed)) | None => {
                    println!("Server closed the connection");
                    break;
                }
                Some(Err(e)) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }

    reader_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_commands() {
        assert!(is_quit("/quit"));
        assert!(is_quit("S"));
        assert!(is_quit("s"));
        assert!(is_quit("  s "));

        assert!(!is_quit("So long"));
        assert!(!is_quit("/quitting"));
        assert!(!is_quit(""));
    }
}
