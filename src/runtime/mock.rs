//! In-memory stream for exercising the connection machinery without sockets.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

use crate::runtime::codec::{decode_frame, encode_frame};

/// Scripted non-blocking stream.
///
/// Reads hand out queued chunks one per call, then `WouldBlock` (or EOF once
/// `close_input` was called). Writes can be capped per call, limited to a
/// total budget before `WouldBlock`, or made to fail outright.
#[derive(Debug, Default)]
pub struct MockStream {
    inbound: VecDeque<Vec<u8>>,
    eof: bool,
    read_error: Option<io::ErrorKind>,
    written: Vec<u8>,
    write_limit: Option<usize>,
    write_budget: Option<usize>,
    fail_writes: bool,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the bytes accepted by any single `write` call.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Accept `budget` bytes in total, then report `WouldBlock`.
    pub fn with_write_budget(mut self, budget: usize) -> Self {
        self.write_budget = Some(budget);
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn add_write_budget(&mut self, more: usize) {
        self.write_budget = Some(self.write_budget.unwrap_or(0) + more);
    }

    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    /// Queue raw bytes to be returned by one `read` call.
    pub fn push_input(&mut self, chunk: &[u8]) {
        self.inbound.push_back(chunk.to_vec());
    }

    /// Queue one framed message.
    pub fn push_frame(&mut self, payload: &[u8]) {
        let mut frame = BytesMut::new();
        encode_frame(payload, &mut frame).unwrap();
        self.push_input(&frame);
    }

    /// Queue one framed message delivered a byte per `read`.
    pub fn push_frame_bytewise(&mut self, payload: &[u8]) {
        let mut frame = BytesMut::new();
        encode_frame(payload, &mut frame).unwrap();
        for byte in frame.iter() {
            self.push_input(&[*byte]);
        }
    }

    /// Report EOF once queued input runs out.
    pub fn close_input(&mut self) {
        self.eof = true;
    }

    /// Fail the next read after queued input runs out.
    pub fn fail_reads(&mut self, kind: io::ErrorKind) {
        self.read_error = Some(kind);
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Decode and clear every complete frame written so far.
    pub fn take_frames(&mut self) -> Vec<Bytes> {
        let mut buf = BytesMut::from(&self.written[..]);
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut buf, usize::MAX).unwrap() {
            frames.push(frame);
        }
        self.written = buf.to_vec();
        frames
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(mut chunk) = self.inbound.pop_front() {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.inbound.push_front(chunk.split_off(n));
            }
            return Ok(n);
        }
        if let Some(kind) = self.read_error.take() {
            return Err(io::Error::from(kind));
        }
        if self.eof {
            return Ok(0);
        }
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let mut n = buf.len();
        if let Some(limit) = self.write_limit {
            n = n.min(limit);
        }
        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            n = n.min(*budget);
            *budget -= n;
        }
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
