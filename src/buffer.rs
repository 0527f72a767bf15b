//! Per-direction write queue with partial-write and `EPIPE` handling.
//!
//! Sessions never write to a socket directly: bytes are enqueued here and
//! flushed when the socket reports writable. The session keeps `WRITABLE`
//! interest on a socket exactly while its queue is non-empty, so the queue
//! emptiness is the single source of truth for write-readiness
//! subscriptions.

use std::collections::VecDeque;
use std::io::{ErrorKind, Write};

use mio::net::TcpStream;

/// A pending slice and how much of it already went out.
struct WritePart {
    data: Vec<u8>,
    written: usize,
}

impl WritePart {
    fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// every queued byte went out
    Drained,
    /// the socket stopped accepting bytes, queue still holds data
    WouldBlock,
    /// unrecoverable error, the connection must be torn down
    Error,
}

/// FIFO of byte slices waiting to go out on one socket.
#[derive(Default)]
pub struct WriteQueue {
    parts: VecDeque<WritePart>,
}

impl WriteQueue {
    pub fn new() -> WriteQueue {
        WriteQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn enqueue(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.parts.push_back(WritePart { data, written: 0 });
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    /// Write queued parts until the queue drains or the socket pushes back.
    ///
    /// A partial write leaves the tail of the part at the front of the
    /// queue. `EPIPE` silently discards the part: the peer is gone and the
    /// read side will observe EOF shortly, there is nothing useful to do
    /// with the bytes. Returns the number of bytes written this pass along
    /// with the flush outcome.
    pub fn flush(&mut self, stream: &mut TcpStream) -> (usize, FlushResult) {
        let mut total = 0;
        while let Some(part) = self.parts.front_mut() {
            match stream.write(part.remaining()) {
                Ok(size) => {
                    part.written += size;
                    total += size;
                    if part.remaining().is_empty() {
                        self.parts.pop_front();
                    }
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => return (total, FlushResult::WouldBlock),
                    ErrorKind::Interrupted => continue,
                    ErrorKind::BrokenPipe => {
                        self.parts.pop_front();
                    }
                    _ => return (total, FlushResult::Error),
                },
            }
        }
        (total, FlushResult::Drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parts_are_not_queued() {
        let mut queue = WriteQueue::new();
        queue.enqueue(Vec::new());
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_makes_queue_non_empty() {
        let mut queue = WriteQueue::new();
        queue.enqueue(b"hello".to_vec());
        assert!(!queue.is_empty());
        queue.clear();
        assert!(queue.is_empty());
    }
}
