//! Thin non-blocking socket read helper shared by the session handlers.

use std::io::{ErrorKind, Read};

use mio::net::TcpStream;

/// Outcome of a single non-blocking socket operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketResult {
    /// the operation made progress and may be retried immediately
    Continue,
    /// the socket has no more data for now
    WouldBlock,
    /// the peer closed its end (read returned zero)
    Closed,
    /// an unrecoverable socket error
    Error,
}

/// Read once into `buf`, translating errno into a [`SocketResult`].
///
/// `EINTR` is retried in place, `EAGAIN` maps to `WouldBlock` and a zero
/// return maps to `Closed`. Any other error is fatal for the connection that
/// owns the socket.
pub fn socket_read(stream: &mut TcpStream, buf: &mut [u8]) -> (usize, SocketResult) {
    loop {
        match stream.read(buf) {
            Ok(0) => return (0, SocketResult::Closed),
            Ok(size) => return (size, SocketResult::Continue),
            Err(error) => match error.kind() {
                ErrorKind::WouldBlock => return (0, SocketResult::WouldBlock),
                ErrorKind::Interrupted => continue,
                _ => return (0, SocketResult::Error),
            },
        }
    }
}
