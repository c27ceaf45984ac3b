//! Per-connection state for the reactor.
//!
//! Each connection owns its socket, the bytes read but not yet decoded, and
//! a FIFO of encoded replies waiting for the socket to accept them.

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Bytes read per `read` call
const READ_CHUNK: usize = 16 * 1024;

/// What the connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// An accepted client, including replicas attached to this primary
    Client,
    /// Our outbound link to the primary
    PrimaryLink,
}

#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub role: Role,
    /// Received bytes not yet decoded into requests
    pub read_buf: BytesMut,
    write_queue: VecDeque<Bytes>,
    /// A reply is suspended; input is not decoded until it is delivered
    pub blocked: bool,
    /// Outbound connect still in progress
    pub connecting: bool,
    /// Close once the write queue drains
    pub close_after_flush: bool,
    /// Whether WRITABLE is part of the registered interest
    write_registered: bool,
}

impl Connection {
    pub fn client(stream: TcpStream, peer: SocketAddr) -> Self {
        Self::new(stream, peer, Role::Client, false)
    }

    /// An outbound link whose non-blocking connect was just started.
    pub fn primary_link(stream: TcpStream, peer: SocketAddr) -> Self {
        Self::new(stream, peer, Role::PrimaryLink, true)
    }

    fn new(stream: TcpStream, peer: SocketAddr, role: Role, connecting: bool) -> Self {
        Self {
            stream,
            peer,
            role,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_queue: VecDeque::new(),
            blocked: false,
            connecting,
            close_after_flush: false,
            write_registered: connecting,
        }
    }

    /// Interest this connection should be registered with right now.
    pub fn interest(&self) -> Interest {
        if self.connecting || self.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Read until the socket would block.
    ///
    /// Returns true if the peer closed its side.
    pub fn read_available(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue bytes behind everything already queued.
    pub fn enqueue(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.write_queue.push_back(bytes);
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Write queued bytes in order until drained or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.write_queue.front_mut() {
            match self.stream.write(front) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) if n == front.len() => {
                    self.write_queue.pop_front();
                }
                // Partial write, keep the rest at the front
                Ok(n) => front.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Re-register if WRITABLE needs to be added or dropped.
    pub fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let wants_write = self.connecting || self.has_pending_writes();
        if wants_write != self.write_registered {
            let interest = self.interest();
            registry.reregister(&mut self.stream, token, interest)?;
            self.write_registered = wants_write;
        }
        Ok(())
    }
}
