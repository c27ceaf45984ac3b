//! Connection sink handed to the dispatcher and replication code.
//!
//! Handlers never touch sockets. They queue bytes for a connection id and
//! the reactor moves everything into the matching write queues after each
//! dispatch, in the order it was queued.

use crate::protocol::Frame;
use bytes::Bytes;

/// Identity of a connection, the reactor's slab key.
pub type ConnId = usize;

/// Pending output produced while handling one event.
#[derive(Debug, Default)]
pub struct Outbox {
    sends: Vec<(ConnId, Bytes)>,
    unblocked: Vec<ConnId>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw bytes for a connection.
    pub fn send(&mut self, conn: ConnId, bytes: Bytes) {
        self.sends.push((conn, bytes));
    }

    /// Queue an encoded reply frame for a connection.
    pub fn send_frame(&mut self, conn: ConnId, frame: &Frame) {
        self.send(conn, frame.encode().freeze());
    }

    /// Note that a suspended reply for `conn` has been delivered.
    pub fn unblock(&mut self, conn: ConnId) {
        self.unblocked.push(conn);
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.unblocked.is_empty()
    }

    /// Take queued sends in FIFO order.
    pub fn take_sends(&mut self) -> Vec<(ConnId, Bytes)> {
        std::mem::take(&mut self.sends)
    }

    /// Take connections whose suspended reply was delivered.
    pub fn take_unblocked(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut self.unblocked)
    }
}
