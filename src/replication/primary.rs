//! Primary side of replication.
//!
//! Tracks replica connections and their acknowledged offsets, propagates
//! write commands verbatim, and resolves WAIT requests. WAIT never holds the
//! thread: an unsatisfied request is parked here and completed either by an
//! incoming ACK or by the reactor's periodic sweep.

use crate::outbox::{ConnId, Outbox};
use crate::protocol::Frame;
use crate::storage::Millis;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Length of a replication ID
const REPLID_LEN: usize = 40;

/// A replica connected to this primary.
#[derive(Debug, Clone, Default)]
pub struct ReplicaPeer {
    pub listening_port: Option<u16>,
    pub capabilities: Vec<String>,
    /// Last offset reported with `REPLCONF ACK`
    pub ack_offset: u64,
    /// Set once PSYNC completed; only synced peers receive the write stream
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingWait {
    conn: ConnId,
    required: usize,
    target: u64,
    deadline: Option<Millis>,
}

/// Result of a WAIT call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Reply with this many replicas now
    Ready(usize),
    /// Parked until enough ACKs arrive or the deadline passes
    Pending,
}

#[derive(Debug)]
pub struct Primary {
    replid: String,
    offset: u64,
    peers: HashMap<ConnId, ReplicaPeer>,
    waits: Vec<PendingWait>,
}

impl Default for Primary {
    fn default() -> Self {
        Self::new()
    }
}

impl Primary {
    /// Create a primary with a fresh random replication ID.
    pub fn new() -> Self {
        let replid: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REPLID_LEN)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();
        Self::with_replid(replid)
    }

    pub fn with_replid(replid: impl Into<String>) -> Self {
        Self {
            replid: replid.into(),
            offset: 0,
            peers: HashMap::new(),
            waits: Vec::new(),
        }
    }

    pub fn replid(&self) -> &str {
        &self.replid
    }

    /// Bytes of replication stream produced so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Replicas that completed PSYNC.
    pub fn connected_replicas(&self) -> usize {
        self.peers.values().filter(|p| p.synced).count()
    }

    #[cfg(test)]
    fn is_replica(&self, conn: ConnId) -> bool {
        self.peers.get(&conn).is_some_and(|p| p.synced)
    }

    #[cfg(test)]
    fn pending_waits(&self) -> usize {
        self.waits.len()
    }

    /// Record `REPLCONF listening-port`.
    pub fn set_listening_port(&mut self, conn: ConnId, port: u16) {
        self.peers.entry(conn).or_default().listening_port = Some(port);
    }

    /// Record `REPLCONF capa`.
    pub fn add_capabilities(&mut self, conn: ConnId, capabilities: Vec<String>) {
        self.peers
            .entry(conn)
            .or_default()
            .capabilities
            .extend(capabilities);
    }

    /// Accept a PSYNC: the connection starts receiving the write stream.
    ///
    /// Returns the `FULLRESYNC <replid> <offset>` status line.
    pub fn full_resync(&mut self, conn: ConnId) -> String {
        let peer = self.peers.entry(conn).or_default();
        peer.synced = true;
        peer.ack_offset = 0;
        info!(
            conn_id = conn,
            listening_port = ?peer.listening_port,
            offset = self.offset,
            "Replica starting full resync"
        );
        format!("FULLRESYNC {} {}", self.replid, self.offset)
    }

    /// Forward raw command bytes to every synced replica and advance the offset.
    pub fn replicate(&mut self, raw: &Bytes, out: &mut Outbox) {
        for (&conn, peer) in &self.peers {
            if peer.synced {
                out.send(conn, raw.clone());
            }
        }
        self.offset += raw.len() as u64;
    }

    /// Record an ACK and complete any WAIT it satisfies.
    pub fn record_ack(&mut self, conn: ConnId, offset: u64, out: &mut Outbox) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            debug!(conn_id = conn, offset, "ACK from unknown replica");
            return;
        };
        peer.ack_offset = peer.ack_offset.max(offset);
        debug!(conn_id = conn, offset, "Replica acknowledged");
        self.resolve_waits(None, out);
    }

    /// Start a WAIT for `required` replicas.
    pub fn wait(
        &mut self,
        conn: ConnId,
        required: usize,
        timeout: Option<Duration>,
        now: Millis,
        out: &mut Outbox,
    ) -> WaitOutcome {
        if self.connected_replicas() == 0 {
            return WaitOutcome::Ready(0);
        }

        let target = self.offset;
        let acked = self.acked(target);
        if acked >= required {
            return WaitOutcome::Ready(acked);
        }

        // The target excludes the GETACK itself
        self.replicate(&getack(), out);
        self.waits.push(PendingWait {
            conn,
            required,
            target,
            deadline: timeout.map(|t| now.saturating_add(t.as_millis() as Millis)),
        });
        debug!(conn_id = conn, required, target, acked, "WAIT pending");
        WaitOutcome::Pending
    }

    /// Complete satisfied waits and time out expired ones.
    pub fn sweep(&mut self, now: Millis, out: &mut Outbox) {
        self.resolve_waits(Some(now), out);
    }

    /// Forget a closed connection, as a replica and as a waiter.
    pub fn remove(&mut self, conn: ConnId) {
        if self.peers.remove(&conn).is_some_and(|p| p.synced) {
            info!(conn_id = conn, "Replica disconnected");
        }
        self.waits.retain(|w| w.conn != conn);
    }

    fn acked(&self, target: u64) -> usize {
        self.peers
            .values()
            .filter(|p| p.synced && p.ack_offset >= target)
            .count()
    }

    fn resolve_waits(&mut self, now: Option<Millis>, out: &mut Outbox) {
        if self.waits.is_empty() {
            return;
        }
        let waits = std::mem::take(&mut self.waits);
        for wait in waits {
            let acked = self.acked(wait.target);
            let timed_out = matches!((now, wait.deadline), (Some(now), Some(d)) if d <= now);
            if acked >= wait.required || timed_out {
                debug!(conn_id = wait.conn, acked, timed_out, "WAIT complete");
                out.send_frame(wait.conn, &Frame::integer(acked as i64));
                out.unblock(wait.conn);
            } else {
                self.waits.push(wait);
            }
        }
    }
}

fn getack() -> Bytes {
    Frame::command(["REPLCONF", "GETACK", "*"]).encode().freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced_primary(replicas: &[ConnId]) -> Primary {
        let mut primary = Primary::with_replid("8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb");
        for &conn in replicas {
            primary.set_listening_port(conn, 6380);
            primary.full_resync(conn);
        }
        primary
    }

    #[test]
    fn test_replid_shape() {
        let primary = Primary::new();
        assert_eq!(primary.replid().len(), REPLID_LEN);
        assert!(primary.replid().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_full_resync_line() {
        let mut primary = Primary::with_replid("abc");
        assert_eq!(primary.full_resync(4), "FULLRESYNC abc 0");
        assert!(primary.is_replica(4));
        assert_eq!(primary.connected_replicas(), 1);
    }

    #[test]
    fn test_unsynced_peer_is_not_counted() {
        let mut primary = Primary::with_replid("abc");
        primary.set_listening_port(4, 6380);
        assert_eq!(primary.connected_replicas(), 0);
        assert!(!primary.is_replica(4));
    }

    #[test]
    fn test_replicate_advances_offset_by_wire_length() {
        let mut primary = synced_primary(&[1, 2]);
        let mut out = Outbox::new();
        let raw = Frame::command(["SET", "foo", "bar"]).encode().freeze();

        primary.replicate(&raw, &mut out);
        assert_eq!(primary.offset(), raw.len() as u64);

        let mut targets: Vec<ConnId> = out.take_sends().into_iter().map(|(c, _)| c).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![1, 2]);
    }

    #[test]
    fn test_wait_without_replicas_is_immediate() {
        let mut primary = Primary::with_replid("abc");
        let mut out = Outbox::new();
        assert_eq!(primary.wait(9, 3, None, 0, &mut out), WaitOutcome::Ready(0));
        assert!(out.is_empty());
    }

    #[test]
    fn test_wait_satisfied_by_existing_acks() {
        let mut primary = synced_primary(&[1, 2]);
        let mut out = Outbox::new();
        assert_eq!(primary.wait(9, 1, None, 0, &mut out), WaitOutcome::Ready(2));
    }

    #[test]
    fn test_wait_resolved_by_ack() {
        let mut primary = synced_primary(&[1, 2]);
        let mut out = Outbox::new();
        let raw = Frame::command(["SET", "foo", "bar"]).encode().freeze();
        primary.replicate(&raw, &mut out);
        out.take_sends();

        let target = primary.offset();
        assert_eq!(
            primary.wait(9, 2, Some(Duration::from_millis(500)), 1_000, &mut out),
            WaitOutcome::Pending
        );
        // GETACK went to both replicas and counts toward the offset
        assert_eq!(out.take_sends().len(), 2);
        assert!(primary.offset() > target);

        primary.record_ack(1, target, &mut out);
        assert!(out.is_empty());
        primary.record_ack(2, target, &mut out);

        assert_eq!(out.take_sends(), vec![(9, Bytes::from_static(b":2\r\n"))]);
        assert_eq!(out.take_unblocked(), vec![9]);
        assert_eq!(primary.pending_waits(), 0);
    }

    #[test]
    fn test_wait_times_out_with_partial_count() {
        let mut primary = synced_primary(&[1, 2]);
        let mut out = Outbox::new();
        primary.replicate(&Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"), &mut out);
        let target = primary.offset();

        primary.wait(9, 2, Some(Duration::from_millis(100)), 1_000, &mut out);
        primary.record_ack(1, target, &mut out);
        out.take_sends();

        primary.sweep(1_099, &mut out);
        assert!(out.is_empty());

        primary.sweep(1_100, &mut out);
        assert_eq!(out.take_sends(), vec![(9, Bytes::from_static(b":1\r\n"))]);
        assert_eq!(out.take_unblocked(), vec![9]);
    }

    #[test]
    fn test_wait_without_timeout_never_expires() {
        let mut primary = synced_primary(&[1]);
        let mut out = Outbox::new();
        primary.replicate(&Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"), &mut out);
        primary.wait(9, 1, None, 0, &mut out);
        out.take_sends();

        primary.sweep(u64::MAX, &mut out);
        assert!(out.is_empty());
        assert_eq!(primary.pending_waits(), 1);
    }

    #[test]
    fn test_remove_drops_peer_and_waits() {
        let mut primary = synced_primary(&[1]);
        let mut out = Outbox::new();
        primary.replicate(&Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"), &mut out);
        primary.wait(9, 1, None, 0, &mut out);

        primary.remove(9);
        assert_eq!(primary.pending_waits(), 0);
        primary.remove(1);
        assert_eq!(primary.connected_replicas(), 0);
    }
}
