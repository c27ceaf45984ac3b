//! Replica side of replication: the outbound link to a primary.
//!
//! The link is a linear state machine fed with whatever bytes the reactor
//! read from the primary socket:
//!
//! ```text
//! Idle -> Connecting -> SentPing -> SentPort -> SentCapa -> SentPsync
//!      -> AwaitingSnapshotHeader -> ReceivingSnapshot -> Ready
//! ```
//!
//! The PING goes out as soon as the connect completes.
//!
//! Any unexpected reply moves it to `Error`; the reactor then closes the
//! socket and the link stays down. Bytes that follow the snapshot in the same
//! read are left in the buffer and decoded as replicated commands, so nothing
//! the primary forwards during the transfer is lost.

use crate::error::ReplicationError;
use crate::protocol::{parse, parse_snapshot_header, Frame, ParseResult, Request};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    SentPing,
    SentPort,
    SentCapa,
    SentPsync,
    AwaitingSnapshotHeader,
    ReceivingSnapshot { len: usize },
    Ready,
    Error,
}

impl LinkState {
    fn name(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::SentPing => "waiting for PONG",
            LinkState::SentPort => "waiting for listening-port OK",
            LinkState::SentCapa => "waiting for capa OK",
            LinkState::SentPsync => "waiting for FULLRESYNC",
            LinkState::AwaitingSnapshotHeader => "waiting for snapshot header",
            LinkState::ReceivingSnapshot { .. } => "receiving snapshot",
            LinkState::Ready => "streaming",
            LinkState::Error => "failed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Work the link asks the dispatcher to do, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Write these bytes to the primary
    Send(Bytes),
    /// Replace the keyspace with this snapshot payload
    Snapshot(Bytes),
    /// Execute a replicated command without replying
    Apply(Request),
}

#[derive(Debug)]
pub struct ReplicaLink {
    host: String,
    port: u16,
    listening_port: u16,
    state: LinkState,
    replid: Option<String>,
    offset: u64,
}

impl ReplicaLink {
    pub fn new(host: impl Into<String>, port: u16, listening_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            listening_port,
            state: LinkState::Idle,
            replid: None,
            offset: 0,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Replication ID announced by the primary, once known.
    pub fn replid(&self) -> Option<&str> {
        self.replid.as_deref()
    }

    /// Bytes of replication stream processed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_up(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// The reactor started a non-blocking connect.
    pub fn start_connecting(&mut self) {
        self.state = LinkState::Connecting;
    }

    /// The connect completed: begin the handshake with a PING.
    pub fn on_connected(&mut self) -> Bytes {
        info!(host = %self.host, port = self.port, "Connected to primary");
        self.state = LinkState::SentPing;
        encode(&["PING"])
    }

    /// The socket failed or closed.
    pub fn fail(&mut self, reason: &str) {
        warn!(host = %self.host, port = self.port, state = %self.state, reason, "Replication link down");
        self.state = LinkState::Error;
    }

    /// Consume as much of `buf` as the current state allows.
    ///
    /// Incomplete input stays in `buf`. On error the link moves to `Error`
    /// and events produced before the failure are dropped.
    pub fn process(&mut self, buf: &mut BytesMut) -> Result<Vec<LinkEvent>, ReplicationError> {
        let mut events = Vec::new();
        match self.advance(buf, &mut events) {
            Ok(()) => Ok(events),
            Err(e) => {
                self.fail(&e.to_string());
                Err(e)
            }
        }
    }

    fn advance(
        &mut self,
        buf: &mut BytesMut,
        events: &mut Vec<LinkEvent>,
    ) -> Result<(), ReplicationError> {
        loop {
            match self.state {
                LinkState::Idle
                | LinkState::Connecting
                | LinkState::Error => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    return Err(ReplicationError::UnexpectedData);
                }

                LinkState::SentPing
                | LinkState::SentPort
                | LinkState::SentCapa
                | LinkState::SentPsync => {
                    let reply = match parse(buf) {
                        ParseResult::Complete(frame, consumed) => {
                            buf.advance(consumed);
                            frame
                        }
                        ParseResult::Incomplete => return Ok(()),
                        ParseResult::Error(e) => return Err(e.into()),
                    };
                    if let Some(send) = self.on_handshake_reply(reply)? {
                        events.push(LinkEvent::Send(send));
                    }
                }

                LinkState::AwaitingSnapshotHeader => match parse_snapshot_header(buf) {
                    ParseResult::Complete(len, consumed) => {
                        buf.advance(consumed);
                        debug!(len, "Receiving snapshot");
                        self.state = LinkState::ReceivingSnapshot { len };
                    }
                    ParseResult::Incomplete => return Ok(()),
                    ParseResult::Error(e) => return Err(e.into()),
                },

                LinkState::ReceivingSnapshot { len } => {
                    if buf.len() < len {
                        return Ok(());
                    }
                    let payload = buf.split_to(len).freeze();
                    events.push(LinkEvent::Snapshot(payload));
                    self.state = LinkState::Ready;
                    info!(len, offset = self.offset, "Snapshot received, link ready");
                }

                LinkState::Ready => {
                    let Some(request) = Request::take(buf)? else {
                        return Ok(());
                    };
                    if request.starts_with(&["REPLCONF", "GETACK"]) {
                        // Reports the offset before this GETACK
                        let offset = self.offset.to_string();
                        events.push(LinkEvent::Send(encode(&["REPLCONF", "ACK", &offset])));
                    } else if !request.parts.is_empty() && !request.starts_with(&["PING"]) {
                        events.push(LinkEvent::Apply(request.clone()));
                    }
                    self.offset += request.wire_len() as u64;
                }
            }
        }
    }

    fn on_handshake_reply(&mut self, reply: Frame) -> Result<Option<Bytes>, ReplicationError> {
        let unexpected = |state: LinkState, reply: &Frame| ReplicationError::UnexpectedReply {
            state: state.name(),
            reply: format!("{:?}", reply),
        };

        let (next, send) = match (self.state, &reply) {
            (LinkState::SentPing, Frame::Simple(s)) if s.eq_ignore_ascii_case("PONG") => {
                let port = self.listening_port.to_string();
                (
                    LinkState::SentPort,
                    encode(&["REPLCONF", "listening-port", &port]),
                )
            }
            (LinkState::SentPort, Frame::Simple(s)) if s == "OK" => (
                LinkState::SentCapa,
                encode(&["REPLCONF", "capa", "psync2"]),
            ),
            (LinkState::SentCapa, Frame::Simple(s)) if s == "OK" => {
                (LinkState::SentPsync, encode(&["PSYNC", "?", "-1"]))
            }
            (LinkState::SentPsync, Frame::Simple(s)) if s.starts_with("FULLRESYNC") => {
                let (replid, offset) = parse_fullresync(s)?;
                info!(replid = %replid, offset, "Full resync accepted");
                self.replid = Some(replid);
                self.offset = offset;
                self.state = LinkState::AwaitingSnapshotHeader;
                return Ok(None);
            }
            (state, reply) => return Err(unexpected(state, reply)),
        };

        debug!(state = %next, "Handshake step");
        self.state = next;
        Ok(Some(send))
    }
}

/// Parse `FULLRESYNC <replid> <offset>`.
fn parse_fullresync(line: &str) -> Result<(String, u64), ReplicationError> {
    let bad = || ReplicationError::BadFullResync(line.to_string());
    let mut words = line.split_whitespace();
    let _keyword = words.next();
    let replid = words.next().ok_or_else(bad)?;
    let offset = words
        .next()
        .and_then(|o| o.parse().ok())
        .ok_or_else(bad)?;
    if words.next().is_some() {
        return Err(bad());
    }
    Ok((replid.to_string(), offset))
}

fn encode(parts: &[&str]) -> Bytes {
    Frame::command(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())))
        .encode()
        .freeze()
}
