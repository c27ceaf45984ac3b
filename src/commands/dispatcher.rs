//! Command execution against the keyspace and replication state.
//!
//! The dispatcher is owned by the event loop and is the only thing that
//! mutates server state. Handlers write replies through an [`Outbox`];
//! requests that cannot complete right away (blocking XREAD, WAIT) park
//! continuation state here and report [`Outcome::Blocked`] so the reactor
//! stops decoding that connection's input until the reply is delivered.

use super::blocking::{BlockedReader, BlockedReaders};
use super::{Command, ReadFrom, ReplConf};
use crate::error::{CommandError, ReplicationError};
use crate::outbox::{ConnId, Outbox};
use crate::protocol::{Frame, Request};
use crate::replication::{LinkEvent, LinkState, ReplicaLink, Replication, WaitOutcome};
use crate::snapshot;
use crate::storage::glob::Glob;
use crate::storage::stream::{Stream, StreamEntry, StreamId};
use crate::storage::{Keyspace, Millis, Value};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

/// What the reactor should do with the connection after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reply (if any) queued; keep decoding
    Done,
    /// Reply deferred; stop decoding until the connection is unblocked
    Blocked,
}

/// Handler result
#[derive(Debug)]
enum Reply {
    Frame(Frame),
    Frames(Vec<Frame>),
    Block,
    NoReply,
}

impl From<Frame> for Reply {
    fn from(frame: Frame) -> Self {
        Reply::Frame(frame)
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    keyspace: Keyspace,
    blocked: BlockedReaders,
    replication: Replication,
    config: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(
        keyspace: Keyspace,
        replication: Replication,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            keyspace,
            blocked: BlockedReaders::new(),
            replication,
            config,
        }
    }

    pub fn replication(&self) -> &Replication {
        &self.replication
    }

    #[cfg(test)]
    fn blocked_readers(&self) -> usize {
        self.blocked.len()
    }

    /// Handle one client request.
    pub fn dispatch(
        &mut self,
        conn: ConnId,
        request: &Request,
        now: Millis,
        out: &mut Outbox,
    ) -> Outcome {
        // Empty inline line
        if request.parts.is_empty() {
            return Outcome::Done;
        }

        let command = match Command::parse(&request.parts) {
            Ok(command) => command,
            Err(e) => {
                debug!(conn_id = conn, error = %e, "Rejected request");
                out.send_frame(conn, &Frame::error(e.to_string()));
                return Outcome::Done;
            }
        };
        trace!(conn_id = conn, command = command.name(), "Dispatching");

        if command.is_write() && self.replication.is_replica() {
            out.send_frame(conn, &Frame::error(CommandError::ReadOnly.to_string()));
            return Outcome::Done;
        }

        match self.execute(conn, &command, now, out) {
            Ok(reply) => {
                if command.is_write() {
                    if let Replication::Primary(primary) = &mut self.replication {
                        primary.replicate(&request.raw, out);
                    }
                }
                deliver(conn, reply, out)
            }
            Err(e) => {
                debug!(conn_id = conn, command = command.name(), error = %e, "Command failed");
                out.send_frame(conn, &Frame::error(e.to_string()));
                Outcome::Done
            }
        }
    }

    /// Execute a command received on the replication stream. Nothing is
    /// sent back to the primary.
    pub fn apply_replicated(
        &mut self,
        conn: ConnId,
        request: &Request,
        now: Millis,
        out: &mut Outbox,
    ) {
        let command = match Command::parse(&request.parts) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable replicated command");
                return;
            }
        };
        if !command.is_write() {
            debug!(command = command.name(), "Ignoring replicated read command");
            return;
        }
        if let Err(e) = self.execute(conn, &command, now, out) {
            warn!(command = command.name(), error = %e, "Replicated command failed");
        }
    }

    /// Periodic work: time out blocked readers and pending WAITs.
    pub fn tick(&mut self, now: Millis, out: &mut Outbox) {
        for conn in self.blocked.expired(now) {
            self.blocked.remove(conn);
            debug!(conn_id = conn, "Blocked read timed out");
            out.send_frame(conn, &Frame::null_array());
            out.unblock(conn);
        }
        if let Replication::Primary(primary) = &mut self.replication {
            primary.sweep(now, out);
        }
    }

    /// Active expiry.
    pub fn sweep_expired(&mut self, now: Millis) -> usize {
        self.keyspace.sweep_expired(now)
    }

    /// Drop every piece of state owned by a closed connection.
    pub fn connection_closed(&mut self, conn: ConnId) {
        self.blocked.remove(conn);
        if let Replication::Primary(primary) = &mut self.replication {
            primary.remove(conn);
        }
    }

    /// The reactor began connecting to the primary.
    pub fn primary_link_connecting(&mut self) {
        if let Some(link) = self.link_mut() {
            link.start_connecting();
        }
    }

    /// The connect to the primary completed.
    pub fn primary_link_connected(&mut self, link_conn: ConnId, out: &mut Outbox) {
        if let Some(link) = self.link_mut() {
            out.send(link_conn, link.on_connected());
        }
    }

    /// The primary link closed or failed.
    pub fn primary_link_lost(&mut self, reason: &str) {
        if let Some(link) = self.link_mut() {
            if link.state() != LinkState::Error {
                link.fail(reason);
            }
        }
    }

    /// Feed bytes read from the primary link.
    pub fn on_primary_bytes(
        &mut self,
        link_conn: ConnId,
        buf: &mut BytesMut,
        now: Millis,
        out: &mut Outbox,
    ) -> Result<(), ReplicationError> {
        let Some(link) = self.link_mut() else {
            return Err(ReplicationError::UnexpectedData);
        };
        let events = link.process(buf)?;

        for event in events {
            match event {
                LinkEvent::Send(bytes) => out.send(link_conn, bytes),
                LinkEvent::Snapshot(payload) => {
                    if let Err(e) = self.load_snapshot(&payload, now) {
                        self.primary_link_lost(&e.to_string());
                        return Err(e);
                    }
                }
                LinkEvent::Apply(request) => self.apply_replicated(link_conn, &request, now, out),
            }
        }
        Ok(())
    }

    fn link_mut(&mut self) -> Option<&mut ReplicaLink> {
        match &mut self.replication {
            Replication::Replica(link) => Some(link),
            Replication::Primary(_) => None,
        }
    }

    fn load_snapshot(&mut self, payload: &Bytes, now: Millis) -> Result<(), ReplicationError> {
        self.keyspace.clear();
        // An empty payload is an empty dataset
        if payload.is_empty() {
            return Ok(());
        }
        let loaded = snapshot::load(payload, &mut self.keyspace, now)?;
        info!(keys = loaded, "Loaded snapshot from primary");
        Ok(())
    }

    fn execute(
        &mut self,
        conn: ConnId,
        command: &Command,
        now: Millis,
        out: &mut Outbox,
    ) -> Result<Reply, CommandError> {
        match command {
            Command::Ping { message: None } => Ok(Frame::simple("PONG").into()),
            Command::Ping {
                message: Some(message),
            }
            | Command::Echo { message } => Ok(Frame::bulk(message.clone()).into()),

            Command::Set { key, value, ttl } => {
                self.keyspace
                    .set_with_ttl(key.clone(), Value::String(value.clone()), *ttl, now);
                Ok(Frame::simple("OK").into())
            }

            Command::Get { key } => match self.keyspace.get(key, now) {
                Some(Value::String(data)) => Ok(Frame::bulk(data.clone()).into()),
                Some(_) => Err(CommandError::WrongType),
                None => Ok(Frame::null().into()),
            },

            Command::ConfigGet { params } => Ok(self.config_get(params).into()),

            Command::ConfigSet { param, value } => {
                self.config.insert(param.clone(), value.clone());
                Ok(Frame::simple("OK").into())
            }

            Command::Keys { pattern } => {
                let keys = self
                    .keyspace
                    .keys(pattern, now)
                    .map_err(|_| CommandError::InvalidPattern(pattern.clone()))?;
                Ok(Frame::array(keys.into_iter().map(Frame::bulk).collect()).into())
            }

            Command::Type { key } => Ok(Frame::simple(self.keyspace.type_of(key, now)).into()),

            Command::Info { section } => {
                let body = match section.as_deref() {
                    None | Some("replication" | "all" | "default" | "everything") => {
                        self.replication.info()
                    }
                    Some(_) => String::new(),
                };
                Ok(Frame::bulk(body).into())
            }

            Command::ReplConf(replconf) => Ok(self.replconf(conn, replconf, out)),

            Command::Psync { replid, offset } => {
                let Replication::Primary(primary) = &mut self.replication else {
                    return Err(CommandError::NotSupported(
                        "PSYNC is not supported on a replica",
                    ));
                };
                debug!(conn_id = conn, replid = %replid, offset, "PSYNC requested");
                let line = primary.full_resync(conn);
                let payload = snapshot::write(&self.keyspace, now);
                Ok(Reply::Frames(vec![
                    Frame::simple(line),
                    Frame::RawBulk(payload),
                ]))
            }

            Command::Wait { replicas, timeout } => {
                let Replication::Primary(primary) = &mut self.replication else {
                    return Err(CommandError::NotSupported(
                        "WAIT cannot be used with replica instances",
                    ));
                };
                match primary.wait(conn, *replicas, *timeout, now, out) {
                    WaitOutcome::Ready(count) => Ok(Frame::integer(count as i64).into()),
                    WaitOutcome::Pending => Ok(Reply::Block),
                }
            }

            Command::XAdd { key, id, fields } => {
                let id = match self.keyspace.get_mut(key, now) {
                    Some(Value::Stream(stream)) => stream.append(*id, fields.clone(), now)?,
                    Some(_) => return Err(CommandError::WrongType),
                    None => {
                        // The key only comes into existence if the append succeeds
                        let mut stream = Stream::new();
                        let id = stream.append(*id, fields.clone(), now)?;
                        self.keyspace.set(key.clone(), Value::Stream(stream), None);
                        id
                    }
                };
                self.wake_readers(key, now, out);
                Ok(Frame::bulk(id.to_string()).into())
            }

            Command::XRange {
                key,
                start,
                end,
                count,
            } => match self.keyspace.get(key, now) {
                Some(Value::Stream(stream)) => {
                    Ok(entries_frame(stream.range(*start, *end, *count)).into())
                }
                Some(_) => Err(CommandError::WrongType),
                None => Ok(Frame::array(Vec::new()).into()),
            },

            Command::XRead {
                count,
                block,
                streams,
            } => {
                let mut resolved = Vec::with_capacity(streams.len());
                for (key, from) in streams {
                    let after = match from {
                        ReadFrom::After(id) => *id,
                        ReadFrom::Latest => match self.keyspace.get(key, now) {
                            Some(Value::Stream(stream)) => {
                                stream.last_id().unwrap_or(StreamId::MIN)
                            }
                            Some(_) => return Err(CommandError::WrongType),
                            None => StreamId::MIN,
                        },
                    };
                    resolved.push((key.clone(), after));
                }

                if let Some(frame) = read_streams(&mut self.keyspace, &resolved, *count, now)? {
                    return Ok(frame.into());
                }

                let Some(block) = block else {
                    return Ok(Frame::null_array().into());
                };
                let deadline =
                    (!block.is_zero()).then(|| now.saturating_add(block.as_millis() as Millis));
                debug!(conn_id = conn, ?deadline, streams = resolved.len(), "Blocking XREAD");
                self.blocked.register(BlockedReader {
                    conn,
                    streams: resolved,
                    count: *count,
                    deadline,
                });
                Ok(Reply::Block)
            }
        }
    }

    fn config_get(&self, params: &[String]) -> Frame {
        let mut names: Vec<&String> = self.config.keys().collect();
        names.sort();

        let mut frames = Vec::new();
        for param in params {
            let Ok(glob) = Glob::new(param) else {
                continue;
            };
            for name in names.iter().filter(|name| glob.matches(name)) {
                frames.push(Frame::bulk(name.to_string()));
                frames.push(Frame::bulk(self.config[*name].clone()));
            }
        }
        Frame::array(frames)
    }

    fn replconf(&mut self, conn: ConnId, replconf: &ReplConf, out: &mut Outbox) -> Reply {
        match (replconf, &mut self.replication) {
            (ReplConf::GetAck, replication) => {
                let offset = replication.offset().to_string();
                Frame::command([
                    Bytes::from_static(b"REPLCONF"),
                    Bytes::from_static(b"ACK"),
                    Bytes::from(offset),
                ])
                .into()
            }
            (ReplConf::Ack(offset), Replication::Primary(primary)) => {
                primary.record_ack(conn, *offset, out);
                Reply::NoReply
            }
            (ReplConf::Ack(_), Replication::Replica(_)) => Reply::NoReply,
            (ReplConf::ListeningPort(port), Replication::Primary(primary)) => {
                primary.set_listening_port(conn, *port);
                Frame::simple("OK").into()
            }
            (ReplConf::Capa(capabilities), Replication::Primary(primary)) => {
                primary.add_capabilities(conn, capabilities.clone());
                Frame::simple("OK").into()
            }
            (ReplConf::ListeningPort(_) | ReplConf::Capa(_), Replication::Replica(_)) => {
                Frame::simple("OK").into()
            }
        }
    }

    /// Deliver to every reader of `key` that now has data.
    fn wake_readers(&mut self, key: &str, now: Millis, out: &mut Outbox) {
        for conn in self.blocked.watchers(key) {
            let Some(reader) = self.blocked.get(conn) else {
                continue;
            };
            let frame = match read_streams(&mut self.keyspace, &reader.streams, reader.count, now) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => Frame::error(e.to_string()),
            };
            self.blocked.remove(conn);
            trace!(conn_id = conn, key, "Waking blocked reader");
            out.send_frame(conn, &frame);
            out.unblock(conn);
        }
    }
}

fn deliver(conn: ConnId, reply: Reply, out: &mut Outbox) -> Outcome {
    match reply {
        Reply::Frame(frame) => out.send_frame(conn, &frame),
        Reply::Frames(frames) => {
            for frame in &frames {
                out.send_frame(conn, frame);
            }
        }
        Reply::Block => return Outcome::Blocked,
        Reply::NoReply => {}
    }
    Outcome::Done
}

/// XREAD result for the given positions, or None if no stream has new entries.
fn read_streams(
    keyspace: &mut Keyspace,
    streams: &[(String, StreamId)],
    count: Option<usize>,
    now: Millis,
) -> Result<Option<Frame>, CommandError> {
    let mut results = Vec::new();
    for (key, after) in streams {
        let entries = match keyspace.get(key, now) {
            Some(Value::Stream(stream)) => stream.read_after(*after, count),
            Some(_) => return Err(CommandError::WrongType),
            None => continue,
        };
        if !entries.is_empty() {
            results.push(Frame::array(vec![
                Frame::bulk(key.clone()),
                entries_frame(entries),
            ]));
        }
    }
    Ok((!results.is_empty()).then(|| Frame::array(results)))
}

/// `[[id, [field, value, ...]], ...]`
fn entries_frame(entries: Vec<StreamEntry>) -> Frame {
    Frame::array(
        entries
            .into_iter()
            .map(|entry| {
                let fields = entry
                    .fields
                    .into_iter()
                    .flat_map(|(field, value)| [Frame::bulk(field), Frame::bulk(value)])
                    .collect();
                Frame::array(vec![Frame::bulk(entry.id.to_string()), Frame::array(fields)])
            })
            .collect(),
    )
}
