//! Single-threaded mio reactor.
//!
//! One `Poll` drives the listener, every client connection, and (on a
//! replica) the outbound link to the primary. All command execution happens
//! on this thread; handlers queue output in an [`Outbox`] which is routed
//! into per-connection write queues after every dispatch.

use super::connection::{Connection, Role};
use crate::commands::{Dispatcher, Outcome};
use crate::config::{Config, ReplicaOf};
use crate::error::ServerError;
use crate::outbox::{ConnId, Outbox};
use crate::protocol::{Frame, Request};
use crate::replication::{Primary, ReplicaLink, Replication};
use crate::storage::{now_millis, Keyspace};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: Slab<Connection>,
    dispatcher: Dispatcher,
    outbox: Outbox,
    /// Connections with newly queued output
    dirty: Vec<ConnId>,
    tick_interval: Duration,
    expiry_sweep_interval: Duration,
    last_expiry_sweep: Instant,
}

impl EventLoop {
    /// Bind the listener and, when configured as a replica, start connecting
    /// to the primary.
    pub fn bind(config: &Config, keyspace: Keyspace) -> Result<Self, ServerError> {
        let addr = resolve(&config.host, config.port)?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let replication = match &config.replicaof {
            Some(primary) => Replication::Replica(ReplicaLink::new(
                primary.host.clone(),
                primary.port,
                local_addr.port(),
            )),
            None => Replication::Primary(Primary::new()),
        };

        // Report the port actually bound, which differs when 0 was requested
        let mut parameters = config.parameters();
        parameters.insert("port".to_string(), local_addr.port().to_string());

        let mut event_loop = Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            local_addr,
            connections: Slab::new(),
            dispatcher: Dispatcher::new(keyspace, replication, parameters),
            outbox: Outbox::new(),
            dirty: Vec::new(),
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            expiry_sweep_interval: Duration::from_millis(config.expiry_sweep_interval_ms),
            last_expiry_sweep: Instant::now(),
        };

        if let Some(primary) = &config.replicaof {
            event_loop.connect_primary(primary);
        }

        Ok(event_loop)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until an unrecoverable error.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            role = if self.dispatcher.replication().is_replica() { "replica" } else { "primary" },
            "Event loop started"
        );
        loop {
            self.run_once()?;
        }
    }

    /// One wait for readiness followed by periodic work.
    pub fn run_once(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(self.tick_interval)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable() || event.is_error(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER_TOKEN => self.accept_connections()?,
                Token(conn_id) => {
                    if let Err(e) = self.handle_connection_event(conn_id, readable, writable) {
                        debug!(conn_id, error = %e, "Connection error");
                        self.close_connection(conn_id, &e.to_string());
                    }
                }
            }
        }

        self.run_periodic();
        self.flush_dirty();
        Ok(())
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();
                    self.poll
                        .registry()
                        .register(&mut stream, Token(conn_id), Interest::READABLE)?;
                    entry.insert(Connection::client(stream, peer_addr));
                    debug!(conn_id, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        conn_id: ConnId,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let Some(conn) = self.connections.get(conn_id) else {
            return Ok(());
        };
        let role = conn.role;

        if conn.connecting && !self.finish_connect(conn_id)? {
            return Ok(());
        }

        if readable {
            match role {
                Role::Client => self.handle_client_readable(conn_id)?,
                Role::PrimaryLink => self.handle_link_readable(conn_id)?,
            }
        }

        if writable {
            self.flush_connection(conn_id)?;
        }
        Ok(())
    }

    fn handle_client_readable(&mut self, conn_id: ConnId) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        let eof = conn.read_available()?;
        self.settle(Some(conn_id));

        if eof {
            // Deliver what the final requests produced before closing
            self.flush_connection(conn_id)?;
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
        }
        Ok(())
    }

    fn handle_link_readable(&mut self, conn_id: ConnId) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        let eof = conn.read_available()?;

        let result =
            self.dispatcher
                .on_primary_bytes(conn_id, &mut conn.read_buf, now_millis(), &mut self.outbox);
        self.settle(None);

        result.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if eof {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "primary closed the link"));
        }
        Ok(())
    }

    /// Check whether an outbound connect completed. Returns true once connected.
    fn finish_connect(&mut self, conn_id: ConnId) -> io::Result<bool> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(false);
        };
        if let Some(e) = conn.stream.take_error()? {
            return Err(e);
        }
        match conn.stream.peer_addr() {
            Ok(peer) => {
                conn.connecting = false;
                debug!(conn_id, primary = %peer, "Primary link connect completed");
                self.dispatcher
                    .primary_link_connected(conn_id, &mut self.outbox);
                self.settle(None);
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn connect_primary(&mut self, primary: &ReplicaOf) {
        self.dispatcher.primary_link_connecting();
        if let Err(e) = self.open_primary_link(primary) {
            warn!(host = %primary.host, port = primary.port, error = %e, "Failed to connect to primary");
            self.dispatcher.primary_link_lost(&e.to_string());
        }
    }

    fn open_primary_link(&mut self, primary: &ReplicaOf) -> io::Result<()> {
        let addr = resolve(&primary.host, primary.port)?;
        let stream = TcpStream::connect(addr)?;
        let conn_id = self.connections.insert(Connection::primary_link(stream, addr));

        let conn = &mut self.connections[conn_id];
        let interest = conn.interest();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(conn_id), interest)
        {
            self.connections.remove(conn_id);
            return Err(e);
        }
        info!(conn_id, primary = %addr, "Connecting to primary");
        Ok(())
    }

    /// Decode and dispatch buffered input, starting with `first` and then
    /// every connection a dispatch unblocked.
    fn settle(&mut self, first: Option<ConnId>) {
        let mut work: VecDeque<ConnId> = first.into_iter().collect();
        self.route_outbox(&mut work);
        while let Some(conn_id) = work.pop_front() {
            self.process_input(conn_id, &mut work);
        }
    }

    fn process_input(&mut self, conn_id: ConnId, work: &mut VecDeque<ConnId>) {
        loop {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return;
            };
            if conn.role != Role::Client || conn.blocked || conn.close_after_flush {
                return;
            }

            let request = match Request::take(&mut conn.read_buf) {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    warn!(conn_id, peer = %conn.peer, error = %e, "Protocol error");
                    conn.enqueue(Frame::error(e.reply_text()).encode().freeze());
                    conn.close_after_flush = true;
                    self.dirty.push(conn_id);
                    return;
                }
            };

            let outcome = self
                .dispatcher
                .dispatch(conn_id, &request, now_millis(), &mut self.outbox);
            if outcome == Outcome::Blocked {
                trace!(conn_id, "Connection blocked");
                conn.blocked = true;
            }
            self.route_outbox(work);
        }
    }

    /// Move queued output into write queues and release unblocked connections.
    fn route_outbox(&mut self, work: &mut VecDeque<ConnId>) {
        for (conn_id, bytes) in self.outbox.take_sends() {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                conn.enqueue(bytes);
                self.dirty.push(conn_id);
            }
        }
        for conn_id in self.outbox.take_unblocked() {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                trace!(conn_id, "Connection unblocked");
                conn.blocked = false;
                work.push_back(conn_id);
            }
        }
    }

    fn run_periodic(&mut self) {
        let now = now_millis();
        self.dispatcher.tick(now, &mut self.outbox);
        self.settle(None);

        if self.last_expiry_sweep.elapsed() >= self.expiry_sweep_interval {
            let removed = self.dispatcher.sweep_expired(now);
            if removed > 0 {
                trace!(removed, "Expired keys swept");
            }
            self.last_expiry_sweep = Instant::now();
        }
    }

    fn flush_dirty(&mut self) {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        for conn_id in dirty {
            if let Err(e) = self.flush_connection(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id, &e.to_string());
            }
        }
    }

    fn flush_connection(&mut self, conn_id: ConnId) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        if conn.connecting {
            return Ok(());
        }
        conn.flush()?;
        if conn.close_after_flush && !conn.has_pending_writes() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "closed after protocol error",
            ));
        }
        conn.sync_interest(self.poll.registry(), Token(conn_id))
    }

    fn close_connection(&mut self, conn_id: ConnId, reason: &str) {
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            match conn.role {
                Role::Client => self.dispatcher.connection_closed(conn_id),
                Role::PrimaryLink => {
                    warn!(conn_id, reason, "Lost link to primary");
                    self.dispatcher.primary_link_lost(reason);
                }
            }
            debug!(conn_id, "Connection closed");
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host}:{port} did not resolve"),
        )
    })
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse, ParseResult};
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::thread;

    struct Client {
        stream: std::net::TcpStream,
        buf: Vec<u8>,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = std::net::TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            Self {
                stream,
                buf: Vec::new(),
            }
        }

        fn send(&mut self, parts: &[&str]) {
            let frame = Frame::command(parts.iter().map(|p| p.to_string()));
            self.stream.write_all(&frame.encode()).unwrap();
        }

        fn read_frame(&mut self) -> Frame {
            loop {
                if let ParseResult::Complete(frame, consumed) = parse(&self.buf) {
                    self.buf.drain(..consumed);
                    return frame;
                }
                let mut chunk = [0u8; 64 * 1024];
                let n = self.stream.read(&mut chunk).unwrap();
                assert!(n > 0, "server closed the connection");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        fn call(&mut self, parts: &[&str]) -> Frame {
            self.send(parts);
            self.read_frame()
        }
    }

    fn start(config: Config) -> SocketAddr {
        let mut event_loop = EventLoop::bind(&config, Keyspace::new()).unwrap();
        let addr = event_loop.local_addr();
        thread::spawn(move || event_loop.run());
        addr
    }

    fn primary_config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    fn bulk(s: &str) -> Frame {
        Frame::bulk(s.to_string())
    }

    /// Repeat `f` until it returns true or a few seconds pass.
    fn eventually(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_ping_set_get() {
        let addr = start(primary_config());
        let mut client = Client::connect(addr);

        assert_eq!(client.call(&["PING"]), Frame::simple("PONG"));
        assert_eq!(client.call(&["SET", "foo", "bar"]), Frame::simple("OK"));
        assert_eq!(client.call(&["GET", "foo"]), bulk("bar"));
        assert_eq!(client.call(&["GET", "missing"]), Frame::null());
    }

    #[test]
    fn test_inline_and_pipelined_requests() {
        let addr = start(primary_config());
        let mut client = Client::connect(addr);

        client
            .stream
            .write_all(b"PING\r\nECHO hi\r\n*1\r\n$4\r\nPING\r\n")
            .unwrap();
        assert_eq!(client.read_frame(), Frame::simple("PONG"));
        assert_eq!(client.read_frame(), bulk("hi"));
        assert_eq!(client.read_frame(), Frame::simple("PONG"));
    }

    #[test]
    fn test_config_get_reports_bound_port() {
        let addr = start(primary_config());
        let mut client = Client::connect(addr);

        let port = addr.port().to_string();
        assert_eq!(
            client.call(&["CONFIG", "GET", "port"]),
            Frame::array(vec![bulk("port"), bulk(&port)])
        );
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let addr = start(primary_config());
        let mut client = Client::connect(addr);

        client.stream.write_all(b"*1\r\n:5\r\n").unwrap();
        match client.read_frame() {
            Frame::Error(msg) => assert!(msg.starts_with("ERR Protocol error"), "{msg}"),
            other => panic!("unexpected: {:?}", other),
        }
        let mut chunk = [0u8; 16];
        assert_eq!(client.stream.read(&mut chunk).unwrap(), 0);

        // Other connections are unaffected
        let mut other = Client::connect(addr);
        assert_eq!(other.call(&["PING"]), Frame::simple("PONG"));
    }

    #[test]
    fn test_large_replies_to_slow_reader_arrive_in_order() {
        const VALUE_LEN: usize = 8 * 1024 * 1024;
        let addr = start(primary_config());
        let mut client = Client::connect(addr);

        let values: Vec<String> = ["a", "b", "c"].iter().map(|c| c.repeat(VALUE_LEN)).collect();
        for (i, value) in values.iter().enumerate() {
            let key = format!("big{i}");
            assert_eq!(client.call(&["SET", key.as_str(), value.as_str()]), Frame::simple("OK"));
        }

        // Pipeline every GET, then stall so the server's writes back up
        let mut pipeline = BytesMut::new();
        for i in 0..values.len() {
            Frame::command(["GET".to_string(), format!("big{i}")]).encode_into(&mut pipeline);
        }
        Frame::command(["PING"]).encode_into(&mut pipeline);
        client.stream.write_all(&pipeline).unwrap();
        thread::sleep(Duration::from_millis(300));

        for value in &values {
            match client.read_frame() {
                Frame::Bulk(Some(data)) => {
                    assert_eq!(data.len(), VALUE_LEN);
                    assert!(data == value.as_bytes());
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(client.read_frame(), Frame::simple("PONG"));

        // Still responsive once the queue has drained
        assert_eq!(client.call(&["PING"]), Frame::simple("PONG"));
    }

    #[test]
    fn test_blocking_xread_woken_by_xadd() {
        let addr = start(primary_config());
        let mut reader = Client::connect(addr);
        let mut writer = Client::connect(addr);

        reader.send(&["XREAD", "BLOCK", "0", "STREAMS", "s", "$"]);
        // Let the reader register before the write lands
        thread::sleep(Duration::from_millis(100));

        assert_eq!(writer.call(&["XADD", "s", "1-1", "f", "v"]), bulk("1-1"));
        assert_eq!(
            reader.read_frame(),
            Frame::array(vec![Frame::array(vec![
                bulk("s"),
                Frame::array(vec![Frame::array(vec![
                    bulk("1-1"),
                    Frame::array(vec![bulk("f"), bulk("v")]),
                ])]),
            ])])
        );

        // The reader resumes normal service
        assert_eq!(reader.call(&["PING"]), Frame::simple("PONG"));
    }

    #[test]
    fn test_blocking_xread_times_out() {
        let addr = start(primary_config());
        let mut client = Client::connect(addr);

        let started = Instant::now();
        assert_eq!(
            client.call(&["XREAD", "BLOCK", "100", "STREAMS", "s", "$"]),
            Frame::null_array()
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_replication_and_wait() {
        let primary_addr = start(primary_config());
        let replica_addr = start(Config {
            port: 0,
            replicaof: Some(ReplicaOf {
                host: "127.0.0.1".to_string(),
                port: primary_addr.port(),
            }),
            ..Config::default()
        });

        let mut primary = Client::connect(primary_addr);
        let mut replica = Client::connect(replica_addr);

        assert!(eventually(|| {
            match primary.call(&["INFO", "replication"]) {
                Frame::Bulk(Some(info)) => {
                    String::from_utf8_lossy(&info).contains("connected_slaves:1\r\n")
                }
                _ => false,
            }
        }));

        assert_eq!(primary.call(&["SET", "foo", "bar"]), Frame::simple("OK"));
        assert_eq!(primary.call(&["WAIT", "1", "2000"]), Frame::integer(1));
        assert!(eventually(|| replica.call(&["GET", "foo"]) == bulk("bar")));

        match replica.call(&["SET", "foo", "baz"]) {
            Frame::Error(msg) => assert!(msg.starts_with("READONLY"), "{msg}"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_replica_with_unreachable_primary_keeps_serving() {
        // Grab a free port and release it so nothing is listening there
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr = start(Config {
            port: 0,
            replicaof: Some(ReplicaOf {
                host: "127.0.0.1".to_string(),
                port,
            }),
            ..Config::default()
        });

        let mut client = Client::connect(addr);
        assert_eq!(client.call(&["PING"]), Frame::simple("PONG"));
        assert!(eventually(|| match client.call(&["INFO", "replication"]) {
            Frame::Bulk(Some(info)) => {
                String::from_utf8_lossy(&info).contains("master_link_status:down\r\n")
            }
            _ => false,
        }));
    }
}
