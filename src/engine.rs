//! The single-threaded event loop.
//!
//! One `mio::Poll` drives every socket: the listener, the DNS channel and all
//! client and destination connections. A connection that is waiting on DNS, on
//! an outbound connect, or on its peer draining a chunk is represented only by
//! the interests currently registered for its socket.
//!
//! Relay flow per direction: the reading side fills its own buffer, turns its
//! readability off and the peer's writability on; the peer drains that buffer
//! and hands readability back. One chunk is in flight per direction.

use crate::auth::{AuthRequest, encode_method_choice};
use crate::commands::{ConnectionRequest, ConnectionResponse};
use crate::config::{MIN_BUFFER_SIZE, ProxyConfig};
use crate::connection::{Connection, ConnectionRecord, ConnectionState, RelayBuffer};
use crate::dns::{DnsAnswer, DnsClient, DomainNameCache, ResolutionQueue};
use crate::error::{ProtocolError, ProxyError, Result};
use crate::protocol::{AuthMethod, ReplyCode};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const RESOLVER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const EVENTS_CAPACITY: usize = 1024;

/// ProxyEngine owns the multiplexer and every piece of mutable proxy state.
/// Nothing here is shared across threads, so nothing is locked
pub struct ProxyEngine {
    poll: Poll,
    listener: TcpListener,
    resolver: DnsClient,
    cache: DomainNameCache,
    queue: ResolutionQueue,
    connections: HashMap<Token, Connection>,
    // Tokens are never reused, so a stale handle can only miss
    next_token: usize,
    buffer_size: usize,
    dns_timeout: Option<Duration>,
}

impl ProxyEngine {
    /// bind opens the listener and the resolver channel and registers both
    pub fn bind(
        listen_addr: SocketAddr,
        dns_server: SocketAddr,
        config: &ProxyConfig,
    ) -> io::Result<Self> {
        // Replies are queued whole in a relay buffer
        if config.buffer_size < MIN_BUFFER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "buffer size {} cannot hold a connect reply (min {MIN_BUFFER_SIZE})",
                    config.buffer_size
                ),
            ));
        }

        let poll = Poll::new()?;

        let mut listener = TcpListener::bind(listen_addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let mut resolver = DnsClient::bind(dns_server)?;
        poll.registry()
            .register(resolver.socket_mut(), RESOLVER, Interest::READABLE)?;
        debug!("resolver channel bound on {}", resolver.local_addr()?);

        Ok(Self {
            poll,
            listener,
            resolver,
            cache: DomainNameCache::new(config.dns_ttl),
            queue: ResolutionQueue::new(),
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            buffer_size: config.buffer_size,
            dns_timeout: config.dns_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dns_server(&self) -> SocketAddr {
        self.resolver.server()
    }

    /// run blocks on the multiplexer and dispatches readiness until polling
    /// itself fails. Failures on individual sockets never end the loop
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("readiness multiplexer failed: {e}");
                return Err(e);
            }

            for event in events.iter() {
                self.dispatch(event);
            }

            self.expire_lookups(Instant::now());
        }
    }

    fn dispatch(&mut self, event: &Event) {
        match event.token() {
            LISTENER => self.accept_clients(),
            RESOLVER => self.handle_dns_responses(),
            token => {
                if let Err(err) = self.service(token, event) {
                    match &err {
                        ProxyError::Transport(e) => debug!("connection {token:?} failed: {e}"),
                        other => warn!("connection {token:?} failed: {other}"),
                    }
                    self.close(token);
                }
            }
        }
    }

    // Runs the read and then the write side of one event, each only if that
    // interest is still enabled: an earlier handler in this pass may have
    // changed it, or closed the socket altogether
    fn service(&mut self, token: Token, event: &Event) -> Result<()> {
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed() || event.is_error();

        if readable && self.wants(token, Interest::READABLE) {
            self.handle_read(token)?;
        }

        if writable && self.wants(token, Interest::WRITABLE) {
            let connecting = self
                .connections
                .get(&token)
                .and_then(|conn| conn.record.as_ref())
                .is_some_and(|record| record.awaiting_connect);

            if connecting {
                self.handle_connect(token)?;
            } else {
                self.handle_write(token)?;
            }
        }

        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = self.next_token();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!("failed to register client {peer_addr}: {e}");
                        continue;
                    }

                    info!("new client: {peer_addr}");
                    self.connections.insert(
                        token,
                        Connection::new(stream, peer_addr, Some(Interest::READABLE)),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("failed to accept client: {e}");
                    break;
                }
            }
        }
    }

    // =============
    // READ HANDLER
    // =============

    fn handle_read(&mut self, token: Token) -> Result<()> {
        let buffer_size = self.buffer_size;
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        // First readable event of an accepted socket attaches its record
        let record = conn
            .record
            .get_or_insert_with(|| ConnectionRecord::client(buffer_size));

        let n = match record.input.fill_from(&mut conn.stream) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let state = record.state;
        let paired = record.paired;
        let peer_addr = conn.peer_addr;

        if n == 0 {
            debug!("{peer_addr} closed its side");
            self.close(token);
            return Ok(());
        }

        match state {
            // Decoding happens once the socket can take the reply
            ConnectionState::Authorizing | ConnectionState::Connecting => {
                conn.set_interest(registry, token, Some(Interest::WRITABLE))?;
            }
            ConnectionState::Proxying => match paired {
                None => self.close(token),
                Some(peer) => {
                    debug!("{peer_addr} sent {n} bytes");
                    conn.disable(registry, token, Interest::READABLE)?;
                    self.enable_or_close(peer, Interest::WRITABLE);
                }
            },
        }

        Ok(())
    }

    // ==============
    // WRITE HANDLER
    // ==============

    fn handle_write(&mut self, token: Token) -> Result<()> {
        let state = match self.connections.get(&token).and_then(|c| c.record.as_ref()) {
            Some(record) => record.state,
            None => return Ok(()),
        };

        match state {
            ConnectionState::Authorizing => self.authorize(token),
            ConnectionState::Connecting => self.handle_connection_request(token),
            ConnectionState::Proxying => self.relay(token),
        }
    }

    fn authorize(&mut self, token: Token) -> Result<()> {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        let Some(record) = conn.record.as_mut() else {
            return Ok(());
        };

        let (request, consumed) = match AuthRequest::decode(record.input.pending()) {
            Ok(decoded) => decoded,
            Err(ProtocolError::Incomplete) => {
                conn.set_interest(registry, token, Some(Interest::READABLE))?;
                return Ok(());
            }
            // No reply on a malformed greeting, the connection just closes
            Err(e) => return Err(e.into()),
        };

        let method = request.choose_method();
        write_reply(&mut conn.stream, &encode_method_choice(method))?;

        if method == AuthMethod::NoAcceptable {
            warn!("couldn't authorize {}: no acceptable method", conn.peer_addr);
            self.close(token);
            return Ok(());
        }

        info!("{} successfully authorized", conn.peer_addr);
        record.input.consume(consumed);
        record.state = ConnectionState::Connecting;

        // A connect request pipelined behind the greeting is handled right away
        let next = if record.input.is_empty() {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        };
        conn.set_interest(registry, token, Some(next))?;

        Ok(())
    }

    fn handle_connection_request(&mut self, token: Token) -> Result<()> {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        let Some(record) = conn.record.as_mut() else {
            return Ok(());
        };

        let (request, consumed) = match ConnectionRequest::decode(record.input.pending()) {
            Ok(decoded) => decoded,
            Err(ProtocolError::Incomplete) => {
                conn.set_interest(registry, token, Some(Interest::READABLE))?;
                return Ok(());
            }
            Err(e) => {
                warn!("connect request error from {}: {e}", conn.peer_addr);
                let reply = ConnectionResponse::failure(e.reply_code()).encode();
                return self.reply_and_close(token, &reply);
            }
        };

        // Whatever follows the request is payload for the destination
        record.input.consume(consumed);
        info!("{} requested {request}", conn.peer_addr);

        self.resolve_destination(token, request)
    }

    fn relay(&mut self, token: Token) -> Result<()> {
        let Some(paired) = self
            .connections
            .get(&token)
            .and_then(|c| c.record.as_ref())
            .map(|record| record.paired)
        else {
            return Ok(());
        };

        // What this socket sends is its peer's input, or whatever the peer
        // left behind when it closed
        let mut buffer = match paired {
            Some(peer) => self
                .connections
                .get_mut(&peer)
                .and_then(|c| c.record.as_mut())
                .map(|record| std::mem::take(&mut record.input)),
            None => self
                .connections
                .get_mut(&token)
                .and_then(|c| c.record.as_mut())
                .and_then(|record| record.inherited.take()),
        }
        .unwrap_or_default();

        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        let peer_addr = conn.peer_addr;
        let result = buffer.drain_into(&mut conn.stream);
        let drained = buffer.is_empty();

        match paired {
            Some(peer) => {
                if let Some(record) = self
                    .connections
                    .get_mut(&peer)
                    .and_then(|c| c.record.as_mut())
                {
                    record.input = buffer;
                }
            }
            None if !drained => {
                if let Some(record) = self
                    .connections
                    .get_mut(&token)
                    .and_then(|c| c.record.as_mut())
                {
                    record.inherited = Some(buffer);
                }
            }
            None => {}
        }

        let written = result?;
        debug!("wrote {written} bytes to {peer_addr}");

        // Partial write: the next writable edge resumes it
        if !drained {
            return Ok(());
        }

        match paired {
            None => {
                debug!("flushed remaining bytes to {peer_addr}");
                self.close(token);
            }
            Some(peer) => {
                self.disable(token, Interest::WRITABLE)?;
                self.enable_or_close(peer, Interest::READABLE);
            }
        }

        Ok(())
    }

    // ============================
    // DESTINATION LIFECYCLE
    // ============================

    fn resolve_destination(&mut self, token: Token, request: ConnectionRequest) -> Result<()> {
        // Literal addresses are used as-is, no lookup
        if let Some(ip) = request.address.literal_ip() {
            return self.start_destination(token, ip, request);
        }

        let host = request
            .hostname()
            .ok_or(ProtocolError::Malformed("request carries no hostname"))?;

        if let Some(ip) = self.cache.get(&host) {
            debug!("cache hit for {host}: {ip}");
            return self.start_destination(token, ip, request);
        }

        // Park the client until the answer arrives
        let registry = self.poll.registry();
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.set_interest(registry, token, None)?;
            if let Some(record) = conn.record.as_mut() {
                record.request = Some(request.clone());
            }
        }

        if self.queue.put(&host, token) {
            info!("resolving {host}");
            if let Err(e) = self.resolver.send(&host) {
                warn!("couldn't send lookup for {host}: {e}");
                // Nobody else can be waiting on a query that was never sent
                self.queue.remove(&host);
                let reply = ConnectionResponse::new(ReplyCode::ServerFailure, &request).encode();
                return self.reply_and_close(token, &reply);
            }
        } else {
            debug!("joined in-flight lookup for {host}");
        }

        Ok(())
    }

    fn start_destination(
        &mut self,
        client: Token,
        ip: IpAddr,
        request: ConnectionRequest,
    ) -> Result<()> {
        let target = SocketAddr::new(ip, request.port);

        let mut stream = match TcpStream::connect(target) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("couldn't connect to {request} ({target}): {e}");
                let reply = ConnectionResponse::new(ReplyCode::from_io_error(&e), &request).encode();
                return self.reply_and_close(client, &reply);
            }
        };

        // Connect completion shows up as writability
        let dest = self.next_token();
        self.poll
            .registry()
            .register(&mut stream, dest, Interest::WRITABLE)?;

        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&client) else {
            return Ok(());
        };
        conn.set_interest(registry, client, None)?;
        info!("{} connecting to {target}", conn.peer_addr);

        if let Some(record) = conn.record.as_mut() {
            record.state = ConnectionState::Proxying;
            record.paired = Some(dest);
            record.request = Some(request.clone());
        }

        // Paired before the connect completes
        let dest_record = ConnectionRecord::destination(client, request);
        let mut dest_conn = Connection::new(stream, target, Some(Interest::WRITABLE));
        dest_conn.record = Some(dest_record);
        self.connections.insert(dest, dest_conn);

        Ok(())
    }

    fn handle_connect(&mut self, dest: Token) -> Result<()> {
        let buffer_size = self.buffer_size;
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&dest) else {
            return Ok(());
        };

        let outcome = match conn.stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match conn.stream.peer_addr() {
                Ok(_) => Ok(()),
                // Woken before the handshake finished
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => Err(e),
            },
        };

        let Some(record) = conn.record.as_mut() else {
            return Ok(());
        };
        let request = record
            .request
            .clone()
            .ok_or(ProtocolError::Malformed("destination without a request"))?;
        record.awaiting_connect = false;
        record.input = RelayBuffer::new(buffer_size);

        let client = match (outcome, record.paired) {
            (Err(e), _) => {
                warn!("couldn't connect to {request}: {e}");
                // The reply rides the destination's buffer; closing hands it to the client
                let reply = ConnectionResponse::new(ReplyCode::from_io_error(&e), &request).encode();
                if !record.input.extend_from_slice(&reply) {
                    warn!("connect failure reply for {request} does not fit the relay buffer");
                }
                self.close(dest);
                return Ok(());
            }
            (Ok(()), None) => {
                debug!("client left before {request} connected");
                self.close(dest);
                return Ok(());
            }
            (Ok(()), Some(client)) => client,
        };

        // GRANTED is the first thing the client reads from this side
        let reply = ConnectionResponse::new(ReplyCode::Succeeded, &request).encode();
        if !record.input.extend_from_slice(&reply) {
            return Err(ProtocolError::Malformed("reply does not fit the relay buffer").into());
        }
        conn.set_interest(registry, dest, None)?;
        info!("connected to {request}");

        let Some(client_conn) = self.connections.get_mut(&client) else {
            return Ok(());
        };
        let pipelined = match client_conn.record.as_mut() {
            Some(client_record) => {
                client_record.state = ConnectionState::Proxying;
                !client_record.input.is_empty()
            }
            None => false,
        };

        if pipelined {
            // Payload that arrived with the request goes out first
            client_conn.set_interest(registry, client, Some(Interest::WRITABLE))?;
            self.enable_or_close(dest, Interest::WRITABLE);
        } else {
            client_conn.set_interest(
                registry,
                client,
                Some(Interest::READABLE | Interest::WRITABLE),
            )?;
        }

        Ok(())
    }

    // ======
    // DNS
    // ======

    fn handle_dns_responses(&mut self) {
        loop {
            match self.resolver.receive() {
                Ok(Some(DnsAnswer::Resolved { domain, address })) => {
                    info!("resolved {domain} to {address}");
                    self.cache.put(domain.clone(), address);

                    // One answer serves every connection waiting on the name
                    for waiter in self.queue.remove(&domain).unwrap_or_default() {
                        self.resume_waiter(waiter, address);
                    }
                }
                Ok(Some(DnsAnswer::Failed { domain, reason })) => {
                    warn!("failed to resolve {domain}: {reason}");
                    let waiters = self.queue.remove(&domain).unwrap_or_default();
                    self.fail_waiters(waiters);
                }
                Ok(None) => break,
                // Keep reading: with edge-triggered readiness, anything left
                // queued here would wait for the next datagram to re-arm
                Err(ProxyError::Transport(e)) => warn!("resolver channel error: {e}"),
                Err(e) => warn!("dropping DNS response: {e}"),
            }
        }
    }

    fn resume_waiter(&mut self, waiter: Token, address: IpAddr) {
        let request = self
            .connections
            .get_mut(&waiter)
            .and_then(|conn| conn.record.as_mut())
            .and_then(|record| record.request.take());

        let Some(request) = request else {
            debug!("waiter {waiter:?} left before its lookup finished");
            return;
        };

        if let Err(e) = self.start_destination(waiter, address, request) {
            warn!("failed to start destination for {waiter:?}: {e}");
            self.close(waiter);
        }
    }

    fn fail_waiters(&mut self, waiters: HashSet<Token>) {
        for waiter in waiters {
            let reply = match self
                .connections
                .get(&waiter)
                .and_then(|conn| conn.record.as_ref())
                .and_then(|record| record.request.as_ref())
            {
                Some(request) => ConnectionResponse::new(ReplyCode::HostUnreachable, request).encode(),
                None => continue,
            };

            if let Err(e) = self.reply_and_close(waiter, &reply) {
                debug!("failed to notify {waiter:?}: {e}");
                self.close(waiter);
            }
        }
    }

    fn expire_lookups(&mut self, now: Instant) {
        let Some(timeout) = self.dns_timeout else {
            return;
        };

        for (domain, waiters) in self.queue.expire(now, timeout) {
            warn!("lookup of {domain} timed out after {timeout:?}");
            self.fail_waiters(waiters);
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let timeout = self.dns_timeout?;
        let deadline = self.queue.next_deadline(timeout)?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    // =========
    // HELPERS
    // =========

    /// reply_and_close queues a final reply on a connection that has no
    /// destination; the write handler flushes it and then closes
    fn reply_and_close(&mut self, token: Token, reply: &[u8]) -> Result<()> {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        let Some(record) = conn.record.as_mut() else {
            return Ok(());
        };

        let mut pending = RelayBuffer::new(reply.len());
        pending.extend_from_slice(reply);

        record.state = ConnectionState::Proxying;
        record.paired = None;
        record.input.clear();
        record.inherited = Some(pending);
        conn.set_interest(registry, token, Some(Interest::WRITABLE))?;

        Ok(())
    }

    /// close tears down one socket. A paired peer is unpaired, inherits any
    /// bytes still buffered for it and is made writable so it flushes them
    /// before closing in turn
    fn close(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        if let Err(e) = conn.set_interest(self.poll.registry(), token, None) {
            debug!("failed to deregister {}: {e}", conn.peer_addr);
        }
        info!("closing {}", conn.peer_addr);

        let record = conn.record.take();
        drop(conn);

        let Some(record) = record else {
            return;
        };
        let Some(peer) = record.paired else {
            return;
        };
        let Some(peer_conn) = self.connections.get_mut(&peer) else {
            return;
        };

        if let Some(peer_record) = peer_conn.record.as_mut() {
            peer_record.paired = None;
            if !record.input.is_empty() {
                peer_record.inherited = Some(record.input);
            }
        }

        if let Err(e) = peer_conn.set_interest(self.poll.registry(), peer, Some(Interest::WRITABLE)) {
            debug!("failed to flush {}: {e}", peer_conn.peer_addr);
            self.close(peer);
        }
    }

    fn enable_or_close(&mut self, token: Token, interest: Interest) {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.enable(registry, token, interest) {
            debug!("failed to update interest of {}: {e}", conn.peer_addr);
            self.close(token);
        }
    }

    fn disable(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        match self.connections.get_mut(&token) {
            Some(conn) => conn.disable(registry, token, interest),
            None => Ok(()),
        }
    }

    fn wants(&self, token: Token, interest: Interest) -> bool {
        self.connections
            .get(&token)
            .is_some_and(|conn| conn.wants(interest))
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}

// Replies are a few bytes written on a socket that just reported writable
fn write_reply(stream: &mut TcpStream, reply: &[u8]) -> io::Result<()> {
    let n = stream.write(reply)?;
    if n < reply.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "reply was only partially written",
        ));
    }
    Ok(())
}
