//! Per-socket state owned by the engine's connection table.

use crate::commands::ConnectionRequest;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// ConnectionState is where a socket is in the SOCKS5 exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for (or answering) the method negotiation
    Authorizing,
    /// Waiting for (or resolving) the connect request
    Connecting,
    /// Relaying bytes, or flushing what is left before closing
    Proxying,
}

/// RelayBuffer is a fixed-capacity byte buffer filled from one socket and
/// drained into another. Bytes in `start..end` are pending
#[derive(Debug, Default)]
pub struct RelayBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl RelayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// pending is the unsent part of the buffer
    pub fn pending(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// consume marks n pending bytes as handled
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.is_empty() {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// extend_from_slice appends bytes, returning false if they do not fit
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> bool {
        self.compact();
        if self.capacity() - self.end < bytes.len() {
            return false;
        }
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        true
    }

    /// fill_from does one read into the free tail. Ok(0) means either EOF or a
    /// full buffer; both end the connection
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.compact();
        if self.end == self.capacity() {
            return Ok(0);
        }
        let n = reader.read(&mut self.data[self.end..])?;
        self.end += n;
        Ok(n)
    }

    /// drain_into writes pending bytes until the buffer is empty or the writer
    /// would block. Returns the number of bytes written
    pub fn drain_into<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut written = 0;
        while !self.is_empty() {
            match writer.write(self.pending()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.start += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.is_empty() {
            self.clear();
        }
        Ok(written)
    }

    // Moves pending bytes to the front so the tail is free for reading
    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

/// ConnectionRecord is the protocol state of one socket.
///
/// A record owns exactly one buffer, `input`, filled from its own socket. What
/// a record sends is its paired record's `input`, looked up by handle, so a
/// client and its destination never alias a buffer. When the paired side
/// closes first, its undelivered bytes move here as `inherited`
#[derive(Debug)]
pub struct ConnectionRecord {
    pub state: ConnectionState,
    pub input: RelayBuffer,
    pub paired: Option<Token>,
    pub request: Option<ConnectionRequest>,
    /// Destination sockets whose non-blocking connect has not finished
    pub awaiting_connect: bool,
    pub inherited: Option<RelayBuffer>,
}

impl ConnectionRecord {
    /// client builds the record attached on a client's first readable event
    pub fn client(buffer_size: usize) -> Self {
        Self {
            state: ConnectionState::Authorizing,
            input: RelayBuffer::new(buffer_size),
            paired: None,
            request: None,
            awaiting_connect: false,
            inherited: None,
        }
    }

    /// destination builds the record of an outbound socket that is still connecting.
    /// Its buffer is allocated once the connect finishes
    pub fn destination(client: Token, request: ConnectionRequest) -> Self {
        Self {
            state: ConnectionState::Proxying,
            input: RelayBuffer::default(),
            paired: Some(client),
            request: Some(request),
            awaiting_connect: true,
            inherited: None,
        }
    }
}

/// Connection is one slot of the engine's table: the socket, the interest it
/// is registered with, and its record once the first read has happened
pub struct Connection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub interest: Option<Interest>,
    pub record: Option<ConnectionRecord>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, interest: Option<Interest>) -> Self {
        Self {
            stream,
            peer_addr,
            interest,
            record: None,
        }
    }

    /// set_interest registers, re-registers or deregisters the socket. Every
    /// change goes through the registry, which re-arms edge-triggered readiness
    pub fn set_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Option<Interest>,
    ) -> io::Result<()> {
        match (self.interest, interest) {
            (None, None) => {}
            (None, Some(next)) => registry.register(&mut self.stream, token, next)?,
            (Some(_), Some(next)) => registry.reregister(&mut self.stream, token, next)?,
            (Some(_), None) => registry.deregister(&mut self.stream)?,
        }
        self.interest = interest;
        Ok(())
    }

    pub fn enable(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        let next = match self.interest {
            Some(current) => current.add(interest),
            None => interest,
        };
        self.set_interest(registry, token, Some(next))
    }

    pub fn disable(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        let next = self.interest.and_then(|current| current.remove(interest));
        self.set_interest(registry, token, next)
    }

    pub fn wants(&self, interest: Interest) -> bool {
        match self.interest {
            Some(current) => (interest.is_readable() && current.is_readable())
                || (interest.is_writable() && current.is_writable()),
            None => false,
        }
    }
}
