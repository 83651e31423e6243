use crate::dns::normalize;
use crate::error::{ProxyError, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use mio::net::UdpSocket;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

// Plain DNS over UDP without EDNS never exceeds 512 bytes
const MAX_DNS_DGRAM: usize = 512;

/// Used when the system resolver configuration cannot be read
pub const FALLBACK_DNS_SERVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);

/// DnsAnswer is the outcome of one response datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAnswer {
    Resolved { domain: String, address: IpAddr },
    Failed { domain: String, reason: String },
}

/// DnsClient is the engine's resolver channel: one non-blocking UDP socket
/// that sends A queries to a single server and decodes its answers
pub struct DnsClient {
    socket: UdpSocket,
    server: SocketAddr,
    next_id: u16,
}

/// DnsClient implementation block
impl DnsClient {
    /// bind opens the channel on an ephemeral port of the server's address family
    pub fn bind(server: SocketAddr) -> io::Result<Self> {
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)?;

        // Any starting point works, it only has to differ between runs
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(0);

        Ok(Self {
            socket,
            server,
            next_id: seed,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// socket exposes the channel for readiness registration
    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    /// send queues one A query for domain
    pub fn send(&mut self, domain: &str) -> Result<()> {
        let name = Name::from_ascii(domain)?;

        let mut message = Message::new();
        message
            .set_id(self.next_id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(name, RecordType::A));
        self.next_id = self.next_id.wrapping_add(1);

        let bytes = message.to_vec()?;
        self.socket.send_to(&bytes, self.server)?;

        debug!("sent A query for {domain} to {}", self.server);
        Ok(())
    }

    /// receive decodes the next datagram from the server. Ok(None) means the
    /// socket has nothing more to read
    pub fn receive(&mut self) -> Result<Option<DnsAnswer>> {
        let mut buf = [0u8; MAX_DNS_DGRAM];

        let len = loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) if from == self.server => break len,
                Ok((_, from)) => {
                    warn!("dropping DNS datagram from unexpected peer {from}");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };

        let message = Message::from_vec(&buf[..len])?;
        decode_answer(&message).map(Some)
    }
}

/// decode_answer extracts the queried name and its first A record
pub fn decode_answer(message: &Message) -> Result<DnsAnswer> {
    let domain = message
        .queries()
        .first()
        .map(|query| normalize(&query.name().to_ascii()))
        .ok_or_else(|| ProxyError::Resolution {
            domain: "<unknown>".to_string(),
            reason: "response carries no question".to_string(),
        })?;

    if message.response_code() != ResponseCode::NoError {
        return Ok(DnsAnswer::Failed {
            domain,
            reason: message.response_code().to_string(),
        });
    }

    let address = message
        .answers()
        .iter()
        .find_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            _ => None,
        });

    Ok(match address {
        Some(address) => DnsAnswer::Resolved { domain, address },
        None => DnsAnswer::Failed {
            domain,
            reason: "no A record in answer".to_string(),
        },
    })
}

/// system_nameserver returns the first nameserver of the host's resolver configuration
pub fn system_nameserver() -> Option<SocketAddr> {
    match hickory_resolver::system_conf::read_system_conf() {
        Ok((config, _)) => config.name_servers().first().map(|ns| ns.socket_addr),
        Err(err) => {
            warn!("failed to read system resolver configuration: {err}");
            None
        }
    }
}
