use crate::address::{Address, parse_address};
use crate::error::ProtocolError;
use crate::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use std::fmt;

/// ConnectionRequest is a decoded client request. It is kept on the
/// destination side for the whole connect attempt so replies can echo it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

/// ConnectionRequest implementation block
impl ConnectionRequest {
    /// decode parses a client request from the front of a buffer and returns it
    /// together with the number of bytes it occupied
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        // SOCKS5 request format
        // +----+-----+-------+------+----------+----------+
        // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+

        if buf.is_empty() {
            return Err(ProtocolError::Incomplete);
        }

        // Ensure version is 0x05 -> SOCKS5
        if buf[0] != Version::SOCKS5 as u8 {
            return Err(ProtocolError::UnsupportedVersion(buf[0]));
        }

        if buf.len() < 4 {
            return Err(ProtocolError::Incomplete);
        }

        if buf[2] != RSV {
            return Err(ProtocolError::Reserved(buf[2]));
        }

        // Only CONNECT is served: BIND, UDP ASSOCIATE and unknown bytes all fail here
        let command = match Command::from_byte(buf[1]) {
            Some(command) if command.is_supported() => command,
            _ => return Err(ProtocolError::CommandNotSupported(buf[1])),
        };

        let addr_type =
            AddressType::from_byte(buf[3]).ok_or(ProtocolError::AddressNotSupported(buf[3]))?;

        let mut offset = 4;
        let (address, port) = parse_address(buf, &mut offset, addr_type)?;

        Ok((
            Self {
                command,
                address,
                port,
            },
            offset,
        ))
    }

    /// hostname returns the normalized domain name for domain requests
    pub fn hostname(&self) -> Option<String> {
        match &self.address {
            Address::DomainName(domain) => Some(crate::dns::normalize(domain)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Address::IPv6(_) => write!(f, "[{}]:{}", self.address, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

/// ConnectionResponse is an encode-only connect reply
#[derive(Debug, Clone, Copy)]
pub struct ConnectionResponse<'a> {
    pub reply_code: ReplyCode,
    pub request: Option<&'a ConnectionRequest>,
}

/// ConnectionResponse implementation block
impl<'a> ConnectionResponse<'a> {
    /// new builds a reply echoing the address fields of the request it answers
    pub fn new(reply_code: ReplyCode, request: &'a ConnectionRequest) -> Self {
        Self {
            reply_code,
            request: Some(request),
        }
    }

    /// failure builds a reply for a request that never decoded far enough to echo
    pub fn failure(reply_code: ReplyCode) -> Self {
        Self {
            reply_code,
            request: None,
        }
    }

    /// encode serializes the reply
    pub fn encode(&self) -> Vec<u8> {
        // SOCKS5 reply format
        // +----+-----+-------+------+----------+----------+
        // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+

        let mut reply = vec![Version::SOCKS5 as u8, self.reply_code as u8, RSV];

        match self.request {
            Some(request) => {
                request.address.encode(&mut reply);
                reply.extend_from_slice(&request.port.to_be_bytes());
            }
            None => {
                // 0.0.0.0:0
                Address::IPv4([0; 4]).encode(&mut reply);
                reply.extend_from_slice(&[0, 0]);
            }
        }

        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECT_LOCALHOST_8080: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];

    #[test]
    fn granted_reply_echoes_request() {
        let (request, len) = ConnectionRequest::decode(&CONNECT_LOCALHOST_8080).unwrap();
        assert_eq!(len, 10);
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.port, 8080);
        assert_eq!(request.to_string(), "127.0.0.1:8080");

        let reply = ConnectionResponse::new(ReplyCode::Succeeded, &request).encode();
        assert_eq!(
            reply,
            vec![0x05, 0x00, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90]
        );
    }

    #[test]
    fn bind_is_not_supported() {
        let buf = [0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let err = ConnectionRequest::decode(&buf).unwrap_err();
        assert_eq!(err, ProtocolError::CommandNotSupported(0x02));
        assert_eq!(err.reply_code(), ReplyCode::CommandNotSupported);
    }

    #[test]
    fn unknown_address_type_is_not_supported() {
        let buf = [0x05, 0x01, 0x00, 0x02, 0, 0, 0, 0, 0, 0];
        let err = ConnectionRequest::decode(&buf).unwrap_err();
        assert_eq!(err, ProtocolError::AddressNotSupported(0x02));

        let reply = ConnectionResponse::failure(err.reply_code()).encode();
        assert_eq!(reply, vec![0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn nonzero_reserved_byte_is_a_general_failure() {
        let mut buf = CONNECT_LOCALHOST_8080;
        buf[2] = 0x01;
        let err = ConnectionRequest::decode(&buf).unwrap_err();
        assert_eq!(err.reply_code(), ReplyCode::ServerFailure);
    }

    #[test]
    fn split_request_is_incomplete() {
        for cut in 1..CONNECT_LOCALHOST_8080.len() {
            assert_eq!(
                ConnectionRequest::decode(&CONNECT_LOCALHOST_8080[..cut]),
                Err(ProtocolError::Incomplete)
            );
        }
    }

    #[test]
    fn domain_request_is_normalized() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 12];
        buf.extend_from_slice(b"Example.COM.");
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.extend_from_slice(b"GET /");

        let (request, len) = ConnectionRequest::decode(&buf).unwrap();
        assert_eq!(&buf[len..], b"GET /");
        assert_eq!(request.hostname().as_deref(), Some("example.com"));

        let reply = ConnectionResponse::new(ReplyCode::ConnectionRefused, &request).encode();
        assert_eq!(reply[1], 0x05);
        assert_eq!(&reply[3..5], &[0x03, 12]);
        assert_eq!(&reply[reply.len() - 2..], &[0x00, 0x50]);
    }
}
