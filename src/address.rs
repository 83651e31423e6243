use crate::error::ProtocolError;
use crate::protocol::AddressType;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address represents a network address or domain to be used as the
/// SOCKS5 target address, kept in its wire form so replies can echo it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4]),
    DomainName(String),
    IPv6([u8; 16]),
}

/// Address implementation block
impl Address {
    /// address_type returns the ATYP byte this address is encoded with
    pub fn address_type(&self) -> AddressType {
        match self {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(_) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }

    /// literal_ip returns the address for IPv4/IPv6 literals, including a
    /// dotted or colon form sent as a domain name. Anything else needs resolving
    pub fn literal_ip(&self) -> Option<IpAddr> {
        match self {
            Address::IPv4(octets) => Some(IpAddr::V4(Ipv4Addr::from(*octets))),
            Address::IPv6(octets) => Some(IpAddr::V6(Ipv6Addr::from(*octets))),
            Address::DomainName(domain) => domain.parse().ok(),
        }
    }

    /// encode appends ATYP and DST.ADDR to a message being built
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.address_type() as u8);
        match self {
            Address::IPv4(octets) => out.extend_from_slice(octets),
            Address::IPv6(octets) => out.extend_from_slice(octets),
            Address::DomainName(domain) => {
                // Decoding caps the length at 255, so the cast cannot truncate
                out.push(domain.len() as u8);
                out.extend_from_slice(domain.as_bytes());
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(octets) => Ipv4Addr::from(*octets).fmt(f),
            Address::IPv6(octets) => Ipv6Addr::from(*octets).fmt(f),
            Address::DomainName(domain) => domain.fmt(f),
        }
    }
}

/// parse_address parses DST.ADDR and DST.PORT of the given type starting at offset,
/// pushing the offset past both
pub fn parse_address(
    data: &[u8],
    offset: &mut usize,
    addr_type: AddressType,
) -> Result<(Address, u16), ProtocolError> {
    match addr_type {
        AddressType::IPv4 => parse_ipv4_address(data, offset),
        AddressType::DomainName => parse_domain_address(data, offset),
        AddressType::IPv6 => parse_ipv6_address(data, offset),
    }
}

/// parse_ipv4_address parses an IPv4 address and port from a byte slice
pub fn parse_ipv4_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<(Address, u16), ProtocolError> {
    // IPv4 address + port -> 6 bytes
    if *offset + 6 > data.len() {
        return Err(ProtocolError::Incomplete);
    }

    let mut octets = [0u8; 4];
    octets.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;

    let port = parse_port(data, offset);
    Ok((Address::IPv4(octets), port))
}

/// parse_ipv6_address parses an IPv6 address and port from a byte slice
pub fn parse_ipv6_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<(Address, u16), ProtocolError> {
    // IPv6 address + port -> 18 bytes
    if *offset + 18 > data.len() {
        return Err(ProtocolError::Incomplete);
    }

    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[*offset..*offset + 16]);
    *offset += 16;

    let port = parse_port(data, offset);
    Ok((Address::IPv6(octets), port))
}

/// parse_domain_address parses a length-prefixed domain and port from a byte slice
pub fn parse_domain_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<(Address, u16), ProtocolError> {
    if *offset + 1 > data.len() {
        return Err(ProtocolError::Incomplete);
    }

    // First octet of the domain holds the number of octets to follow
    let domain_len = data[*offset] as usize;
    if domain_len == 0 {
        return Err(ProtocolError::Malformed("domain length cannot be 0"));
    }

    if *offset + 1 + domain_len + 2 > data.len() {
        return Err(ProtocolError::Incomplete);
    }

    let start = *offset + 1;
    let domain = std::str::from_utf8(&data[start..start + domain_len])
        .map_err(|_| ProtocolError::Malformed("domain is not valid UTF-8"))?
        .to_string();
    *offset = start + domain_len;

    let port = parse_port(data, offset);
    Ok((Address::DomainName(domain), port))
}

// Callers have already checked that two bytes remain
fn parse_port(data: &[u8], offset: &mut usize) -> u16 {
    let port = u16::from_be_bytes([data[*offset], data[*offset + 1]]);
    *offset += 2;
    port
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_with_big_endian_port() {
        let data = [0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];
        let mut offset = 0;
        let (addr, port) = parse_ipv4_address(&data, &mut offset).unwrap();

        assert_eq!(addr, Address::IPv4([127, 0, 0, 1]));
        assert_eq!(port, 8080);
        assert_eq!(offset, 6);
        assert_eq!(addr.literal_ip(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn short_ipv6_is_incomplete() {
        let data = [0u8; 17];
        let mut offset = 0;
        assert_eq!(
            parse_ipv6_address(&data, &mut offset),
            Err(ProtocolError::Incomplete)
        );
        assert_eq!(offset, 0);
    }

    #[test]
    fn parses_ipv6_with_port() {
        let mut data = Ipv6Addr::LOCALHOST.octets().to_vec();
        data.extend_from_slice(&[0x01, 0xBB]);
        let mut offset = 0;
        let (addr, port) = parse_address(&data, &mut offset, AddressType::IPv6).unwrap();

        assert_eq!(addr, Address::IPv6(Ipv6Addr::LOCALHOST.octets()));
        assert_eq!(port, 443);
        assert_eq!(offset, 18);
        assert_eq!(addr.literal_ip(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(addr.to_string(), "::1");

        let mut encoded = Vec::new();
        addr.encode(&mut encoded);
        assert_eq!(encoded[0], 0x04);
        assert_eq!(&encoded[1..], &data[..16]);
    }

    #[test]
    fn parses_domain() {
        let mut data = vec![11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&443u16.to_be_bytes());
        let mut offset = 0;
        let (addr, port) = parse_domain_address(&data, &mut offset).unwrap();

        assert_eq!(addr, Address::DomainName("example.com".into()));
        assert_eq!(port, 443);
        assert_eq!(offset, data.len());
        assert_eq!(addr.literal_ip(), None);
    }

    #[test]
    fn literal_in_domain_field_needs_no_lookup() {
        let addr = Address::DomainName("10.0.0.7".into());
        assert_eq!(addr.literal_ip(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
    }

    #[test]
    fn empty_domain_is_malformed() {
        let data = [0u8, 0x00, 0x50];
        let mut offset = 0;
        assert!(matches!(
            parse_domain_address(&data, &mut offset),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn encode_echoes_wire_form() {
        let mut out = Vec::new();
        Address::DomainName("a.io".into()).encode(&mut out);
        assert_eq!(out, vec![0x03, 4, b'a', b'.', b'i', b'o']);
    }
}
