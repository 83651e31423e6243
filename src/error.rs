//! Error types for the proxy engine.

use crate::protocol::ReplyCode;
use thiserror::Error;

/// Errors raised while decoding a SOCKS5 message from a connection's buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes buffered yet to decode the whole message
    #[error("incomplete message")]
    Incomplete,

    #[error("SOCKS version {0:#04x} not supported")]
    UnsupportedVersion(u8),

    #[error("command {0:#04x} not supported")]
    CommandNotSupported(u8),

    #[error("address type {0:#04x} not supported")]
    AddressNotSupported(u8),

    #[error("reserved byte is {0:#04x}, expected 0x00")]
    Reserved(u8),

    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

impl ProtocolError {
    /// reply_code picks the REP byte sent back when a connect request fails to decode
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ProtocolError::CommandNotSupported(_) => ReplyCode::CommandNotSupported,
            ProtocolError::AddressNotSupported(_) => ReplyCode::AddrTypeUnsupported,
            _ => ReplyCode::ServerFailure,
        }
    }
}

/// Errors that end a single connection (or a single DNS datagram). None of
/// them stops the event loop
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("dns message error: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),

    #[error("resolution of {domain} failed: {reason}")]
    Resolution { domain: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ProxyError>;
