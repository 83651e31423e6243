//! A lightweight, single-threaded SOCKS5 proxy library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT
//!     - No Authentication
//!     - One thread, one `mio` poll loop for every socket: no thread or task per connection
//!     - Non-blocking DNS over UDP with a one-hour address cache
//!     - Concurrent lookups of the same hostname share a single query
//!     - One chunk in flight per relay direction as backpressure
//!     - Bytes already buffered for a peer are flushed before it is closed
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use pollproxy::Socks5Server;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut server = Socks5Server::new("127.0.0.1:1080");
//!     server.run()
//! }
//! ```

pub mod address;
pub mod auth;
pub mod commands;
pub mod config;
pub mod connection;
pub mod dns;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;

// Re-export main types at crate root for convenience
pub use config::ProxyConfig;
pub use error::{ProtocolError, ProxyError};
pub use protocol::{AddressType, AuthMethod, Command, ReplyCode, Version};
pub use server::Socks5Server;
