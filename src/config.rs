//! Proxy configuration.

use crate::dns::cache::DEFAULT_TTL;
use anyhow::{Result, bail};
use std::net::SocketAddr;
use std::time::Duration;

/// Default size of each connection's relay buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// How long a connection may wait on a DNS answer before it is failed
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(10);

// Largest connect request: header + length byte + 255-byte domain + port
pub const MIN_BUFFER_SIZE: usize = 4 + 1 + 255 + 2;

/// ProxyConfig holds everything the engine needs at startup
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listener address
    pub listen_addr: String,
    /// DNS server queried for domain targets; the system nameserver when None
    pub dns_server: Option<SocketAddr>,
    /// Capacity of each connection's relay buffer
    pub buffer_size: usize,
    /// How long resolved addresses stay cached
    pub dns_ttl: Duration,
    /// Upper bound on waiting for a DNS answer; None waits forever
    pub dns_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:1080")
    }
}

impl ProxyConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            dns_server: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dns_ttl: DEFAULT_TTL,
            dns_timeout: Some(DEFAULT_DNS_TIMEOUT),
        }
    }

    /// validate rejects settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            bail!("listen address cannot be empty");
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            bail!(
                "buffer size {} is too small to hold a connect request (min {MIN_BUFFER_SIZE})",
                self.buffer_size
            );
        }
        if self.dns_ttl.is_zero() {
            bail!("DNS cache TTL cannot be zero");
        }
        if self.dns_timeout.is_some_and(|t| t.is_zero()) {
            bail!("DNS timeout cannot be zero, use None to disable it");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.dns_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn tiny_buffer_is_rejected() {
        let mut config = ProxyConfig::new("0.0.0.0:1080");
        config.buffer_size = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_listen_addr_is_rejected() {
        assert!(ProxyConfig::new("").validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = ProxyConfig::default();
        config.dns_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        config.dns_timeout = None;
        assert!(config.validate().is_ok());
    }
}
