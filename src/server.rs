use crate::config::ProxyConfig;
use crate::dns::resolver::{FALLBACK_DNS_SERVER, system_nameserver};
use crate::engine::ProxyEngine;
use anyhow::{Context, Result, anyhow, bail};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{info, warn};

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub config: ProxyConfig,
    engine: Option<ProxyEngine>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self::with_config(ProxyConfig::new(listen_addr))
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        Self {
            config,
            engine: None,
        }
    }

    /// with_dns_server overrides the system nameserver
    pub fn with_dns_server(mut self, dns_server: SocketAddr) -> Self {
        self.config.dns_server = Some(dns_server);
        self
    }

    /// with_dns_timeout bounds how long a client may wait on a lookup
    pub fn with_dns_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.dns_timeout = timeout;
        self
    }

    pub fn with_dns_ttl(mut self, ttl: Duration) -> Self {
        self.config.dns_ttl = ttl;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    /// bind opens the listener and resolver channel, returning the bound address.
    /// Fails when called twice
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if self.engine.is_some() {
            bail!("bind can only be called once");
        }
        self.config.validate()?;

        let listen_addr = self
            .config
            .listen_addr
            .to_socket_addrs()
            .with_context(|| format!("invalid listen address {}", self.config.listen_addr))?
            .next()
            .ok_or_else(|| anyhow!("{} resolved to no address", self.config.listen_addr))?;

        let dns_server = match self.config.dns_server {
            Some(server) => server,
            None => system_nameserver().unwrap_or_else(|| {
                warn!("no system nameserver found: falling back to {FALLBACK_DNS_SERVER}");
                FALLBACK_DNS_SERVER
            }),
        };

        let engine = ProxyEngine::bind(listen_addr, dns_server, &self.config)
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        let addr = engine.local_addr()?;

        info!(
            "SOCKS5 proxy listening on {addr}, resolving through {}",
            engine.dns_server()
        );

        self.engine = Some(engine);
        Ok(addr)
    }

    /// run drives the event loop on the calling thread. It only returns if the
    /// readiness multiplexer fails
    pub fn run(&mut self) -> Result<()> {
        if self.engine.is_none() {
            self.bind()?;
        }
        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| anyhow!("server is not bound"))?;

        engine.run().context("event loop stopped")
    }
}
