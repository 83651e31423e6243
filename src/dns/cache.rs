use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a resolved address is trusted
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// DomainNameEntry is a cached address and the moment it stops being valid
#[derive(Debug, Clone, Copy)]
pub struct DomainNameEntry {
    pub address: IpAddr,
    pub expires_at: Instant,
}

/// DomainNameCache maps hostnames to resolved addresses for a fixed TTL.
/// Expired entries are evicted by the lookup that finds them
#[derive(Debug)]
pub struct DomainNameCache {
    ttl: Duration,
    hosts: HashMap<String, DomainNameEntry>,
}

impl Default for DomainNameCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// DomainNameCache implementation block
impl DomainNameCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            hosts: HashMap::new(),
        }
    }

    /// get returns the cached address if present and unexpired
    pub fn get(&mut self, name: &str) -> Option<IpAddr> {
        self.get_at(name, Instant::now())
    }

    pub fn get_at(&mut self, name: &str, now: Instant) -> Option<IpAddr> {
        let entry = self.hosts.get(name)?;
        if entry.expires_at <= now {
            debug!("cached address for {name} expired");
            self.hosts.remove(name);
            return None;
        }
        Some(entry.address)
    }

    /// put stores an address, overwriting any previous entry for the name
    pub fn put(&mut self, name: impl Into<String>, address: IpAddr) {
        self.put_at(name, address, Instant::now());
    }

    pub fn put_at(&mut self, name: impl Into<String>, address: IpAddr, now: Instant) {
        let entry = DomainNameEntry {
            address,
            expires_at: now + self.ttl,
        };
        self.hosts.insert(name.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
