//! Hostname resolution for the engine: a TTL cache, a queue that folds
//! concurrent lookups of one name into a single query, and the UDP channel
//! the queries travel over.

pub mod cache;
pub mod queue;
pub mod resolver;

pub use cache::DomainNameCache;
pub use queue::ResolutionQueue;
pub use resolver::{DnsAnswer, DnsClient};

/// normalize turns a hostname into the key used by the cache and the queue:
/// ASCII lowercase, no trailing dot
pub fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_root_and_case() {
        assert_eq!(normalize("WWW.Example.com."), "www.example.com");
        assert_eq!(normalize("localhost"), "localhost");
    }
}
