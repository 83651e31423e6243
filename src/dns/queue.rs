use mio::Token;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Waiters parked on one outstanding query
#[derive(Debug)]
struct PendingLookup {
    waiters: HashSet<Token>,
    requested_at: Instant,
}

/// ResolutionQueue tracks which connections are waiting on which hostname.
/// A hostname is a key at most once, so identical lookups share one query
#[derive(Debug, Default)]
pub struct ResolutionQueue {
    pending: HashMap<String, PendingLookup>,
}

/// ResolutionQueue implementation block
impl ResolutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// put parks a waiter under a hostname. Returns true when no lookup for the
    /// name was in flight, meaning the caller must send the query
    pub fn put(&mut self, name: &str, waiter: Token) -> bool {
        self.put_at(name, waiter, Instant::now())
    }

    pub fn put_at(&mut self, name: &str, waiter: Token, now: Instant) -> bool {
        match self.pending.get_mut(name) {
            Some(lookup) => {
                lookup.waiters.insert(waiter);
                false
            }
            None => {
                let mut waiters = HashSet::new();
                waiters.insert(waiter);
                self.pending.insert(
                    name.to_string(),
                    PendingLookup {
                        waiters,
                        requested_at: now,
                    },
                );
                true
            }
        }
    }

    /// remove pops every waiter for a hostname at once
    pub fn remove(&mut self, name: &str) -> Option<HashSet<Token>> {
        self.pending.remove(name).map(|lookup| lookup.waiters)
    }

    /// expire pops the lookups that have been outstanding longer than timeout
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(String, HashSet<Token>)> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, lookup)| now.saturating_duration_since(lookup.requested_at) >= timeout)
            .map(|(name, _)| name.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|name| {
                let waiters = self.remove(&name)?;
                Some((name, waiters))
            })
            .collect()
    }

    /// next_deadline is when the oldest outstanding lookup times out
    pub fn next_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.pending
            .values()
            .map(|lookup| lookup.requested_at + timeout)
            .min()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
