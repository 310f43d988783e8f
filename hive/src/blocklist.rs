//! Peers we refuse to talk to, for a while or forever.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use hive_base::{Address, StateStore, state::StateStoreError};
use serde::{Deserialize, Serialize};
use tracing::debug;

const KEY_PREFIX: &str = "blocklist-";

/// A blocklisted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedPeer {
    /// Overlay address of the peer.
    pub address: Address,
    /// Why it was blocked.
    pub reason: String,
    /// How long it stays blocked, [`Duration::ZERO`] for ever.
    pub duration: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    /// Unix time in milliseconds.
    timestamp: u64,
    /// Milliseconds, 0 is forever.
    duration: u64,
    reason: String,
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        self.duration != 0 && now > self.timestamp.saturating_add(self.duration)
    }
}

/// Returns the current time as unix milliseconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync + 'static>;

/// Persistent blocklist of peers.
///
/// Entries live in the state store under `blocklist-<address>` and expire
/// lazily when looked at.
#[derive(derive_more::Debug, Clone)]
pub struct Blocklist {
    store: StateStore,
    #[debug("Clock")]
    clock: Clock,
}

impl Blocklist {
    /// Creates a blocklist on the system clock.
    pub fn new(store: StateStore) -> Self {
        Self::with_clock(store, Arc::new(now_millis))
    }

    /// Creates a blocklist reading time from `clock`.
    pub fn with_clock(store: StateStore, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Whether `peer` is currently blocked. Expired entries are removed.
    pub fn exists(&self, peer: &Address) -> Result<bool, StateStoreError> {
        let key = key(peer);
        let Some(entry) = self.store.get::<Entry>(&key)? else {
            return Ok(false);
        };
        if entry.expired((self.clock)()) {
            self.store.delete(&key)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Blocks `peer` for `duration`, [`Duration::ZERO`] meaning forever.
    ///
    /// A peer that is already blocked stays blocked for the longer of the
    /// two durations, counted from now.
    pub fn add(
        &self,
        peer: Address,
        duration: Duration,
        reason: impl Into<String>,
    ) -> Result<(), StateStoreError> {
        let key = key(&peer);
        let mut duration = duration.as_millis() as u64;
        if let Some(existing) = self.store.get::<Entry>(&key)? {
            if existing.duration == 0 || (duration != 0 && existing.duration > duration) {
                duration = existing.duration;
            }
        }
        let entry = Entry {
            timestamp: (self.clock)(),
            duration,
            reason: reason.into(),
        };
        debug!(peer = %peer.fmt_short(), duration_ms = duration, reason = %entry.reason, "blocklisted");
        self.store.put(&key, &entry)
    }

    /// Unblocks `peer`.
    pub fn remove(&self, peer: &Address) -> Result<bool, StateStoreError> {
        self.store.delete(&key(peer))
    }

    /// All currently blocked peers.
    pub fn peers(&self) -> Result<Vec<BlockedPeer>, StateStoreError> {
        let now = (self.clock)();
        let mut out = Vec::new();
        for (key, entry) in self.store.iter_prefix::<Entry>(KEY_PREFIX)? {
            if entry.expired(now) {
                continue;
            }
            let Ok(address) = key[KEY_PREFIX.len()..].parse::<Address>() else {
                continue;
            };
            out.push(BlockedPeer {
                address,
                reason: entry.reason,
                duration: Duration::from_millis(entry.duration),
            });
        }
        Ok(out)
    }
}

fn key(peer: &Address) -> String {
    format!("{KEY_PREFIX}{peer}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn clocked() -> (Blocklist, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(1_000));
        let clock = {
            let now = now.clone();
            Arc::new(move || now.load(Ordering::SeqCst))
        };
        (
            Blocklist::with_clock(StateStore::in_memory().unwrap(), clock),
            now,
        )
    }

    #[test]
    fn entries_decay() {
        let (blocklist, now) = clocked();
        let p = Address::new([7; 32]);
        blocklist.add(p, Duration::from_millis(50), "slow").unwrap();
        assert!(blocklist.exists(&p).unwrap());
        assert_eq!(blocklist.peers().unwrap().len(), 1);

        now.fetch_add(100, Ordering::SeqCst);
        assert!(blocklist.peers().unwrap().is_empty());
        assert!(!blocklist.exists(&p).unwrap());
    }

    #[test]
    fn forever_wins() {
        let (blocklist, now) = clocked();
        let p = Address::new([7; 32]);
        blocklist.add(p, Duration::ZERO, "bad").unwrap();
        blocklist.add(p, Duration::from_millis(50), "slow").unwrap();
        now.fetch_add(1_000_000, Ordering::SeqCst);
        assert!(blocklist.exists(&p).unwrap());
        let peers = blocklist.peers().unwrap();
        assert_eq!(peers[0].address, p);
        assert_eq!(peers[0].duration, Duration::ZERO);
    }

    #[test]
    fn longer_duration_is_kept() {
        let (blocklist, now) = clocked();
        let p = Address::new([7; 32]);
        blocklist.add(p, Duration::from_millis(500), "a").unwrap();
        blocklist.add(p, Duration::from_millis(50), "b").unwrap();
        now.fetch_add(100, Ordering::SeqCst);
        assert!(blocklist.exists(&p).unwrap());
        assert!(blocklist.remove(&p).unwrap());
        assert!(!blocklist.exists(&p).unwrap());
    }
}
