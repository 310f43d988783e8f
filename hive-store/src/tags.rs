//! Upload tags: per upload progress counters.
//!
//! A tag follows the chunks of one upload from splitting to being synced
//! to the network. Tags live in memory and are written to the state store
//! under `tags_<uid>` when done with or on [`Tags::persist_all`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use hive_base::{Address, StateStore, chunk::TagId, state::StateStoreError};
use serde::{Deserialize, Serialize};
use tracing::debug;

const TAG_PREFIX: &str = "tags_";

/// The counters a tag keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum State {
    /// Chunk produced by the splitter.
    Split,
    /// Chunk was already present locally.
    Seen,
    /// Chunk stored locally.
    Stored,
    /// Chunk sent to the network.
    Sent,
    /// Chunk synced to its neighbourhood.
    Synced,
}

/// A snapshot of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    /// Unique id.
    pub uid: TagId,
    /// Free form name.
    pub name: String,
    /// Total number of chunks expected, 0 if unknown.
    pub total: u64,
    /// Chunks split.
    pub split: u64,
    /// Chunks already present.
    pub seen: u64,
    /// Chunks stored.
    pub stored: u64,
    /// Chunks sent.
    pub sent: u64,
    /// Chunks synced.
    pub synced: u64,
    /// Root address, once known.
    pub address: Option<Address>,
    /// Creation time, seconds since the epoch.
    pub started_at: u64,
}

/// Progress of one upload.
#[derive(Debug)]
pub struct Tag {
    uid: TagId,
    name: String,
    started_at: u64,
    total: AtomicU64,
    split: AtomicU64,
    seen: AtomicU64,
    stored: AtomicU64,
    sent: AtomicU64,
    synced: AtomicU64,
    address: Mutex<Option<Address>>,
}

impl Tag {
    fn from_info(info: TagInfo) -> Self {
        Self {
            uid: info.uid,
            name: info.name,
            started_at: info.started_at,
            total: AtomicU64::new(info.total),
            split: AtomicU64::new(info.split),
            seen: AtomicU64::new(info.seen),
            stored: AtomicU64::new(info.stored),
            sent: AtomicU64::new(info.sent),
            synced: AtomicU64::new(info.synced),
            address: Mutex::new(info.address),
        }
    }

    fn counter(&self, state: State) -> &AtomicU64 {
        match state {
            State::Split => &self.split,
            State::Seen => &self.seen,
            State::Stored => &self.stored,
            State::Sent => &self.sent,
            State::Synced => &self.synced,
        }
    }

    /// The tag id.
    pub fn uid(&self) -> TagId {
        self.uid
    }

    /// Increments the counter for `state`.
    pub fn inc(&self, state: State) {
        self.counter(state).fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of the counter for `state`.
    pub fn get(&self, state: State) -> u64 {
        self.counter(state).load(Ordering::Relaxed)
    }

    /// Sets the expected number of chunks.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Records the root address of the upload.
    pub fn set_address(&self, address: Address) {
        *self.address.lock().expect("poisoned") = Some(address);
    }

    /// Whether every split chunk reached `state`.
    pub fn done(&self, state: State) -> bool {
        let split = self.get(State::Split);
        let n = match state {
            // chunks seen locally are not stored or synced again
            State::Stored | State::Synced | State::Sent => self.get(state) + self.get(State::Seen),
            _ => self.get(state),
        };
        split > 0 && n >= split
    }

    /// A snapshot of all counters.
    pub fn info(&self) -> TagInfo {
        TagInfo {
            uid: self.uid,
            name: self.name.clone(),
            total: self.total.load(Ordering::Relaxed),
            split: self.get(State::Split),
            seen: self.get(State::Seen),
            stored: self.get(State::Stored),
            sent: self.get(State::Sent),
            synced: self.get(State::Synced),
            address: *self.address.lock().expect("poisoned"),
            started_at: self.started_at,
        }
    }
}

/// Registry of upload tags.
#[derive(Debug, Clone)]
pub struct Tags {
    inner: Arc<TagsInner>,
}

#[derive(Debug)]
struct TagsInner {
    state: StateStore,
    next: AtomicU32,
    tags: Mutex<HashMap<TagId, Arc<Tag>>>,
}

impl Tags {
    /// Creates the registry, loading persisted tags.
    pub fn new(state: StateStore) -> Result<Self, StateStoreError> {
        let mut tags = HashMap::new();
        let mut max = 0;
        for (_, info) in state.iter_prefix::<TagInfo>(TAG_PREFIX)? {
            max = max.max(info.uid);
            tags.insert(info.uid, Arc::new(Tag::from_info(info)));
        }
        debug!(count = tags.len(), "loaded tags");
        Ok(Self {
            inner: Arc::new(TagsInner {
                state,
                next: AtomicU32::new(max + 1),
                tags: Mutex::new(tags),
            }),
        })
    }

    /// Creates a new tag.
    pub fn create(&self, name: impl Into<String>, total: u64) -> Arc<Tag> {
        let uid = self.inner.next.fetch_add(1, Ordering::Relaxed);
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let tag = Arc::new(Tag::from_info(TagInfo {
            uid,
            name: name.into(),
            total,
            split: 0,
            seen: 0,
            stored: 0,
            sent: 0,
            synced: 0,
            address: None,
            started_at,
        }));
        self.inner
            .tags
            .lock()
            .expect("poisoned")
            .insert(uid, tag.clone());
        tag
    }

    /// Looks up a tag.
    pub fn get(&self, uid: TagId) -> Option<Arc<Tag>> {
        self.inner.tags.lock().expect("poisoned").get(&uid).cloned()
    }

    /// All tags ordered by id.
    pub fn list(&self) -> Vec<Arc<Tag>> {
        let mut tags: Vec<_> = self
            .inner
            .tags
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        tags.sort_by_key(|t| t.uid);
        tags
    }

    /// Removes a tag from memory and the state store.
    pub fn delete(&self, uid: TagId) -> Result<bool, StateStoreError> {
        let removed = self
            .inner
            .tags
            .lock()
            .expect("poisoned")
            .remove(&uid)
            .is_some();
        self.inner.state.delete(&tag_key(uid))?;
        Ok(removed)
    }

    /// Writes one tag to the state store.
    pub fn persist(&self, uid: TagId) -> Result<(), StateStoreError> {
        if let Some(tag) = self.get(uid) {
            self.inner.state.put(&tag_key(uid), &tag.info())?;
        }
        Ok(())
    }

    /// Writes every tag to the state store.
    pub fn persist_all(&self) -> Result<(), StateStoreError> {
        for tag in self.list() {
            self.inner.state.put(&tag_key(tag.uid), &tag.info())?;
        }
        Ok(())
    }
}

fn tag_key(uid: TagId) -> String {
    format!("{TAG_PREFIX}{uid:010}")
}
