//! Storage traits and access modes shared by the local store, the network
//! store and the file pipelines.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures_util::future::BoxFuture;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, Snafu};

use crate::{address::Address, chunk::Chunk};

/// How a chunk is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ModeGet {
    /// A user or network request, updates the access index.
    Request,
    /// Serving a pull sync delivery, no index update.
    Sync,
    /// Plain lookup, no index update.
    Lookup,
    /// Like [`ModeGet::Request`], on behalf of pinning.
    RequestPin,
}

/// How a chunk is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ModePut {
    /// A local upload, queued for push sync.
    Upload,
    /// A local upload that is pinned as well.
    UploadPin,
    /// A chunk retrieved from the network.
    Request,
    /// A retrieved chunk that is pinned as well.
    RequestPin,
    /// A retrieved chunk forced into the cache, even without a valid stamp.
    RequestCache,
    /// A chunk delivered by push or pull sync.
    Sync,
}

/// How the state of stored chunks is changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ModeSet {
    /// A pushed chunk reached its neighbourhood.
    Sync,
    /// Removes the chunk.
    Remove,
    /// Increments the pin counter.
    Pin,
    /// Decrements the pin counter.
    Unpin,
}

/// Errors from chunk storage.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum StorageError {
    #[snafu(display("chunk {address} not found"))]
    NotFound { address: Address },
    #[snafu(display("invalid chunk {address}"))]
    InvalidChunk { address: Address },
    #[snafu(display("chunk {address} would overwrite a newer chunk"))]
    OverwriteNewerChunk { address: Address },
    #[snafu(display("store closed"))]
    Closed {},
    #[snafu(display("storage backend: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl StorageError {
    /// Wraps a backend error.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(source: T) -> Self {
        BackendSnafu.into_error(Box::new(source))
    }

    /// Whether this is [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Retrieves chunks by address.
pub trait Getter: Send + Sync + Debug + 'static {
    /// Gets the chunk stored under `address`.
    fn get(&self, mode: ModeGet, address: Address) -> BoxFuture<'_, Result<Chunk, StorageError>>;
}

/// Stores chunks.
pub trait Putter: Send + Sync + Debug + 'static {
    /// Stores `chunks`, returning for each whether it already existed.
    fn put(
        &self,
        mode: ModePut,
        chunks: Vec<Chunk>,
    ) -> BoxFuture<'_, Result<Vec<bool>, StorageError>>;
}

/// Changes the state of stored chunks.
pub trait Setter: Send + Sync + Debug + 'static {
    /// Applies `mode` to every address.
    fn set(&self, mode: ModeSet, addresses: Vec<Address>) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// A full chunk store.
pub trait Storer: Getter + Putter + Setter {}

impl<T: Getter + Putter + Setter> Storer for T {}

impl<T: Getter + ?Sized> Getter for Arc<T> {
    fn get(&self, mode: ModeGet, address: Address) -> BoxFuture<'_, Result<Chunk, StorageError>> {
        self.as_ref().get(mode, address)
    }
}

impl<T: Putter + ?Sized> Putter for Arc<T> {
    fn put(
        &self,
        mode: ModePut,
        chunks: Vec<Chunk>,
    ) -> BoxFuture<'_, Result<Vec<bool>, StorageError>> {
        self.as_ref().put(mode, chunks)
    }
}

impl<T: Setter + ?Sized> Setter for Arc<T> {
    fn set(&self, mode: ModeSet, addresses: Vec<Address>) -> BoxFuture<'_, Result<(), StorageError>> {
        self.as_ref().set(mode, addresses)
    }
}

/// A minimal in memory chunk store.
///
/// It keeps no indexes and ignores modes, which is all the file pipelines
/// and protocol tests need.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    inner: Arc<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    chunks: Mutex<HashMap<Address, Chunk>>,
    puts: AtomicUsize,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks put so far, including duplicates.
    pub fn put_count(&self) -> usize {
        self.inner.puts.load(Ordering::Relaxed)
    }

    /// Number of distinct chunks held.
    pub fn len(&self) -> usize {
        self.inner.chunks.lock().expect("poisoned").len()
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `address` is held.
    pub fn contains(&self, address: &Address) -> bool {
        self.inner
            .chunks
            .lock()
            .expect("poisoned")
            .contains_key(address)
    }

    /// All held chunks.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.inner
            .chunks
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Getter for MemStore {
    fn get(&self, _mode: ModeGet, address: Address) -> BoxFuture<'_, Result<Chunk, StorageError>> {
        let res = self
            .inner
            .chunks
            .lock()
            .expect("poisoned")
            .get(&address)
            .cloned()
            .ok_or_else(|| NotFoundSnafu { address }.build());
        Box::pin(async move { res })
    }
}

impl Putter for MemStore {
    fn put(
        &self,
        _mode: ModePut,
        chunks: Vec<Chunk>,
    ) -> BoxFuture<'_, Result<Vec<bool>, StorageError>> {
        let mut map = self.inner.chunks.lock().expect("poisoned");
        let exists = chunks
            .into_iter()
            .map(|chunk| {
                self.inner.puts.fetch_add(1, Ordering::Relaxed);
                map.insert(*chunk.address(), chunk).is_some()
            })
            .collect();
        drop(map);
        Box::pin(async move { Ok(exists) })
    }
}

impl Setter for MemStore {
    fn set(&self, mode: ModeSet, addresses: Vec<Address>) -> BoxFuture<'_, Result<(), StorageError>> {
        if mode == ModeSet::Remove {
            let mut map = self.inner.chunks.lock().expect("poisoned");
            for address in &addresses {
                map.remove(address);
            }
        }
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cac;

    #[tokio::test]
    async fn mem_store() {
        let store = MemStore::new();
        let chunk = cac::new(b"hello").unwrap();
        let addr = *chunk.address();
        assert!(store.get(ModeGet::Request, addr).await.unwrap_err().is_not_found());

        let exists = store
            .put(ModePut::Upload, vec![chunk.clone(), chunk.clone()])
            .await
            .unwrap();
        assert_eq!(exists, vec![false, true]);
        assert_eq!(store.put_count(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(ModeGet::Lookup, addr).await.unwrap(), chunk);

        let shared: Arc<dyn Storer> = Arc::new(store.clone());
        shared.set(ModeSet::Remove, vec![addr]).await.unwrap();
        assert!(!store.contains(&addr));
    }
}
