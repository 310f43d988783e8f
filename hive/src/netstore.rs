//! A chunk getter that falls back to the network.
//!
//! [`NetStore`] wraps the local store. Chunks missing locally are retrieved
//! from peers and stored back in the background, so the caller does not
//! wait for the local write.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::BoxFuture;
use hive_base::{
    Address, Chunk, cac, soc,
    storage::{Getter, ModeGet, ModePut, ModeSet, NotFoundSnafu, Putter, Setter, StorageError, Storer},
};
use hive_postage::ValidStamp;
use lru::LruCache;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    metrics::NetStoreMetrics,
    retrieval::{Retrieval, RetrievalError, cache_mode},
};

/// Maximum number of background puts of retrieved chunks.
pub const MAX_BG_PUTTERS: usize = 128;
/// Time [`NetStore::close`] waits for background puts.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the network store.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum NetStoreError {
    #[snafu(display("background puts did not finish within {timeout:?}"))]
    CloseTimeout { timeout: Duration },
}

/// The local store with network retrieval on misses.
///
/// Cheap to clone. Puts and sets go straight to the local store.
#[derive(Debug, Clone)]
pub struct NetStore {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    local: Arc<dyn Storer>,
    retrieval: Retrieval,
    valid_stamp: Arc<dyn ValidStamp>,
    #[debug(skip)]
    lru: Option<Mutex<LruCache<Address, Chunk>>>,
    trusted: bool,
    bg_putters: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    metrics: Arc<NetStoreMetrics>,
}

impl NetStore {
    /// Creates a network store over `local`.
    ///
    /// Local chunks are validated again before they are returned unless
    /// `trusted` is set. `lru_capacity` sizes an in memory cache of
    /// retrieved chunks, 0 disables it.
    pub fn new(
        local: Arc<dyn Storer>,
        retrieval: Retrieval,
        valid_stamp: Arc<dyn ValidStamp>,
        trusted: bool,
        lru_capacity: usize,
        metrics: Arc<NetStoreMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                retrieval,
                valid_stamp,
                lru: NonZeroUsize::new(lru_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
                trusted,
                bg_putters: Arc::new(Semaphore::new(MAX_BG_PUTTERS)),
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
                metrics,
            }),
        }
    }

    /// Metrics of this store.
    pub fn metrics(&self) -> &Arc<NetStoreMetrics> {
        &self.inner.metrics
    }

    /// Gets a chunk, from the local store or else the network.
    pub async fn get(&self, mode: ModeGet, address: Address) -> Result<Chunk, StorageError> {
        match self.inner.local.get(mode, address).await {
            Ok(chunk) if self.inner.trusted || cac::valid(&chunk) || soc::valid(&chunk) => {
                self.inner.metrics.local_hits.inc();
                return Ok(chunk);
            }
            Ok(_) => {
                self.inner.metrics.local_invalid.inc();
                warn!(chunk = %address.fmt_short(), "local chunk failed validation");
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        if let Some(lru) = &self.inner.lru {
            if let Some(chunk) = lru.lock().expect("poisoned").get(&address) {
                self.inner.metrics.cache_hits.inc();
                return Ok(chunk.clone());
            }
        }

        self.inner.metrics.network_fetches.inc();
        let chunk = self
            .inner
            .retrieval
            .retrieve_chunk(address, Address::ZERO)
            .await
            .map_err(|err| match err {
                RetrievalError::NotFound { address } => NotFoundSnafu { address }.build(),
                err => StorageError::from_err(err),
            })?;
        if let Some(lru) = &self.inner.lru {
            lru.lock().expect("poisoned").put(address, chunk.clone());
        }
        self.put_in_background(mode, chunk.clone());
        Ok(chunk)
    }

    fn put_in_background(&self, mode: ModeGet, chunk: Chunk) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let Ok(permit) = self.inner.bg_putters.clone().try_acquire_owned() else {
            self.inner.metrics.bg_put_dropped.inc();
            debug!(chunk = %chunk.address().fmt_short(), "too many background puts, dropping");
            return;
        };
        let put_mode = match mode {
            ModeGet::RequestPin => ModePut::RequestPin,
            _ => cache_mode(self.inner.valid_stamp.as_ref(), &chunk),
        };
        let local = self.inner.local.clone();
        let metrics = self.inner.metrics.clone();
        let cancel = self.inner.cancel.clone();
        let address = *chunk.address();
        self.inner.tasks.spawn(
            async move {
                let _permit = permit;
                let res = cancel.run_until_cancelled(local.put(put_mode, vec![chunk])).await;
                match res {
                    Some(Ok(_)) => trace!(%put_mode, "stored retrieved chunk"),
                    Some(Err(err)) => {
                        metrics.bg_put_failures.inc();
                        warn!("storing retrieved chunk failed: {err}");
                    }
                    None => debug!("background put cancelled"),
                }
            }
            .instrument(debug_span!("netstore.put", chunk = %address.fmt_short())),
        );
    }

    /// Stops background puts, waiting for them up to [`CLOSE_TIMEOUT`].
    pub async fn close(&self) -> Result<(), NetStoreError> {
        self.close_with_timeout(CLOSE_TIMEOUT).await
    }

    async fn close_with_timeout(&self, timeout: Duration) -> Result<(), NetStoreError> {
        self.inner.tasks.close();
        if tokio::time::timeout(timeout, self.inner.tasks.wait()).await.is_err() {
            self.inner.cancel.cancel();
            return CloseTimeoutSnafu { timeout }.fail();
        }
        self.inner.cancel.cancel();
        Ok(())
    }
}

impl Getter for NetStore {
    fn get(&self, mode: ModeGet, address: Address) -> BoxFuture<'_, Result<Chunk, StorageError>> {
        Box::pin(self.get(mode, address))
    }
}

impl Putter for NetStore {
    fn put(&self, mode: ModePut, chunks: Vec<Chunk>) -> BoxFuture<'_, Result<Vec<bool>, StorageError>> {
        self.inner.local.put(mode, chunks)
    }
}

impl Setter for NetStore {
    fn set(&self, mode: ModeSet, addresses: Vec<Address>) -> BoxFuture<'_, Result<(), StorageError>> {
        if let (ModeSet::Remove, Some(lru)) = (mode, &self.inner.lru) {
            let mut lru = lru.lock().expect("poisoned");
            for address in &addresses {
                lru.pop(address);
            }
        }
        self.inner.local.set(mode, addresses)
    }
}
