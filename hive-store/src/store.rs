//! The local chunk store.
//!
//! Chunk payloads live in [`Sharky`], every index lives in a redb database.
//! All index changes of one put, get or set happen in a single redb write
//! transaction, so readers never observe a chunk that is present in some
//! indexes but not in others. redb serializes write transactions, which
//! also keeps the gc and reserve size counters consistent with the indexes.
//!
//! Sharky slots are allocated inside the write transaction and released
//! again when the transaction does not commit. Slots of removed chunks are
//! released only after the commit.

use std::{
    collections::{HashSet, VecDeque},
    num::NonZeroUsize,
    path::Path,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use futures_util::future::BoxFuture;
use hive_base::{
    Address, Chunk, MAX_PO, Stamp,
    chunk::TagId,
    stamp::BatchId,
    storage::{ClosedSnafu, Getter, ModeGet, ModePut, ModeSet, Putter, Setter, StorageError},
};
use hive_postage::BatchStore;
use lru::LruCache;
use redb::{Database, ReadableTable, WriteTransaction, backends::InMemoryBackend};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::{
    config::LocalStoreConfig,
    error::{BaseKeyMismatchSnafu, CloseTimeoutSnafu, LocalStoreError},
    metrics::Metrics,
    migrations::run_migrations,
    sharky::{Location, Sharky},
    tables::{
        BASE_KEY, COUNTERS_TABLE, GC_SIZE, META_TABLE, RESERVE_SIZE, RETRIEVAL_DATA_TABLE, Tables,
        create_tables,
    },
    tags::Tags,
};

mod gc;
mod get;
mod put;
mod reserve;
mod set;
mod subscribe;

pub use self::subscribe::PushSubscription;

const INDEX_FILE: &str = "index.redb";
const SHARKY_DIR: &str = "sharky";

/// Window over which [`LocalStore::sync_rate`] is computed.
pub const SYNC_RATE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Index entry of a stored chunk, kept in the retrieval data table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Item {
    pub location: Location,
    pub bin: u8,
    pub bin_id: u64,
    pub store_ts: u64,
    pub stamp: Option<Vec<u8>>,
    pub tag: Option<TagId>,
    pub reserved: bool,
}

impl Item {
    fn decode(bytes: &[u8]) -> Result<Self, LocalStoreError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn encode(&self) -> Result<Vec<u8>, LocalStoreError> {
        Ok(postcard::to_stdvec(self)?)
    }

    fn stamp(&self) -> Result<Option<Stamp>, LocalStoreError> {
        match &self.stamp {
            Some(bytes) => Ok(Some(Stamp::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }
}

/// Current time in nanoseconds since the epoch.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Side effects of a write transaction, applied once it committed.
#[derive(Debug, Default)]
pub(crate) struct Changes {
    /// Slots written in this transaction, released if it does not commit.
    written: Vec<Location>,
    /// Slots of removed chunks, released after the commit.
    released: Vec<Location>,
    removed: Vec<Address>,
    gc_delta: i64,
    reserve_delta: i64,
    pull: Vec<(u8, u64)>,
    pushed: bool,
    gc_size: u64,
}

#[derive(Debug)]
struct GcState {
    /// Set while a garbage collection pass runs.
    running: AtomicBool,
    /// Chunks accessed during a pass, their access time is updated after it.
    dirty: Mutex<HashSet<Address>>,
    /// Held by a gc pass and by unreserve.
    lock: Mutex<()>,
    trigger: mpsc::Sender<()>,
}

#[derive(Debug)]
struct Triggers {
    pull: Vec<watch::Sender<u64>>,
    push: watch::Sender<u64>,
}

/// Builder for a [`LocalStore`].
#[derive(Debug)]
pub struct Builder {
    base_key: Address,
    config: LocalStoreConfig,
    batch_store: Option<BatchStore>,
    tags: Option<Tags>,
    metrics: Option<Arc<Metrics>>,
}

impl Builder {
    /// Sets the configuration.
    pub fn config(mut self, config: LocalStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Batch store used to look up whether a batch is immutable.
    ///
    /// Without one every batch is treated as immutable.
    pub fn batch_store(mut self, batch_store: BatchStore) -> Self {
        self.batch_store = Some(batch_store);
        self
    }

    /// Tag registry whose synced counters are bumped by [`ModeSet::Sync`].
    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Shares a metrics group, e.g. with a node wide registry.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Opens the store and starts the garbage collection worker.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(self) -> Result<LocalStore, LocalStoreError> {
        let Builder {
            base_key,
            config,
            batch_store,
            tags,
            metrics,
        } = self;
        let (db, mut sharky) = match &config.path {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                let db = Database::create(path.join(INDEX_FILE))?;
                let sharky = Sharky::open(path.join(SHARKY_DIR), config.shards)?;
                (db, sharky)
            }
            None => {
                let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
                (db, Sharky::memory(config.shards))
            }
        };
        init_db(&db, &base_key)?;
        run_migrations(&db)?;
        if sharky.needs_recovery() {
            let used = used_locations(&db)?;
            info!(chunks = used.len(), "recovering sharky free lists");
            sharky.recover(used);
        }

        let lru = NonZeroUsize::new(config.lru_capacity).map(|n| Mutex::new(LruCache::new(n)));
        let (gc_tx, gc_rx) = mpsc::channel(1);
        let pull = (0..=MAX_PO).map(|_| watch::Sender::new(0)).collect();
        let cancel = CancellationToken::new();
        let inner = Arc::new(Inner {
            db,
            sharky,
            base_key,
            config,
            radius: AtomicU8::new(0),
            batch_store,
            tags,
            lru,
            release_lock: RwLock::new(()),
            gc: GcState {
                running: AtomicBool::new(false),
                dirty: Mutex::new(HashSet::new()),
                lock: Mutex::new(()),
                trigger: gc_tx,
            },
            triggers: Triggers {
                pull,
                push: watch::Sender::new(0),
            },
            sync_puts: Mutex::new(VecDeque::new()),
            cancel: cancel.clone(),
            metrics: metrics.unwrap_or_default(),
            worker: Mutex::new(None),
        });
        let worker = tokio::spawn(
            gc::gc_worker(Arc::downgrade(&inner), gc_rx, cancel)
                .instrument(info_span!("localstore.gc")),
        );
        *inner.worker.lock().expect("poisoned") = Some(worker);
        info!(base = %base_key.fmt_short(), "opened localstore");
        // a store that was over capacity when closed
        inner.trigger_gc_if_needed()?;
        Ok(LocalStore { inner })
    }
}

fn init_db(db: &Database, base_key: &Address) -> Result<(), LocalStoreError> {
    let tx = db.begin_write()?;
    create_tables(&tx)?;
    {
        let mut meta = tx.open_table(META_TABLE)?;
        let stored = meta.get(BASE_KEY)?.map(|v| v.value().to_vec());
        match stored {
            Some(stored) => {
                ensure!(
                    stored.as_slice() == base_key.as_bytes().as_slice(),
                    BaseKeyMismatchSnafu
                );
            }
            None => {
                meta.insert(BASE_KEY, base_key.as_bytes().as_slice())?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

fn used_locations(db: &Database) -> Result<Vec<Location>, LocalStoreError> {
    let tx = db.begin_read()?;
    let table = tx.open_table(RETRIEVAL_DATA_TABLE)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        out.push(Item::decode(value.value())?.location);
    }
    Ok(out)
}

/// The local chunk store.
///
/// Cheap to clone. Implements [`Getter`], [`Putter`] and [`Setter`].
#[derive(Debug, Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
pub(crate) struct Inner {
    #[debug("Database")]
    db: Database,
    sharky: Sharky,
    base_key: Address,
    config: LocalStoreConfig,
    /// Storage radius of the node, chunks at or above it are reserved.
    radius: AtomicU8,
    batch_store: Option<BatchStore>,
    tags: Option<Tags>,
    #[debug(skip)]
    lru: Option<Mutex<LruCache<Address, Chunk>>>,
    /// Readers of sharky hold it shared, releasing slots holds it exclusive.
    release_lock: RwLock<()>,
    gc: GcState,
    triggers: Triggers,
    sync_puts: Mutex<VecDeque<Instant>>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LocalStore {
    /// Creates a builder for a store with the given base key.
    ///
    /// The base key is the overlay address of the node. Bins and reserve
    /// membership are computed relative to it.
    pub fn builder(base_key: Address) -> Builder {
        Builder {
            base_key,
            config: LocalStoreConfig::default(),
            batch_store: None,
            tags: None,
            metrics: None,
        }
    }

    /// Opens an in memory store with default configuration.
    pub async fn memory(base_key: Address) -> Result<Self, LocalStoreError> {
        Self::builder(base_key)
            .config(LocalStoreConfig::memory(crate::config::DEFAULT_CACHE_CAPACITY))
            .open()
            .await
    }

    /// Opens a store persisted in `path` with default configuration.
    pub async fn persistent(path: impl AsRef<Path>, base_key: Address) -> Result<Self, LocalStoreError> {
        let config = LocalStoreConfig {
            path: Some(path.as_ref().to_path_buf()),
            ..Default::default()
        };
        Self::builder(base_key).config(config).open().await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, LocalStoreError> + Send + 'static,
    {
        ensure!(!self.inner.cancel.is_cancelled(), ClosedSnafu);
        let inner = self.inner.clone();
        let res = tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(StorageError::from_err)?;
        Ok(res?)
    }

    /// Stores `chunks`, returning for each whether it was already present.
    pub async fn put(&self, mode: ModePut, chunks: Vec<Chunk>) -> Result<Vec<bool>, StorageError> {
        self.blocking(move |inner| inner.put(mode, &chunks)).await
    }

    /// Retrieves a chunk.
    pub async fn get(&self, mode: ModeGet, address: Address) -> Result<Chunk, StorageError> {
        self.blocking(move |inner| inner.get(mode, &address)).await
    }

    /// Retrieves several chunks, failing if any is missing.
    pub async fn get_multi(
        &self,
        mode: ModeGet,
        addresses: Vec<Address>,
    ) -> Result<Vec<Chunk>, StorageError> {
        self.blocking(move |inner| {
            addresses
                .iter()
                .map(|address| inner.get(mode, address))
                .collect()
        })
        .await
    }

    /// Applies `mode` to every address.
    pub async fn set(&self, mode: ModeSet, addresses: Vec<Address>) -> Result<(), StorageError> {
        self.blocking(move |inner| inner.set(mode, &addresses)).await
    }

    /// Whether the chunk is stored.
    pub async fn has(&self, address: Address) -> Result<bool, StorageError> {
        self.blocking(move |inner| inner.has(&address)).await
    }

    /// Whether each of the chunks is stored.
    pub async fn has_multi(&self, addresses: Vec<Address>) -> Result<Vec<bool>, StorageError> {
        self.blocking(move |inner| addresses.iter().map(|a| inner.has(a)).collect())
            .await
    }

    /// Runs a garbage collection pass now, returning the number of evicted
    /// chunks.
    pub async fn collect_garbage(&self) -> Result<usize, StorageError> {
        self.blocking(|inner| inner.collect_garbage()).await
    }

    /// Moves the chunks of `batch` with a proximity order below `radius` out
    /// of the reserve.
    ///
    /// A radius above [`MAX_PO`] evicts every unpinned chunk of the batch.
    /// This blocks on the database, it is meant to be driven by the batch
    /// store through [`LocalStore::unreserve_fn`].
    pub fn unreserve(&self, batch: &BatchId, radius: u8) -> Result<(), StorageError> {
        ensure!(!self.inner.cancel.is_cancelled(), ClosedSnafu);
        Ok(self.inner.unreserve(batch, radius)?)
    }

    /// A callback for [`BatchStore::set_unreserve_fn`].
    ///
    /// It holds the store weakly, once the store is gone it does nothing.
    pub fn unreserve_fn(&self) -> hive_postage::batchstore::UnreserveFn {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |batch: &BatchId, radius: u8| {
            let Some(inner) = Weak::upgrade(&inner) else {
                return Ok(());
            };
            Ok(inner.unreserve(batch, radius)?)
        })
    }

    /// Sets the storage radius.
    pub fn set_radius(&self, radius: u8) {
        let prev = self.inner.radius.swap(radius, Ordering::Relaxed);
        if prev != radius {
            info!(radius, "localstore radius changed");
        }
    }

    /// The storage radius.
    pub fn radius(&self) -> u8 {
        self.inner.radius.load(Ordering::Relaxed)
    }

    /// The radius unreserve was last driven to for `batch`.
    pub fn batch_radius(&self, batch: &BatchId) -> Result<Option<u8>, StorageError> {
        Ok(self.inner.batch_radius(batch)?)
    }

    /// Number of chunks that are candidates for garbage collection.
    pub fn gc_size(&self) -> Result<u64, StorageError> {
        Ok(self.inner.counter(GC_SIZE)?)
    }

    /// Number of chunks in the reserve.
    pub fn reserve_size(&self) -> Result<u64, StorageError> {
        Ok(self.inner.counter(RESERVE_SIZE)?)
    }

    /// The last bin id handed out in `bin`, 0 if the bin is empty.
    pub fn last_pull_bin_id(&self, bin: u8) -> Result<u64, StorageError> {
        Ok(self.inner.last_pull_bin_id(bin)?)
    }

    /// The pin counter of a chunk, 0 if it is not pinned.
    pub fn pin_counter(&self, address: &Address) -> Result<u64, StorageError> {
        Ok(self.inner.pin_counter(address)?)
    }

    /// Every pinned chunk.
    pub fn pinned_addresses(&self) -> Result<Vec<Address>, StorageError> {
        Ok(self.inner.pinned_addresses()?)
    }

    /// Streams `(address, bin id)` of chunks in `bin`, starting at bin id
    /// `since`, in ascending bin id order.
    ///
    /// Once caught up the subscription waits for new chunks. It ends after
    /// delivering `until`, when the receiver is dropped or the store closes.
    pub fn subscribe_pull(
        &self,
        bin: u8,
        since: u64,
        until: Option<u64>,
    ) -> mpsc::Receiver<(Address, u64)> {
        subscribe::subscribe_pull(self.inner.clone(), bin, since, until)
    }

    /// Streams chunks queued for push sync, oldest first.
    ///
    /// Chunks for which `skip` returns true are not delivered.
    pub fn subscribe_push<F>(&self, skip: F) -> PushSubscription
    where
        F: Fn(&Address) -> bool + Send + Sync + 'static,
    {
        subscribe::subscribe_push(self.inner.clone(), skip)
    }

    /// The base key.
    pub fn base_key(&self) -> &Address {
        &self.inner.base_key
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &LocalStoreConfig {
        &self.inner.config
    }

    /// Chunks stored with [`ModePut::Sync`] per second, over
    /// [`SYNC_RATE_WINDOW`].
    pub fn sync_rate(&self) -> f64 {
        let mut puts = self.inner.sync_puts.lock().expect("poisoned");
        prune_sync_puts(&mut puts, Instant::now());
        puts.len() as f64 / SYNC_RATE_WINDOW.as_secs_f64()
    }

    /// Metrics of this store.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Closes the store.
    ///
    /// Stops subscriptions and the garbage collection worker, then closes
    /// sharky. Fails with a timeout if the worker does not finish in time.
    pub async fn close(&self) -> Result<(), LocalStoreError> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        self.inner.cancel.cancel();
        let worker = self.inner.worker.lock().expect("poisoned").take();
        if let Some(worker) = worker {
            let timeout = self.inner.config.close_timeout;
            if tokio::time::timeout(timeout, worker).await.is_err() {
                warn!("localstore gc worker did not stop in time");
                return CloseTimeoutSnafu { timeout }.fail();
            }
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.sharky.close())
            .await
            .map_err(|err| LocalStoreError::from(StorageError::from_err(err)))??;
        info!("closed localstore");
        Ok(())
    }
}

fn prune_sync_puts(puts: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = puts.front() {
        if now.duration_since(*front) > SYNC_RATE_WINDOW {
            puts.pop_front();
        } else {
            break;
        }
    }
}

impl Inner {
    /// Runs `f` in a write transaction and applies its [`Changes`] after the
    /// commit.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables<'_>, &mut Changes) -> Result<T, LocalStoreError>,
    ) -> Result<T, LocalStoreError> {
        let tx = self.db.begin_write()?;
        let mut changes = Changes::default();
        let res = write_tables(&tx, &mut changes, f);
        let res = match res {
            Ok(out) => tx.commit().map(|_| out).map_err(LocalStoreError::from),
            Err(err) => {
                tx.abort().ok();
                Err(err)
            }
        };
        match res {
            Ok(out) => {
                self.after_commit(changes);
                Ok(out)
            }
            Err(err) => {
                for location in changes.written {
                    self.sharky.release(location);
                }
                Err(err)
            }
        }
    }

    fn after_commit(&self, changes: Changes) {
        if !changes.released.is_empty() || !changes.removed.is_empty() {
            let _guard = self.release_lock.write().expect("poisoned");
            for location in changes.released {
                self.sharky.release(location);
            }
            if let Some(lru) = &self.lru {
                let mut lru = lru.lock().expect("poisoned");
                for address in &changes.removed {
                    lru.pop(address);
                }
            }
        }
        for (bin, bin_id) in changes.pull {
            if let Some(trigger) = self.triggers.pull.get(bin as usize) {
                trigger.send_modify(|last| *last = (*last).max(bin_id));
            }
        }
        if changes.pushed {
            self.triggers.push.send_modify(|n| *n = n.wrapping_add(1));
        }
        if changes.gc_size > self.config.cache_capacity {
            self.gc.trigger.try_send(()).ok();
        }
    }

    fn trigger_gc_if_needed(&self) -> Result<(), LocalStoreError> {
        if self.counter(GC_SIZE)? > self.config.cache_capacity {
            self.gc.trigger.try_send(()).ok();
        }
        Ok(())
    }

    fn counter(&self, name: &str) -> Result<u64, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(COUNTERS_TABLE)?;
        Ok(table.get(name)?.map(|v| v.value()).unwrap_or(0))
    }

    fn is_immutable(&self, batch: &BatchId) -> bool {
        match &self.batch_store {
            Some(store) => store.get(batch).map(|b| b.immutable).unwrap_or(true),
            None => true,
        }
    }

    fn record_sync_puts(&self, n: usize) {
        if n == 0 {
            return;
        }
        let now = Instant::now();
        let mut puts = self.sync_puts.lock().expect("poisoned");
        prune_sync_puts(&mut puts, now);
        puts.extend(std::iter::repeat_n(now, n));
    }
}

fn write_tables<T>(
    tx: &WriteTransaction,
    changes: &mut Changes,
    f: impl FnOnce(&mut Tables<'_>, &mut Changes) -> Result<T, LocalStoreError>,
) -> Result<T, LocalStoreError> {
    let mut tables = Tables::new(tx)?;
    let out = f(&mut tables, changes)?;
    changes.gc_size = apply_delta(&mut tables, GC_SIZE, changes.gc_delta)?;
    apply_delta(&mut tables, RESERVE_SIZE, changes.reserve_delta)?;
    Ok(out)
}

fn apply_delta(tables: &mut Tables<'_>, name: &str, delta: i64) -> Result<u64, LocalStoreError> {
    let current = tables.counters.get(name)?.map(|v| v.value()).unwrap_or(0);
    if delta == 0 {
        return Ok(current);
    }
    let next = current.saturating_add_signed(delta);
    tables.counters.insert(name, next)?;
    Ok(next)
}

// Index helpers shared by the write paths.

pub(crate) fn read_item(
    t: &Tables<'_>,
    address: &Address,
) -> Result<Option<Item>, LocalStoreError> {
    match t.retrieval_data.get(address.as_bytes())? {
        Some(v) => Ok(Some(Item::decode(v.value())?)),
        None => Ok(None),
    }
}

fn write_item(t: &mut Tables<'_>, address: &Address, item: &Item) -> Result<(), LocalStoreError> {
    t.retrieval_data
        .insert(address.as_bytes(), item.encode()?.as_slice())?;
    Ok(())
}

fn access_ts(t: &Tables<'_>, address: &Address) -> Result<u64, LocalStoreError> {
    Ok(t
        .retrieval_access
        .get(address.as_bytes())?
        .map(|v| v.value())
        .unwrap_or(0))
}

fn pin_count(t: &Tables<'_>, address: &Address) -> Result<u64, LocalStoreError> {
    Ok(t.pin.get(address.as_bytes())?.map(|v| v.value()).unwrap_or(0))
}

fn in_push(t: &Tables<'_>, address: &Address, item: &Item) -> Result<bool, LocalStoreError> {
    Ok(t.push.get((item.store_ts, address.as_bytes()))?.is_some())
}

fn gc_add(
    t: &mut Tables<'_>,
    address: &Address,
    item: &Item,
    c: &mut Changes,
) -> Result<(), LocalStoreError> {
    let ts = access_ts(t, address)?;
    if t.gc.insert((ts, item.bin_id, address.as_bytes()), ())?.is_none() {
        c.gc_delta += 1;
    }
    Ok(())
}

fn gc_remove(
    t: &mut Tables<'_>,
    address: &Address,
    item: &Item,
    c: &mut Changes,
) -> Result<bool, LocalStoreError> {
    let ts = access_ts(t, address)?;
    if t.gc.remove((ts, item.bin_id, address.as_bytes()))?.is_some() {
        c.gc_delta -= 1;
        return Ok(true);
    }
    Ok(false)
}

fn pin_inc(
    t: &mut Tables<'_>,
    address: &Address,
    item: &Item,
    c: &mut Changes,
) -> Result<u64, LocalStoreError> {
    let count = pin_count(t, address)? + 1;
    t.pin.insert(address.as_bytes(), count)?;
    if count == 1 {
        gc_remove(t, address, item, c)?;
    }
    Ok(count)
}

/// Removes a chunk from every index. Returns false if it was not stored.
fn remove_chunk(
    t: &mut Tables<'_>,
    address: &Address,
    c: &mut Changes,
) -> Result<bool, LocalStoreError> {
    let Some(item) = read_item(t, address)? else {
        return Ok(false);
    };
    gc_remove(t, address, &item, c)?;
    let key = address.as_bytes();
    t.retrieval_data.remove(key)?;
    t.retrieval_access.remove(key)?;
    t.pull.remove((item.bin, item.bin_id))?;
    t.push.remove((item.store_ts, key))?;
    t.pin.remove(key)?;
    if let Some(stamp) = item.stamp()? {
        let batch = stamp.batch_id().as_bytes();
        t.voucher_chunks
            .remove((batch, item.bin, item.bin_id, key))?;
        let slot_owner = t
            .voucher_index
            .get((batch, stamp.index()))?
            .map(|v| *v.value().0);
        if slot_owner.as_ref() == Some(key) {
            t.voucher_index.remove((batch, stamp.index()))?;
        }
    }
    if item.reserved {
        c.reserve_delta -= 1;
    }
    c.released.push(item.location);
    c.removed.push(*address);
    Ok(true)
}

impl Getter for LocalStore {
    fn get(&self, mode: ModeGet, address: Address) -> BoxFuture<'_, Result<Chunk, StorageError>> {
        Box::pin(LocalStore::get(self, mode, address))
    }
}

impl Putter for LocalStore {
    fn put(
        &self,
        mode: ModePut,
        chunks: Vec<Chunk>,
    ) -> BoxFuture<'_, Result<Vec<bool>, StorageError>> {
        Box::pin(LocalStore::put(self, mode, chunks))
    }
}

impl Setter for LocalStore {
    fn set(&self, mode: ModeSet, addresses: Vec<Address>) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(LocalStore::set(self, mode, addresses))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use hive_base::{
        Signer, cac,
        stamp::{index_to_bytes, to_bucket},
    };

    use super::*;

    pub fn chunk(i: u32) -> Chunk {
        cac::new(format!("chunk {i}").as_bytes()).unwrap()
    }

    pub fn stamped(i: u32, signer: &Signer, batch: BatchId, index: u32, ts: u64) -> Chunk {
        let chunk = chunk(i);
        let bucket = to_bucket(8, chunk.address());
        let idx = index_to_bytes(bucket, index);
        let ts = ts.to_be_bytes();
        let digest = hive_base::stamp::digest(chunk.address(), &batch, &idx, &ts);
        let sig = signer.sign(&digest).unwrap();
        chunk.with_stamp(Stamp::new(batch, idx, ts, sig))
    }

    pub async fn store(capacity: u64) -> LocalStore {
        LocalStore::builder(Address::ZERO)
            .config(LocalStoreConfig::memory(capacity))
            .open()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_close() {
        let store = store(10).await;
        assert_eq!(store.gc_size().unwrap(), 0);
        assert_eq!(store.reserve_size().unwrap(), 0);
        store.close().await.unwrap();
        let err = store.get(ModeGet::Lookup, Address::ZERO).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed { .. }));
        // closing twice is fine
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn persistent_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let base = Address::new([7; 32]);
        let c = chunk(1);
        {
            let store = LocalStore::persistent(dir.path(), base).await.unwrap();
            store.put(ModePut::Upload, vec![c.clone()]).await.unwrap();
            store.close().await.unwrap();
        }
        let store = LocalStore::persistent(dir.path(), base).await.unwrap();
        assert_eq!(store.get(ModeGet::Lookup, *c.address()).await.unwrap(), c);
        store.close().await.unwrap();

        let other = LocalStore::persistent(dir.path(), Address::new([8; 32])).await;
        assert!(matches!(other, Err(LocalStoreError::BaseKeyMismatch { .. })));
    }

    #[tokio::test]
    async fn unclean_shutdown_recovers_sharky() {
        let dir = tempfile::tempdir().unwrap();
        let c1 = chunk(1);
        let c2 = chunk(2);
        {
            let store = LocalStore::persistent(dir.path(), Address::ZERO).await.unwrap();
            store
                .put(ModePut::Upload, vec![c1.clone(), c2.clone()])
                .await
                .unwrap();
            // dropped without close, the dirty marker stays
        }
        let store = LocalStore::persistent(dir.path(), Address::ZERO).await.unwrap();
        // new writes must not land in the slots still in use
        let c3 = chunk(3);
        store.put(ModePut::Upload, vec![c3.clone()]).await.unwrap();
        for c in [c1, c2, c3] {
            assert_eq!(store.get(ModeGet::Lookup, *c.address()).await.unwrap(), c);
        }
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn sync_rate_counts_sync_puts() {
        let store = store(100).await;
        assert_eq!(store.sync_rate(), 0.0);
        store
            .put(ModePut::Sync, (0..3).map(chunk).collect())
            .await
            .unwrap();
        store.put(ModePut::Upload, vec![chunk(10)]).await.unwrap();
        let expected = 3.0 / SYNC_RATE_WINDOW.as_secs_f64();
        assert!((store.sync_rate() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn item_encoding() {
        let item = Item {
            location: Location {
                shard: 1,
                slot: 2,
                length: 3,
            },
            bin: 4,
            bin_id: 5,
            store_ts: 6,
            stamp: None,
            tag: Some(7),
            reserved: true,
        };
        let bytes = item.encode().unwrap();
        assert_eq!(Item::decode(&bytes).unwrap(), item);
    }
}
