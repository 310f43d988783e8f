//! The batch store: every batch known on chain, the chain state and the
//! reserve state, persisted in the [`StateStore`].
//!
//! Batches are kept under `batch_<id>` and indexed by value under
//! `batchValue_<value>_<id>` with the value as fixed width hex, so that
//! iterating the index walks batches from the cheapest to the most valuable.
//! Whenever a batch is saved or updated the reserve radius is recomputed
//! from the total commitment, `sum(2^depth)`, against the reserve capacity.

use std::sync::{Arc, Mutex};

use hive_base::{BatchId, MAX_PO, StateStore, storage::StorageError};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info};

use crate::{
    batch::{Batch, ChainState, ReserveState},
    error::{BatchExistsSnafu, EvictSnafu, NotFoundSnafu, PostageError},
};

const BATCH_PREFIX: &str = "batch_";
const VALUE_PREFIX: &str = "batchValue_";
const CHAIN_STATE_KEY: &str = "chainState";
const RESERVE_STATE_KEY: &str = "reserveState";

/// Radius passed to the unreserve callback to evict every chunk of a batch.
pub const EVICT_ALL: u8 = MAX_PO + 1;

/// Called with a batch id and a radius; chunks of that batch with a
/// proximity order below the radius leave the reserve.
pub type UnreserveFn = Arc<dyn Fn(&BatchId, u8) -> Result<(), StorageError> + Send + Sync + 'static>;

/// Called with the new storage radius whenever it changes.
pub type RadiusFn = Arc<dyn Fn(u8) + Send + Sync + 'static>;

/// Persistent store of postage batches.
#[derive(Clone)]
pub struct BatchStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: StateStore,
    capacity: u64,
    chain: Mutex<ChainState>,
    reserve: Mutex<ReserveState>,
    unreserve: Mutex<Option<UnreserveFn>>,
    on_radius: Mutex<Option<RadiusFn>>,
}

impl std::fmt::Debug for BatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStore")
            .field("capacity", &self.inner.capacity)
            .field("chain", &self.chain_state())
            .field("reserve", &self.reserve_state())
            .finish_non_exhaustive()
    }
}

fn batch_key(id: &BatchId) -> String {
    format!("{BATCH_PREFIX}{id}")
}

fn value_key(value: u128, id: &BatchId) -> String {
    format!("{VALUE_PREFIX}{value:032x}_{id}")
}

impl BatchStore {
    /// Opens the batch store, restoring chain and reserve state.
    ///
    /// `capacity` is the reserve capacity in chunks.
    pub fn new(state: StateStore, capacity: u64) -> Result<Self, PostageError> {
        let chain: ChainState = state.get(CHAIN_STATE_KEY)?.unwrap_or_default();
        let reserve: ReserveState = state.get(RESERVE_STATE_KEY)?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Inner {
                state,
                capacity,
                chain: Mutex::new(chain),
                reserve: Mutex::new(reserve),
                unreserve: Mutex::new(None),
                on_radius: Mutex::new(None),
            }),
        })
    }

    /// Registers the callback evicting chunks from the reserve.
    pub fn set_unreserve_fn(&self, f: UnreserveFn) {
        *self.inner.unreserve.lock().expect("poisoned") = Some(f);
    }

    /// Registers the callback told about storage radius changes.
    ///
    /// It is called right away with the current storage radius.
    pub fn set_radius_fn(&self, f: RadiusFn) {
        let radius = self.reserve_state().storage_radius;
        *self.inner.on_radius.lock().expect("poisoned") = Some(f.clone());
        f(radius);
    }

    fn notify_radius(&self, radius: u8) {
        let f = self.inner.on_radius.lock().expect("poisoned").clone();
        if let Some(f) = f {
            f(radius);
        }
    }

    /// The reserve capacity in chunks.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Loads the batch with `id`.
    pub fn get(&self, id: &BatchId) -> Result<Batch, PostageError> {
        self.inner
            .state
            .get(&batch_key(id))?
            .context(NotFoundSnafu { id: *id })
    }

    /// Whether a batch with `id` is stored.
    pub fn exists(&self, id: &BatchId) -> Result<bool, PostageError> {
        Ok(self.inner.state.get::<Batch>(&batch_key(id))?.is_some())
    }

    /// Stores a new batch. Each id can only be saved once.
    pub fn save(&self, batch: &Batch) -> Result<(), PostageError> {
        ensure!(!self.exists(&batch.id)?, BatchExistsSnafu { id: batch.id });
        self.inner.state.put(&batch_key(&batch.id), batch)?;
        self.inner
            .state
            .put(&value_key(batch.value, &batch.id), &batch.id)?;
        debug!(id = %batch.id, value = batch.value, depth = batch.depth, "batch saved");
        self.compute_radius()
    }

    /// Changes value and depth of a stored batch.
    pub fn update(&self, batch: &Batch, value: u128, depth: u8) -> Result<(), PostageError> {
        let mut stored = self.get(&batch.id)?;
        self.inner
            .state
            .delete(&value_key(stored.value, &stored.id))?;
        stored.value = value;
        stored.depth = depth;
        self.inner.state.put(&batch_key(&stored.id), &stored)?;
        self.inner
            .state
            .put(&value_key(stored.value, &stored.id), &stored.id)?;
        debug!(id = %stored.id, value, depth, "batch updated");
        self.compute_radius()
    }

    /// All batches, ordered by id.
    pub fn batches(&self) -> Result<Vec<Batch>, PostageError> {
        Ok(self
            .inner
            .state
            .iter_prefix::<Batch>(BATCH_PREFIX)?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    /// All batch ids ordered by ascending value.
    pub fn ids_by_value(&self) -> Result<Vec<BatchId>, PostageError> {
        Ok(self
            .inner
            .state
            .iter_prefix::<BatchId>(VALUE_PREFIX)?
            .into_iter()
            .map(|(_, id)| id)
            .collect())
    }

    /// The current chain state.
    pub fn chain_state(&self) -> ChainState {
        *self.inner.chain.lock().expect("poisoned")
    }

    /// Stores a new chain state and expires every batch whose value no
    /// longer exceeds the total amount paid out.
    pub fn put_chain_state(&self, cs: ChainState) -> Result<(), PostageError> {
        let mut chain = self.inner.chain.lock().expect("poisoned");
        self.inner.state.put(CHAIN_STATE_KEY, &cs)?;
        *chain = cs;
        let expired = self.expire(cs.total_amount)?;
        drop(chain);
        if expired > 0 {
            self.compute_radius()?;
        }
        Ok(())
    }

    fn expire(&self, total_amount: u128) -> Result<usize, PostageError> {
        let mut expired = 0;
        for (key, id) in self.inner.state.iter_prefix::<BatchId>(VALUE_PREFIX)? {
            let Some(batch) = self.inner.state.get::<Batch>(&batch_key(&id))? else {
                self.inner.state.delete(&key)?;
                continue;
            };
            if batch.value > total_amount {
                break;
            }
            self.call_unreserve(&id, EVICT_ALL)?;
            self.inner.state.delete(&key)?;
            self.inner.state.delete(&batch_key(&id))?;
            info!(%id, value = batch.value, total_amount, "batch expired");
            expired += 1;
        }
        Ok(expired)
    }

    /// The current reserve state.
    pub fn reserve_state(&self) -> ReserveState {
        *self.inner.reserve.lock().expect("poisoned")
    }

    /// Sets the storage radius.
    pub fn set_storage_radius(&self, radius: u8) -> Result<(), PostageError> {
        let changed = {
            let mut reserve = self.inner.reserve.lock().expect("poisoned");
            let mut next = *reserve;
            next.storage_radius = radius;
            self.inner.state.put(RESERVE_STATE_KEY, &next)?;
            let changed = reserve.storage_radius != radius;
            *reserve = next;
            changed
        };
        info!(radius, "storage radius set");
        if changed {
            self.notify_radius(radius);
        }
        Ok(())
    }

    /// Total commitment of all batches, `sum(2^depth)`.
    pub fn commitment(&self) -> Result<u128, PostageError> {
        Ok(self
            .batches()?
            .iter()
            .fold(0u128, |acc, b| acc.saturating_add(b.capacity())))
    }

    fn compute_radius(&self) -> Result<(), PostageError> {
        let commitment = self.commitment()?;
        let radius = radius_for(commitment, self.inner.capacity);
        let (old, next) = {
            let mut reserve = self.inner.reserve.lock().expect("poisoned");
            let old = *reserve;
            let next = ReserveState {
                radius,
                storage_radius: old.storage_radius.max(radius),
            };
            if next != old {
                self.inner.state.put(RESERVE_STATE_KEY, &next)?;
                *reserve = next;
                debug!(radius, commitment, "reserve radius recomputed");
            }
            (old, next)
        };
        if next.storage_radius != old.storage_radius {
            self.notify_radius(next.storage_radius);
        }
        if radius > old.radius {
            self.unreserve(|id, radius| {
                self.call_unreserve(id, radius)?;
                Ok(false)
            })?;
        }
        Ok(())
    }

    fn call_unreserve(&self, id: &BatchId, radius: u8) -> Result<(), PostageError> {
        let f = self.inner.unreserve.lock().expect("poisoned").clone();
        if let Some(f) = f {
            f(id, radius).context(EvictSnafu { id: *id })?;
        }
        Ok(())
    }

    /// Walks the batches in ascending value, calling `f` with each id and
    /// the current radius until it returns `true`.
    pub fn unreserve<F>(&self, mut f: F) -> Result<(), PostageError>
    where
        F: FnMut(&BatchId, u8) -> Result<bool, PostageError>,
    {
        let radius = self.reserve_state().radius;
        for id in self.ids_by_value()? {
            if f(&id, radius)? {
                break;
            }
        }
        Ok(())
    }

    /// Removes all batches and resets chain and reserve state.
    pub fn reset(&self) -> Result<(), PostageError> {
        let old = {
            let mut chain = self.inner.chain.lock().expect("poisoned");
            let mut reserve = self.inner.reserve.lock().expect("poisoned");
            let batches = self.inner.state.delete_prefix(BATCH_PREFIX)?;
            self.inner.state.delete_prefix(VALUE_PREFIX)?;
            self.inner.state.delete(CHAIN_STATE_KEY)?;
            self.inner.state.delete(RESERVE_STATE_KEY)?;
            *chain = ChainState::default();
            let old = std::mem::take(&mut *reserve);
            info!(batches, "batch store reset");
            old
        };
        if old.storage_radius != 0 {
            self.notify_radius(0);
        }
        Ok(())
    }
}

/// The smallest radius at which `commitment` chunks fit into `capacity`.
fn radius_for(commitment: u128, capacity: u64) -> u8 {
    let capacity = u128::from(capacity);
    if capacity == 0 || commitment <= capacity {
        return 0;
    }
    let ratio = commitment.div_ceil(capacity);
    let bits = u128::BITS - (ratio - 1).leading_zeros();
    (bits as u8).min(MAX_PO)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use hive_base::EthAddress;

    use super::*;

    fn batch(n: u8, value: u128, depth: u8) -> Batch {
        Batch {
            id: BatchId::new([n; 32]),
            owner: EthAddress::new([n; 20]),
            value,
            start: 1,
            depth,
            bucket_depth: 16,
            immutable: false,
        }
    }

    fn store(capacity: u64) -> BatchStore {
        BatchStore::new(StateStore::in_memory().unwrap(), capacity).unwrap()
    }

    #[test]
    fn radius() {
        assert_eq!(radius_for(10, 100), 0);
        assert_eq!(radius_for(100, 100), 0);
        assert_eq!(radius_for(101, 100), 1);
        assert_eq!(radius_for(200, 100), 1);
        assert_eq!(radius_for(201, 100), 2);
        assert_eq!(radius_for(1 << 40, 1), MAX_PO);
        assert_eq!(radius_for(5, 0), 0);
    }

    #[test]
    fn save_get_update() {
        let store = store(1 << 20);
        let b = batch(1, 50, 17);
        store.save(&b).unwrap();
        assert!(matches!(
            store.save(&b),
            Err(PostageError::BatchExists { .. })
        ));
        assert_eq!(store.get(&b.id).unwrap(), b);

        store.update(&b, 70, 18).unwrap();
        let updated = store.get(&b.id).unwrap();
        assert_eq!((updated.value, updated.depth), (70, 18));
        assert_eq!(store.ids_by_value().unwrap(), vec![b.id]);

        assert!(matches!(
            store.get(&BatchId::new([2; 32])),
            Err(PostageError::NotFound { .. })
        ));
    }

    #[test]
    fn value_order() {
        let store = store(1 << 30);
        store.save(&batch(1, 300, 17)).unwrap();
        store.save(&batch(2, 5, 17)).unwrap();
        store.save(&batch(3, 0x1_0000, 17)).unwrap();
        let ids = store.ids_by_value().unwrap();
        assert_eq!(
            ids,
            vec![
                BatchId::new([2; 32]),
                BatchId::new([1; 32]),
                BatchId::new([3; 32])
            ]
        );
    }

    #[test]
    fn expiry_evicts() {
        let store = store(1 << 30);
        let evicted = Arc::new(StdMutex::new(Vec::new()));
        let log = evicted.clone();
        store.set_unreserve_fn(Arc::new(move |id, radius| {
            log.lock().unwrap().push((*id, radius));
            Ok(())
        }));
        store.save(&batch(1, 10, 17)).unwrap();
        store.save(&batch(2, 20, 17)).unwrap();
        store.save(&batch(3, 30, 17)).unwrap();

        store
            .put_chain_state(ChainState {
                block: 10,
                total_amount: 20,
                current_price: 1,
            })
            .unwrap();
        assert_eq!(
            *evicted.lock().unwrap(),
            vec![
                (BatchId::new([1; 32]), EVICT_ALL),
                (BatchId::new([2; 32]), EVICT_ALL)
            ]
        );
        assert!(!store.exists(&BatchId::new([1; 32])).unwrap());
        assert!(store.exists(&BatchId::new([3; 32])).unwrap());
        assert_eq!(store.chain_state().total_amount, 20);
    }

    #[test]
    fn radius_growth_unreserves() {
        // capacity for exactly one depth 17 batch
        let store = store(1 << 17);
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let log = calls.clone();
        store.set_unreserve_fn(Arc::new(move |id, radius| {
            log.lock().unwrap().push((*id, radius));
            Ok(())
        }));
        store.save(&batch(1, 100, 17)).unwrap();
        assert_eq!(store.reserve_state().radius, 0);
        assert!(calls.lock().unwrap().is_empty());

        store.save(&batch(2, 50, 17)).unwrap();
        assert_eq!(
            store.reserve_state(),
            ReserveState {
                radius: 1,
                storage_radius: 1
            }
        );
        assert_eq!(
            *calls.lock().unwrap(),
            vec![(BatchId::new([2; 32]), 1), (BatchId::new([1; 32]), 1)]
        );
    }

    #[test]
    fn radius_changes_are_reported() {
        let store = store(100);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        store.set_radius_fn(Arc::new(move |radius| log.lock().unwrap().push(radius)));
        assert_eq!(*seen.lock().unwrap(), vec![0]);

        // 2^16 chunks over a capacity of 100 need radius 10
        store.save(&batch(1, 100, 16)).unwrap();
        // a small batch does not move the radius and is not reported
        store.save(&batch(2, 50, 8)).unwrap();
        store.set_storage_radius(12).unwrap();
        store.reset().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 10, 12, 0]);
    }

    #[test]
    fn reset_and_reload() {
        let state = StateStore::in_memory().unwrap();
        let store = BatchStore::new(state.clone(), 1 << 20).unwrap();
        store.save(&batch(1, 10, 17)).unwrap();
        let cs = ChainState {
            block: 7,
            total_amount: 3,
            current_price: 2,
        };
        store.put_chain_state(cs).unwrap();
        store.set_storage_radius(4).unwrap();

        let reloaded = BatchStore::new(state.clone(), 1 << 20).unwrap();
        assert_eq!(reloaded.chain_state(), cs);
        assert_eq!(reloaded.reserve_state().storage_radius, 4);
        assert_eq!(reloaded.batches().unwrap().len(), 1);

        reloaded.reset().unwrap();
        assert!(reloaded.batches().unwrap().is_empty());
        assert!(reloaded.ids_by_value().unwrap().is_empty());
        assert_eq!(reloaded.chain_state(), ChainState::default());
        assert_eq!(
            BatchStore::new(state, 1 << 20).unwrap().reserve_state(),
            ReserveState::default()
        );
    }
}
