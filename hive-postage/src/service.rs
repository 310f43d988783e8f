//! The postage service: the stamp issuers of the batches this node owns.
//!
//! Issuers are persisted in the state store under `voucher<chain id>_<n>`
//! whenever one is added and when the service is closed.

use std::sync::{Arc, Mutex};

use hive_base::{BatchId, EthAddress, StateStore};
use snafu::{OptionExt, ensure};
use tracing::{debug, info};

use crate::{
    BLOCK_THRESHOLD,
    batch::Batch,
    batchstore::BatchStore,
    error::{NotFoundSnafu, NotUsableSnafu, PostageError},
    issuer::{IssuerData, StampIssuer},
};

/// Label given to issuers created from chain events.
pub const RECOVERED_LABEL: &str = "recovered";

/// Tracks the stamp issuers of owned batches.
#[derive(Debug, Clone)]
pub struct PostageService {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: StateStore,
    batch_store: BatchStore,
    owner: EthAddress,
    chain_id: u64,
    issuers: Mutex<Vec<Arc<StampIssuer>>>,
}

impl PostageService {
    /// Creates the service and loads the persisted issuers.
    ///
    /// Only batches owned by `owner` get an issuer.
    pub fn new(
        state: StateStore,
        batch_store: BatchStore,
        owner: EthAddress,
        chain_id: u64,
    ) -> Result<Self, PostageError> {
        let issuers: Vec<_> = state
            .iter_prefix::<IssuerData>(&issuer_prefix(chain_id))?
            .into_iter()
            .map(|(_, data)| Arc::new(StampIssuer::from_data(data)))
            .collect();
        debug!(count = issuers.len(), "loaded stamp issuers");
        Ok(Self {
            inner: Arc::new(Inner {
                state,
                batch_store,
                owner,
                chain_id,
                issuers: Mutex::new(issuers),
            }),
        })
    }

    /// Adds an issuer, unless one for the same batch exists already.
    pub fn add(&self, issuer: StampIssuer) -> Result<(), PostageError> {
        {
            let mut issuers = self.inner.issuers.lock().expect("poisoned");
            let id = issuer.batch_id();
            if issuers.iter().any(|i| i.batch_id() == id) {
                return Ok(());
            }
            issuers.push(Arc::new(issuer));
        }
        self.persist()
    }

    /// All issuers.
    pub fn stamp_issuers(&self) -> Vec<Arc<StampIssuer>> {
        self.inner.issuers.lock().expect("poisoned").clone()
    }

    /// The issuer for `id`, if the batch is old enough to be used.
    pub fn get_stamp_issuer(&self, id: &BatchId) -> Result<Arc<StampIssuer>, PostageError> {
        let issuer = self
            .inner
            .issuers
            .lock()
            .expect("poisoned")
            .iter()
            .find(|i| i.batch_id() == *id)
            .cloned()
            .context(NotFoundSnafu { id: *id })?;
        let block = self.inner.batch_store.chain_state().block;
        ensure!(
            block.saturating_sub(issuer.block_number()) >= BLOCK_THRESHOLD,
            NotUsableSnafu { id: *id }
        );
        Ok(issuer)
    }

    /// Registers an empty issuer for a newly created batch we own.
    pub fn handle_create(&self, batch: &Batch) -> Result<(), PostageError> {
        if batch.owner != self.inner.owner {
            return Ok(());
        }
        info!(id = %batch.id, depth = batch.depth, "new owned batch");
        self.add(StampIssuer::new(
            RECOVERED_LABEL,
            "",
            batch.id,
            batch.value,
            batch.depth,
            batch.bucket_depth,
            batch.start,
            batch.immutable,
        ))
    }

    /// Raises the value of an owned batch.
    pub fn handle_top_up(&self, id: &BatchId, value: u128) -> Result<(), PostageError> {
        if let Some(issuer) = self.find(id) {
            if value > issuer.value() {
                issuer.set_value(value);
                self.persist()?;
            }
        }
        Ok(())
    }

    /// Raises the depth of an owned batch.
    pub fn handle_depth_increase(&self, id: &BatchId, depth: u8) -> Result<(), PostageError> {
        if let Some(issuer) = self.find(id) {
            if depth > issuer.depth() {
                issuer.set_depth(depth);
                self.persist()?;
            }
        }
        Ok(())
    }

    /// Persists all issuers.
    pub fn close(&self) -> Result<(), PostageError> {
        self.persist()
    }

    fn find(&self, id: &BatchId) -> Option<Arc<StampIssuer>> {
        self.inner
            .issuers
            .lock()
            .expect("poisoned")
            .iter()
            .find(|i| i.batch_id() == *id)
            .cloned()
    }

    fn persist(&self) -> Result<(), PostageError> {
        let issuers = self.stamp_issuers();
        let prefix = issuer_prefix(self.inner.chain_id);
        self.inner.state.delete_prefix(&prefix)?;
        for (i, issuer) in issuers.iter().enumerate() {
            self.inner
                .state
                .put(&format!("{prefix}{i}"), &issuer.data())?;
        }
        Ok(())
    }
}

fn issuer_prefix(chain_id: u64) -> String {
    format!("voucher{chain_id}_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ChainState;

    fn setup() -> (StateStore, BatchStore, PostageService, EthAddress) {
        let state = StateStore::in_memory().unwrap();
        let batch_store = BatchStore::new(state.clone(), 1 << 20).unwrap();
        let owner = EthAddress::new([7; 20]);
        let service = PostageService::new(state.clone(), batch_store.clone(), owner, 5).unwrap();
        (state, batch_store, service, owner)
    }

    fn batch(owner: EthAddress, start: u64) -> Batch {
        Batch {
            id: BatchId::new([1; 32]),
            owner,
            value: 100,
            start,
            depth: 20,
            bucket_depth: 16,
            immutable: false,
        }
    }

    #[test]
    fn create_only_owned() {
        let (_, _, service, _) = setup();
        service
            .handle_create(&batch(EthAddress::new([8; 20]), 0))
            .unwrap();
        assert!(service.stamp_issuers().is_empty());
    }

    #[test]
    fn usable_after_threshold() {
        let (state, batch_store, service, owner) = setup();
        let b = batch(owner, 100);
        service.handle_create(&b).unwrap();
        service.handle_create(&b).unwrap();
        assert_eq!(service.stamp_issuers().len(), 1);
        assert_eq!(service.stamp_issuers()[0].label(), RECOVERED_LABEL);

        assert!(matches!(
            service.get_stamp_issuer(&BatchId::new([2; 32])),
            Err(PostageError::NotFound { .. })
        ));

        let at = |block| ChainState {
            block,
            ..Default::default()
        };
        batch_store.put_chain_state(at(105)).unwrap();
        assert!(matches!(
            service.get_stamp_issuer(&b.id),
            Err(PostageError::NotUsable { .. })
        ));
        batch_store.put_chain_state(at(110)).unwrap();
        service.get_stamp_issuer(&b.id).unwrap();

        // persisted on add
        let reloaded = PostageService::new(state, batch_store, owner, 5).unwrap();
        assert_eq!(reloaded.stamp_issuers().len(), 1);
    }

    #[test]
    fn top_up_and_depth_only_raise() {
        let (state, batch_store, service, owner) = setup();
        let b = batch(owner, 0);
        service.handle_create(&b).unwrap();
        service.handle_top_up(&b.id, 50).unwrap();
        service.handle_depth_increase(&b.id, 18).unwrap();
        let issuer = service.stamp_issuers()[0].clone();
        assert_eq!((issuer.value(), issuer.depth()), (100, 20));

        service.handle_top_up(&b.id, 150).unwrap();
        service.handle_depth_increase(&b.id, 21).unwrap();
        assert_eq!((issuer.value(), issuer.depth()), (150, 21));

        service.close().unwrap();
        let reloaded = PostageService::new(state, batch_store, owner, 5).unwrap();
        let data = reloaded.stamp_issuers()[0].data();
        assert_eq!((data.value, data.depth), (150, 21));
    }
}
