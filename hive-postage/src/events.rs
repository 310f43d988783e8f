//! Applying chain events to the batch store and the postage service.
//!
//! Events arrive grouped by block from an [`EventFeed`]. While a group is
//! applied a dirty marker is kept in the state store; finding it at start
//! means the previous run was interrupted half way, so the batch store is
//! reset and synced again from scratch.

use futures_util::{Stream, StreamExt};
use hive_base::{BatchId, EthAddress, StateStore};
use n0_future::boxed::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    batch::{Batch, ChainState},
    batchstore::BatchStore,
    error::PostageError,
    service::PostageService,
};

const DIRTY_KEY: &str = "batchservice_dirty_db";
const LAST_BLOCK_KEY: &str = "batchservice_last_block";

/// A postage contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    /// A batch was created.
    BatchCreated {
        id: BatchId,
        owner: EthAddress,
        normalised_balance: u128,
        depth: u8,
        bucket_depth: u8,
        immutable: bool,
    },
    /// A batch was topped up.
    BatchTopUp {
        id: BatchId,
        normalised_balance: u128,
    },
    /// A batch was diluted to a greater depth.
    BatchDepthIncrease {
        id: BatchId,
        depth: u8,
        normalised_balance: u128,
    },
    /// The price per chunk per block changed.
    PriceUpdate { price: u128 },
}

/// The events of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvents {
    /// Block number.
    pub block: u64,
    /// Events in log order.
    pub events: Vec<ChainEvent>,
}

/// Source of chain events.
pub trait EventFeed: Send + Sync + std::fmt::Debug + 'static {
    /// Streams the events of every block from `from_block` onwards.
    fn subscribe(&self, from_block: u64) -> BoxStream<BlockEvents>;
}

/// Applies chain events.
#[derive(Debug, Clone)]
pub struct BatchService {
    state: StateStore,
    store: BatchStore,
    postage: PostageService,
}

impl BatchService {
    /// Creates the service.
    pub fn new(state: StateStore, store: BatchStore, postage: PostageService) -> Self {
        Self {
            state,
            store,
            postage,
        }
    }

    /// Prepares for syncing and returns the block to sync from.
    ///
    /// Resets the batch store when the previous sync was interrupted.
    pub fn start(&self, start_block: u64) -> Result<u64, PostageError> {
        if self.state.get::<bool>(DIRTY_KEY)?.unwrap_or(false) {
            warn!("batch service was interrupted, resetting batch store");
            self.store.reset()?;
            self.state.delete(LAST_BLOCK_KEY)?;
            self.state.delete(DIRTY_KEY)?;
        }
        let last: Option<u64> = self.state.get(LAST_BLOCK_KEY)?;
        let from = match last {
            Some(last) => last + 1,
            None => start_block,
        };
        info!(from, "batch service starting");
        Ok(from)
    }

    /// Applies the events of one block and then advances the chain state
    /// to it.
    pub fn apply(&self, block: BlockEvents) -> Result<(), PostageError> {
        self.state.put(DIRTY_KEY, &true)?;
        for event in block.events {
            self.handle(block.block, event)?;
        }
        self.update_block(block.block)?;
        self.state.put(LAST_BLOCK_KEY, &block.block)?;
        self.state.delete(DIRTY_KEY)?;
        Ok(())
    }

    fn handle(&self, block: u64, event: ChainEvent) -> Result<(), PostageError> {
        match event {
            ChainEvent::BatchCreated {
                id,
                owner,
                normalised_balance,
                depth,
                bucket_depth,
                immutable,
            } => {
                let batch = Batch {
                    id,
                    owner,
                    value: normalised_balance,
                    start: block,
                    depth,
                    bucket_depth,
                    immutable,
                };
                self.store.save(&batch)?;
                self.postage.handle_create(&batch)?;
                debug!(%id, depth, "batch created");
            }
            ChainEvent::BatchTopUp {
                id,
                normalised_balance,
            } => {
                let batch = self.store.get(&id)?;
                self.store.update(&batch, normalised_balance, batch.depth)?;
                self.postage.handle_top_up(&id, normalised_balance)?;
                debug!(%id, "batch topped up");
            }
            ChainEvent::BatchDepthIncrease {
                id,
                depth,
                normalised_balance,
            } => {
                let batch = self.store.get(&id)?;
                self.store.update(&batch, normalised_balance, depth)?;
                self.postage.handle_depth_increase(&id, depth)?;
                debug!(%id, depth, "batch depth increased");
            }
            ChainEvent::PriceUpdate { price } => {
                let mut cs = self.store.chain_state();
                cs.current_price = price;
                self.store.put_chain_state(cs)?;
                debug!(price, "price updated");
            }
        }
        Ok(())
    }

    /// Advances the chain state to `block`, paying out the current price
    /// for every block passed.
    pub fn update_block(&self, block: u64) -> Result<(), PostageError> {
        let cs = self.store.chain_state();
        if cs.block != 0 && block <= cs.block {
            return Ok(());
        }
        // nothing is paid out before the first block seen
        let blocks = match cs.block {
            0 => 0,
            last => u128::from(block - last),
        };
        let next = ChainState {
            block,
            total_amount: cs
                .total_amount
                .saturating_add(cs.current_price.saturating_mul(blocks)),
            current_price: cs.current_price,
        };
        self.store.put_chain_state(next)
    }

    /// Applies blocks from `feed` until it ends or `cancel` fires.
    pub async fn run<S>(self, mut feed: S, cancel: CancellationToken)
    where
        S: Stream<Item = BlockEvents> + Send + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = feed.next() => next,
            };
            let Some(block) = next else {
                break;
            };
            let number = block.block;
            if let Err(err) = self.apply(block) {
                warn!(block = number, "failed to apply chain events: {err:#}");
            }
        }
        if let Err(err) = self.postage.close() {
            warn!("failed to persist stamp issuers: {err:#}");
        }
        debug!("batch service stopped");
    }
}

#[cfg(test)]
mod tests {
    use n0_future::stream;
    use tracing_test::traced_test;

    use super::*;

    const OWNER: EthAddress = EthAddress::new([7; 20]);

    fn setup() -> (StateStore, BatchStore, BatchService) {
        let state = StateStore::in_memory().unwrap();
        let store = BatchStore::new(state.clone(), 1 << 30).unwrap();
        let postage = PostageService::new(state.clone(), store.clone(), OWNER, 1).unwrap();
        let service = BatchService::new(state.clone(), store.clone(), postage);
        (state, store, service)
    }

    fn created(n: u8, balance: u128) -> ChainEvent {
        ChainEvent::BatchCreated {
            id: BatchId::new([n; 32]),
            owner: OWNER,
            normalised_balance: balance,
            depth: 20,
            bucket_depth: 16,
            immutable: false,
        }
    }

    #[test]
    fn lifecycle() {
        let (_, store, service) = setup();
        assert_eq!(service.start(10).unwrap(), 10);
        service
            .apply(BlockEvents {
                block: 10,
                events: vec![created(1, 100), created(2, 1000), ChainEvent::PriceUpdate { price: 4 }],
            })
            .unwrap();
        assert_eq!(store.batches().unwrap().len(), 2);
        assert_eq!(store.chain_state().block, 10);
        assert_eq!(store.chain_state().total_amount, 0);

        service
            .apply(BlockEvents {
                block: 30,
                events: vec![ChainEvent::BatchTopUp {
                    id: BatchId::new([2; 32]),
                    normalised_balance: 2000,
                }],
            })
            .unwrap();
        let cs = store.chain_state();
        assert_eq!((cs.block, cs.total_amount), (30, 80));
        assert!(store.exists(&BatchId::new([1; 32])).unwrap());

        // ten more blocks at price 4 pay out the first batch
        service.update_block(40).unwrap();
        assert_eq!(store.chain_state().total_amount, 120);
        assert!(!store.exists(&BatchId::new([1; 32])).unwrap());
        assert_eq!(store.get(&BatchId::new([2; 32])).unwrap().value, 2000);
        assert_eq!(service.start(0).unwrap(), 31);
    }

    #[test]
    #[traced_test]
    fn dirty_resets() {
        let (state, store, service) = setup();
        service
            .apply(BlockEvents {
                block: 5,
                events: vec![created(1, 100)],
            })
            .unwrap();
        state.put(DIRTY_KEY, &true).unwrap();
        assert_eq!(service.start(3).unwrap(), 3);
        assert!(store.batches().unwrap().is_empty());
        assert!(logs_contain("resetting batch store"));
    }

    #[tokio::test]
    async fn run_until_end() {
        let (_, store, service) = setup();
        let blocks = vec![
            BlockEvents {
                block: 1,
                events: vec![created(1, 100)],
            },
            BlockEvents {
                block: 2,
                events: vec![ChainEvent::BatchDepthIncrease {
                    id: BatchId::new([1; 32]),
                    depth: 21,
                    normalised_balance: 50,
                }],
            },
        ];
        service
            .run(stream::iter(blocks), CancellationToken::new())
            .await;
        let batch = store.get(&BatchId::new([1; 32])).unwrap();
        assert_eq!((batch.depth, batch.value), (21, 50));
    }
}
