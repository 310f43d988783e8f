//! Postage batches and the chain and reserve state the batch store keeps
//! alongside them.

use hive_base::{BatchId, EthAddress, stamp::BatchInfo};
use serde::{Deserialize, Serialize};

/// A postage batch as seen on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch id.
    pub id: BatchId,
    /// The owner signing stamps for this batch.
    pub owner: EthAddress,
    /// Normalised balance per chunk. The batch expires once the chain's
    /// cumulative payout reaches it.
    pub value: u128,
    /// Block number the batch was created in.
    pub start: u64,
    /// The batch holds `2^depth` stamps.
    pub depth: u8,
    /// Number of leading address bits selecting a bucket.
    pub bucket_depth: u8,
    /// Immutable batches never reuse a bucket slot.
    pub immutable: bool,
}

impl Batch {
    /// The properties stamps of this batch are validated against.
    pub fn info(&self) -> BatchInfo {
        BatchInfo {
            owner: self.owner,
            depth: self.depth,
            bucket_depth: self.bucket_depth,
            immutable: self.immutable,
        }
    }

    /// Number of chunks this batch may stamp, `2^depth`.
    pub fn capacity(&self) -> u128 {
        1u128.checked_shl(u32::from(self.depth)).unwrap_or(u128::MAX)
    }
}

/// Chain state tracked by the batch store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// Last block number processed.
    pub block: u64,
    /// Cumulative payout per chunk up to `block`.
    pub total_amount: u128,
    /// Price per chunk per block.
    pub current_price: u128,
}

/// Reserve state tracked by the batch store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveState {
    /// Radius derived from the total commitment and the reserve capacity.
    pub radius: u8,
    /// Radius within which chunks are actually kept, adjusted by the depth
    /// monitor.
    pub storage_radius: u8,
}
