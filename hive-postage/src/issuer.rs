//! Stamp issuers: the per batch bucket counters of batches this node owns.

use std::sync::Mutex;

use hive_base::{
    Address, BatchId,
    stamp::{bucket_upper_bound, index_to_bytes, to_bucket},
};
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{BucketFullSnafu, PostageError};

/// The persisted state of a [`StampIssuer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerData {
    /// Free form label.
    pub label: String,
    /// Identifies the key used to sign stamps.
    pub key_id: String,
    /// The batch issued from.
    pub batch_id: BatchId,
    /// Normalised balance of the batch.
    pub value: u128,
    /// Depth of the batch.
    pub depth: u8,
    /// Bucket depth of the batch.
    pub bucket_depth: u8,
    /// Block number the batch was created in.
    pub block_number: u64,
    /// Whether full buckets are an error instead of wrapping.
    pub immutable: bool,
    /// Next unused counter per bucket.
    pub buckets: Vec<u32>,
    /// Highest counter reached by any bucket.
    pub max_bucket_count: u32,
}

/// Issues stamp indexes for one batch.
#[derive(Debug)]
pub struct StampIssuer {
    data: Mutex<IssuerData>,
}

impl StampIssuer {
    /// Creates an issuer with all buckets empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: impl Into<String>,
        key_id: impl Into<String>,
        batch_id: BatchId,
        value: u128,
        depth: u8,
        bucket_depth: u8,
        block_number: u64,
        immutable: bool,
    ) -> Self {
        let buckets = vec![0u32; 1usize << bucket_depth.min(32)];
        Self::from_data(IssuerData {
            label: label.into(),
            key_id: key_id.into(),
            batch_id,
            value,
            depth,
            bucket_depth,
            block_number,
            immutable,
            buckets,
            max_bucket_count: 0,
        })
    }

    /// Restores an issuer from persisted state.
    pub fn from_data(data: IssuerData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// A copy of the current state.
    pub fn data(&self) -> IssuerData {
        self.data.lock().expect("poisoned").clone()
    }

    /// Reserves the next index in the bucket of `address`.
    ///
    /// Full buckets of mutable batches wrap around to counter zero,
    /// immutable ones fail with [`PostageError::BucketFull`].
    pub fn inc(&self, address: &Address) -> Result<[u8; 8], PostageError> {
        let mut data = self.data.lock().expect("poisoned");
        let bucket = to_bucket(data.bucket_depth, address);
        let limit = bucket_upper_bound(data.depth, data.bucket_depth);
        let idx = bucket as usize;
        let mut counter = data.buckets[idx];
        if counter >= limit {
            ensure!(!data.immutable, BucketFullSnafu);
            counter = 0;
        }
        data.buckets[idx] = counter + 1;
        data.max_bucket_count = data.max_bucket_count.max(counter + 1);
        Ok(index_to_bytes(bucket, counter))
    }

    /// The batch id.
    pub fn batch_id(&self) -> BatchId {
        self.data.lock().expect("poisoned").batch_id
    }

    /// The label.
    pub fn label(&self) -> String {
        self.data.lock().expect("poisoned").label.clone()
    }

    /// Normalised balance of the batch.
    pub fn value(&self) -> u128 {
        self.data.lock().expect("poisoned").value
    }

    /// Depth of the batch.
    pub fn depth(&self) -> u8 {
        self.data.lock().expect("poisoned").depth
    }

    /// Bucket depth of the batch.
    pub fn bucket_depth(&self) -> u8 {
        self.data.lock().expect("poisoned").bucket_depth
    }

    /// Block the batch was created in.
    pub fn block_number(&self) -> u64 {
        self.data.lock().expect("poisoned").block_number
    }

    /// Whether the batch is immutable.
    pub fn immutable(&self) -> bool {
        self.data.lock().expect("poisoned").immutable
    }

    /// Number of slots per bucket.
    pub fn bucket_upper_bound(&self) -> u32 {
        let data = self.data.lock().expect("poisoned");
        bucket_upper_bound(data.depth, data.bucket_depth)
    }

    /// Fill level of the fullest bucket, `max_bucket_count / upper bound`.
    pub fn utilization(&self) -> f64 {
        let data = self.data.lock().expect("poisoned");
        f64::from(data.max_bucket_count) / f64::from(bucket_upper_bound(data.depth, data.bucket_depth))
    }

    pub(crate) fn set_value(&self, value: u128) {
        self.data.lock().expect("poisoned").value = value;
    }

    pub(crate) fn set_depth(&self, depth: u8) {
        self.data.lock().expect("poisoned").depth = depth;
    }
}

#[cfg(test)]
mod tests {
    use hive_base::stamp::bytes_to_index;

    use super::*;

    fn address_with_prefix(prefix: u8, n: u8) -> Address {
        let mut bytes = [n; 32];
        bytes[0] = prefix;
        Address::new(bytes)
    }

    #[test]
    fn immutable_bucket_full() {
        let issuer = StampIssuer::new("label", "key", BatchId::new([1; 32]), 10, 12, 8, 0, true);
        assert_eq!(issuer.bucket_upper_bound(), 16);
        for n in 0..16u8 {
            let index = issuer.inc(&address_with_prefix(0xa5, n)).unwrap();
            assert_eq!(bytes_to_index(&index), (0xa5, u32::from(n)));
        }
        let err = issuer.inc(&address_with_prefix(0xa5, 16)).unwrap_err();
        assert!(matches!(err, PostageError::BucketFull { .. }));
        // other buckets are unaffected
        issuer.inc(&address_with_prefix(0xa6, 0)).unwrap();
        assert_eq!(issuer.utilization(), 1.0);
    }

    #[test]
    fn mutable_wraps() {
        let issuer = StampIssuer::new("label", "key", BatchId::new([1; 32]), 10, 9, 8, 0, false);
        assert_eq!(issuer.bucket_upper_bound(), 2);
        let addr = address_with_prefix(3, 0);
        let counters: Vec<_> = (0..5)
            .map(|_| bytes_to_index(&issuer.inc(&addr).unwrap()).1)
            .collect();
        assert_eq!(counters, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn depth_increase_raises_bound() {
        let issuer = StampIssuer::new("label", "key", BatchId::new([1; 32]), 10, 9, 8, 0, true);
        let addr = address_with_prefix(3, 0);
        issuer.inc(&addr).unwrap();
        issuer.inc(&addr).unwrap();
        assert!(issuer.inc(&addr).is_err());
        issuer.set_depth(10);
        assert_eq!(bytes_to_index(&issuer.inc(&addr).unwrap()).1, 2);
    }
}
