use hive_base::{Address, MAX_PO, stamp::BatchId};
use redb::ReadableTable;
use tracing::debug;

use super::{Inner, gc_add, in_push, pin_count, read_item, remove_chunk, write_item};
use crate::error::LocalStoreError;

const ZERO: [u8; 32] = [0u8; 32];

impl Inner {
    /// Moves chunks of `batch` with a proximity order below `radius` out of
    /// the reserve, or evicts them if `radius` is above [`MAX_PO`].
    pub(super) fn unreserve(&self, batch: &BatchId, radius: u8) -> Result<(), LocalStoreError> {
        let _lock = self.gc.lock.lock().expect("poisoned");
        let evict_all = radius > MAX_PO;
        let (unreserved, evicted) = self.write(|t, c| {
            let b = batch.as_bytes();
            let mut entries = Vec::new();
            for entry in t
                .voucher_chunks
                .range((b, 0u8, 0u64, &ZERO)..(b, radius, 0u64, &ZERO))?
            {
                let (key, _) = entry?;
                let (_, _, _, address) = key.value();
                entries.push(Address::new(*address));
            }
            let mut unreserved = 0u64;
            let mut evicted = 0u64;
            for address in entries {
                let Some(mut item) = read_item(t, &address)? else {
                    continue;
                };
                let pinned = pin_count(t, &address)? > 0;
                if evict_all && !pinned {
                    remove_chunk(t, &address, c)?;
                    evicted += 1;
                    continue;
                }
                if !item.reserved {
                    continue;
                }
                item.reserved = false;
                write_item(t, &address, &item)?;
                c.reserve_delta -= 1;
                unreserved += 1;
                if !pinned && !in_push(t, &address, &item)? {
                    gc_add(t, &address, &item, c)?;
                }
            }
            let prev = t.postage_radius.get(b)?.map(|v| v.value());
            if prev.is_none_or(|prev| radius > prev) {
                t.postage_radius.insert(b, radius)?;
            }
            Ok((unreserved, evicted))
        })?;
        self.metrics.reserve_evictions.inc_by(unreserved + evicted);
        debug!(%batch, radius, unreserved, evicted, "unreserved batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hive_base::{
        Signer,
        storage::{ModePut, ModeSet},
    };
    use hive_postage::{Batch, BatchStore, batchstore::EVICT_ALL};

    use super::*;
    use crate::{
        LocalStore, LocalStoreConfig,
        store::{
            put::tests::rows,
            tests::{stamped, store},
        },
    };

    #[tokio::test]
    async fn unreserve_moves_chunks_to_gc() {
        let store = store(100).await;
        let signer = Signer::generate(&mut rand::thread_rng());
        let batch = BatchId::new([5; 32]);
        let other = BatchId::new([6; 32]);
        let chunks: Vec<_> = (0..8).map(|i| stamped(i, &signer, batch, i, 1)).collect();
        store.put(ModePut::Sync, chunks.clone()).await.unwrap();
        let foreign = stamped(100, &signer, other, 0, 1);
        store.put(ModePut::Sync, vec![foreign.clone()]).await.unwrap();
        assert_eq!(store.reserve_size().unwrap(), 9);

        store.unreserve(&batch, MAX_PO).unwrap();
        // base key is zero, so every chunk has a proximity order below MAX_PO
        assert_eq!(store.reserve_size().unwrap(), 1);
        assert_eq!(store.gc_size().unwrap(), 8);
        assert_eq!(store.batch_radius(&batch).unwrap(), Some(MAX_PO));
        assert_eq!(store.batch_radius(&other).unwrap(), None);
        for c in &chunks {
            assert!(store.has(*c.address()).await.unwrap());
            assert!(rows(&store, c.address()).gc);
        }

        // new chunks of the batch below its radius are not reserved
        let late = stamped(50, &signer, batch, 50, 1);
        store.put(ModePut::Sync, vec![late]).await.unwrap();
        assert_eq!(store.reserve_size().unwrap(), 1);

        // a lower radius does not lower the stored one
        store.unreserve(&batch, 2).unwrap();
        assert_eq!(store.batch_radius(&batch).unwrap(), Some(MAX_PO));
    }

    #[tokio::test]
    async fn evict_all_keeps_pinned() {
        let store = store(100).await;
        let signer = Signer::generate(&mut rand::thread_rng());
        let batch = BatchId::new([5; 32]);
        let a = stamped(1, &signer, batch, 0, 1);
        let b = stamped(2, &signer, batch, 1, 1);
        store
            .put(ModePut::Sync, vec![a.clone(), b.clone()])
            .await
            .unwrap();
        store.set(ModeSet::Pin, vec![*a.address()]).await.unwrap();

        store.unreserve(&batch, EVICT_ALL).unwrap();
        assert!(store.has(*a.address()).await.unwrap());
        assert!(!store.has(*b.address()).await.unwrap());
        assert_eq!(store.reserve_size().unwrap(), 0);
        assert_eq!(store.gc_size().unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_store_drives_eviction() {
        let signer = Signer::generate(&mut rand::thread_rng());
        let batch_store =
            BatchStore::new(hive_base::StateStore::in_memory().unwrap(), 1 << 20).unwrap();
        let store = LocalStore::builder(Address::ZERO)
            .config(LocalStoreConfig::memory(100))
            .batch_store(batch_store.clone())
            .open()
            .await
            .unwrap();
        batch_store.set_unreserve_fn(store.unreserve_fn());

        let id = BatchId::new([9; 32]);
        batch_store
            .save(&Batch {
                id,
                owner: signer.eth_address(),
                value: 10,
                start: 1,
                depth: 16,
                bucket_depth: 8,
                immutable: true,
            })
            .unwrap();
        let c = stamped(1, &signer, id, 0, 1);
        store.put(ModePut::Sync, vec![c.clone()]).await.unwrap();

        // the batch runs out of funds
        let mut cs = batch_store.chain_state();
        cs.block = 100;
        cs.total_amount = 10;
        batch_store.put_chain_state(cs).unwrap();
        assert!(!store.has(*c.address()).await.unwrap());
        assert_eq!(store.reserve_size().unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_store_radius_applies_to_new_batches() {
        let signer = Signer::generate(&mut rand::thread_rng());
        let batch_store = BatchStore::new(hive_base::StateStore::in_memory().unwrap(), 100).unwrap();
        let store = LocalStore::builder(Address::ZERO)
            .config(LocalStoreConfig::memory(100))
            .batch_store(batch_store.clone())
            .open()
            .await
            .unwrap();
        batch_store.set_unreserve_fn(store.unreserve_fn());
        batch_store.set_radius_fn({
            let store = store.clone();
            Arc::new(move |radius| store.set_radius(radius))
        });

        let batch = |n: u8, depth: u8| Batch {
            id: BatchId::new([n; 32]),
            owner: signer.eth_address(),
            value: 10,
            start: 1,
            depth,
            bucket_depth: 8,
            immutable: false,
        };
        batch_store.save(&batch(1, 16)).unwrap();
        // the second batch leaves the radius where it is, so it is never unreserved
        batch_store.save(&batch(2, 8)).unwrap();
        assert_eq!(batch_store.reserve_state().storage_radius, 10);
        assert_eq!(store.radius(), 10);
        assert_eq!(store.batch_radius(&BatchId::new([2; 32])).unwrap(), None);

        let c = (0..)
            .map(|i| stamped(i, &signer, BatchId::new([2; 32]), 0, 1))
            .find(|c| Address::ZERO.proximity(c.address()) < 10)
            .unwrap();
        store.put(ModePut::Sync, vec![c.clone()]).await.unwrap();
        assert_eq!(store.reserve_size().unwrap(), 0);
        assert_eq!(store.gc_size().unwrap(), 1);
        assert!(rows(&store, c.address()).gc);
    }
}
