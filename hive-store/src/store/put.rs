use hive_base::{
    Address, Chunk, Stamp,
    stamp::BatchId,
    storage::{ModePut, OverwriteNewerChunkSnafu},
};
use redb::ReadableTable;
use tracing::{debug, trace};

use super::{
    Changes, Inner, Item, gc_add, now_nanos, pin_inc, read_item, remove_chunk, write_item,
};
use crate::{error::LocalStoreError, tables::Tables};

impl Inner {
    pub(super) fn put(&self, mode: ModePut, chunks: &[Chunk]) -> Result<Vec<bool>, LocalStoreError> {
        let res = self.write(|t, c| {
            chunks
                .iter()
                .map(|chunk| self.put_chunk(t, mode, chunk, c))
                .collect::<Result<Vec<_>, _>>()
        });
        let exists = match res {
            Ok(exists) => exists,
            Err(err) => {
                if matches!(
                    &err,
                    LocalStoreError::Storage {
                        source: hive_base::storage::StorageError::OverwriteNewerChunk { .. },
                        ..
                    }
                ) {
                    self.metrics.puts_overwrite_rejected.inc();
                }
                return Err(err);
            }
        };
        let new = exists.iter().filter(|e| !**e).count();
        self.metrics.puts.inc_by(new as u64);
        self.metrics.puts_existing.inc_by((exists.len() - new) as u64);
        if mode == ModePut::Sync {
            self.record_sync_puts(new);
        }
        Ok(exists)
    }

    fn put_chunk(
        &self,
        t: &mut Tables<'_>,
        mode: ModePut,
        chunk: &Chunk,
        c: &mut Changes,
    ) -> Result<bool, LocalStoreError> {
        let address = *chunk.address();
        let pin = matches!(mode, ModePut::UploadPin | ModePut::RequestPin);
        if let Some(item) = read_item(t, &address)? {
            if pin {
                pin_inc(t, &address, &item, c)?;
                self.metrics.pins.inc();
            }
            return Ok(true);
        }
        if let Some(stamp) = chunk.stamp() {
            self.claim_stamp_slot(t, &address, stamp, c)?;
        }

        let bin = address.bin(&self.base_key);
        let bin_id = next_bin_id(t, bin)?;
        let location = self.sharky.write(chunk.data())?;
        c.written.push(location);
        let now = now_nanos();
        let reserved = match chunk.stamp() {
            Some(stamp) if mode != ModePut::RequestCache => {
                bin >= self.reserve_radius(t, stamp.batch_id())?
            }
            _ => false,
        };
        let item = Item {
            location,
            bin,
            bin_id,
            store_ts: now,
            stamp: chunk.stamp().map(|s| s.to_bytes().to_vec()),
            tag: chunk.tag_id(),
            reserved,
        };
        let key = address.as_bytes();
        write_item(t, &address, &item)?;
        t.retrieval_access.insert(key, now)?;
        if let Some(stamp) = chunk.stamp() {
            let batch = stamp.batch_id().as_bytes();
            t.voucher_chunks.insert((batch, bin, bin_id, key), ())?;
            t.voucher_index
                .insert((batch, stamp.index()), (key, stamp.timestamp()))?;
        }

        let upload = matches!(mode, ModePut::Upload | ModePut::UploadPin);
        if upload || mode == ModePut::Sync || reserved {
            t.pull.insert((bin, bin_id), key)?;
            c.pull.push((bin, bin_id));
        }
        if upload {
            t.push.insert((now, key), chunk.tag_id().unwrap_or(0))?;
            c.pushed = true;
        }
        if reserved {
            c.reserve_delta += 1;
        }
        if pin {
            pin_inc(t, &address, &item, c)?;
            self.metrics.pins.inc();
        } else if !upload && !reserved {
            gc_add(t, &address, &item, c)?;
        }
        trace!(%address, ?mode, bin, bin_id, reserved, "put chunk");
        Ok(false)
    }

    /// Makes `address` the holder of the stamp's batch slot.
    ///
    /// A different chunk holding the slot is removed if the new stamp is
    /// newer or the batch is mutable, otherwise the put fails.
    fn claim_stamp_slot(
        &self,
        t: &mut Tables<'_>,
        address: &Address,
        stamp: &Stamp,
        c: &mut Changes,
    ) -> Result<(), LocalStoreError> {
        let batch = stamp.batch_id();
        let prev = t
            .voucher_index
            .get((batch.as_bytes(), stamp.index()))?
            .map(|v| {
                let (addr, ts) = v.value();
                (Address::new(*addr), ts)
            });
        let Some((prev, prev_ts)) = prev else {
            return Ok(());
        };
        if prev == *address {
            return Ok(());
        }
        if stamp.timestamp() > prev_ts || !self.is_immutable(batch) {
            debug!(old = %prev.fmt_short(), new = %address.fmt_short(), %batch, "stamp slot reused, replacing chunk");
            remove_chunk(t, &prev, c)?;
            return Ok(());
        }
        Err(OverwriteNewerChunkSnafu { address: *address }.build().into())
    }

    pub(super) fn reserve_radius(
        &self,
        t: &Tables<'_>,
        batch: &BatchId,
    ) -> Result<u8, LocalStoreError> {
        let batch_radius = t
            .postage_radius
            .get(batch.as_bytes())?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(batch_radius.max(self.radius.load(std::sync::atomic::Ordering::Relaxed)))
    }
}

fn next_bin_id(t: &mut Tables<'_>, bin: u8) -> Result<u64, LocalStoreError> {
    let id = t.bin_ids.get(bin)?.map(|v| v.value()).unwrap_or(0) + 1;
    t.bin_ids.insert(bin, id)?;
    Ok(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use hive_base::{
        Signer,
        storage::{ModeGet, StorageError},
    };
    use hive_postage::{Batch, BatchStore};

    use super::*;
    use crate::{
        LocalStore, LocalStoreConfig,
        store::tests::{chunk, stamped, store},
        tables::{
            GC_TABLE, PIN_TABLE, PULL_TABLE, PUSH_TABLE, RETRIEVAL_ACCESS_TABLE,
            RETRIEVAL_DATA_TABLE, VOUCHER_CHUNKS_TABLE, VOUCHER_INDEX_TABLE,
        },
    };

    /// Which indexes hold a row for `address`.
    #[derive(Debug, Default, PartialEq, Eq)]
    pub(crate) struct Rows {
        pub data: bool,
        pub access: bool,
        pub pull: bool,
        pub push: bool,
        pub gc: bool,
        pub pin: bool,
        pub voucher: bool,
    }

    pub(crate) fn rows(store: &LocalStore, address: &Address) -> Rows {
        let tx = store.inner.db.begin_read().unwrap();
        let key = address.as_bytes();
        let data = tx.open_table(RETRIEVAL_DATA_TABLE).unwrap();
        let item = data.get(key).unwrap().map(|v| Item::decode(v.value()).unwrap());
        let mut rows = Rows {
            data: item.is_some(),
            access: tx
                .open_table(RETRIEVAL_ACCESS_TABLE)
                .unwrap()
                .get(key)
                .unwrap()
                .is_some(),
            pin: tx.open_table(PIN_TABLE).unwrap().get(key).unwrap().is_some(),
            ..Default::default()
        };
        let pull = tx.open_table(PULL_TABLE).unwrap();
        rows.pull = pull
            .iter()
            .unwrap()
            .any(|e| e.unwrap().1.value() == key);
        let push = tx.open_table(PUSH_TABLE).unwrap();
        rows.push = push.iter().unwrap().any(|e| e.unwrap().0.value().1 == key);
        let gc = tx.open_table(GC_TABLE).unwrap();
        rows.gc = gc.iter().unwrap().any(|e| e.unwrap().0.value().2 == key);
        let vc = tx.open_table(VOUCHER_CHUNKS_TABLE).unwrap();
        let vi = tx.open_table(VOUCHER_INDEX_TABLE).unwrap();
        rows.voucher = vc.iter().unwrap().any(|e| e.unwrap().0.value().3 == key)
            || vi.iter().unwrap().any(|e| e.unwrap().1.value().0 == key);
        rows
    }

    #[tokio::test]
    async fn put_modes_populate_indexes() {
        let store = store(100).await;
        let cases = [
            (ModePut::Upload, Rows { data: true, access: true, pull: true, push: true, ..Default::default() }),
            (ModePut::UploadPin, Rows { data: true, access: true, pull: true, push: true, pin: true, ..Default::default() }),
            (ModePut::Request, Rows { data: true, access: true, gc: true, ..Default::default() }),
            (ModePut::RequestPin, Rows { data: true, access: true, pin: true, ..Default::default() }),
            (ModePut::RequestCache, Rows { data: true, access: true, gc: true, ..Default::default() }),
            (ModePut::Sync, Rows { data: true, access: true, pull: true, gc: true, ..Default::default() }),
        ];
        for (i, (mode, expected)) in cases.into_iter().enumerate() {
            let c = chunk(i as u32);
            let exists = store.put(mode, vec![c.clone()]).await.unwrap();
            assert_eq!(exists, vec![false], "{mode}");
            assert_eq!(rows(&store, c.address()), expected, "{mode}");
            assert_eq!(store.get(ModeGet::Lookup, *c.address()).await.unwrap(), c);
        }
        // Request, RequestCache and Sync
        assert_eq!(store.gc_size().unwrap(), 3);
    }

    #[tokio::test]
    async fn put_existing() {
        let store = store(100).await;
        let c = chunk(1);
        assert_eq!(
            store
                .put(ModePut::Request, vec![c.clone(), c.clone()])
                .await
                .unwrap(),
            vec![false, true]
        );
        assert_eq!(store.gc_size().unwrap(), 1);
        // pinning an existing chunk takes it out of gc
        assert_eq!(
            store.put(ModePut::RequestPin, vec![c.clone()]).await.unwrap(),
            vec![true]
        );
        assert_eq!(store.pin_counter(c.address()).unwrap(), 1);
        assert_eq!(store.gc_size().unwrap(), 0);
    }

    #[tokio::test]
    async fn bins_and_bin_ids() {
        let store = store(100).await;
        let chunks: Vec<_> = (0..20).map(chunk).collect();
        store.put(ModePut::Upload, chunks.clone()).await.unwrap();
        let mut total = 0;
        for bin in 0..=hive_base::MAX_PO {
            total += store.last_pull_bin_id(bin).unwrap();
        }
        assert_eq!(total, 20);
        let c = &chunks[0];
        let bin = c.address().bin(store.base_key());
        assert!(store.last_pull_bin_id(bin).unwrap() >= 1);
    }

    #[tokio::test]
    async fn stamped_chunks_are_reserved() {
        let store = store(100).await;
        let signer = Signer::generate(&mut rand::thread_rng());
        let batch = BatchId::new([1; 32]);
        let c = stamped(1, &signer, batch, 0, 1);
        store.put(ModePut::Sync, vec![c.clone()]).await.unwrap();
        assert_eq!(store.reserve_size().unwrap(), 1);
        assert_eq!(store.gc_size().unwrap(), 0);
        let got = store.get(ModeGet::Lookup, *c.address()).await.unwrap();
        assert_eq!(got.stamp(), c.stamp());

        // the radius pushes new chunks out of the reserve
        store.set_radius(hive_base::MAX_PO + 1);
        let c2 = stamped(2, &signer, batch, 1, 2);
        store.put(ModePut::Request, vec![c2.clone()]).await.unwrap();
        assert_eq!(store.reserve_size().unwrap(), 1);
        assert_eq!(store.gc_size().unwrap(), 1);
        assert!(!rows(&store, c2.address()).pull);
    }

    #[tokio::test]
    async fn request_cache_is_never_reserved() {
        let store = store(100).await;
        let signer = Signer::generate(&mut rand::thread_rng());
        let c = stamped(1, &signer, BatchId::new([1; 32]), 0, 1);
        store.put(ModePut::RequestCache, vec![c]).await.unwrap();
        assert_eq!(store.reserve_size().unwrap(), 0);
        assert_eq!(store.gc_size().unwrap(), 1);
    }

    /// Two chunks in the same bucket slot: the stamp index of the second
    /// is forged to match the first.
    fn colliding(signer: &Signer, batch: BatchId, ts1: u64, ts2: u64) -> (Chunk, Chunk) {
        let a = stamped(1, signer, batch, 0, ts1);
        let mut i = 2;
        let b = loop {
            let b = chunk(i);
            if b.address().as_bytes()[0] == a.address().as_bytes()[0] {
                break b;
            }
            i += 1;
        };
        let sa = a.stamp().unwrap();
        let ts = ts2.to_be_bytes();
        let digest = hive_base::stamp::digest(b.address(), &batch, sa.index(), &ts);
        let sig = signer.sign(&digest).unwrap();
        let b = b.with_stamp(Stamp::new(batch, *sa.index(), ts, sig));
        (a, b)
    }

    #[tokio::test]
    async fn older_stamp_is_rejected() {
        let store = store(100).await;
        let signer = Signer::generate(&mut rand::thread_rng());
        let (a, b) = colliding(&signer, BatchId::new([1; 32]), 10, 5);
        store.put(ModePut::Sync, vec![a.clone()]).await.unwrap();
        let err = store.put(ModePut::Sync, vec![b.clone()]).await.unwrap_err();
        assert!(matches!(err, StorageError::OverwriteNewerChunk { .. }));
        assert!(store.has(*a.address()).await.unwrap());
        assert!(!store.has(*b.address()).await.unwrap());
        assert_eq!(store.metrics().puts_overwrite_rejected.get(), 1);
    }

    #[tokio::test]
    async fn newer_stamp_replaces() {
        let store = store(100).await;
        let signer = Signer::generate(&mut rand::thread_rng());
        let (a, b) = colliding(&signer, BatchId::new([1; 32]), 5, 10);
        store.put(ModePut::Sync, vec![a.clone()]).await.unwrap();
        store.put(ModePut::Sync, vec![b.clone()]).await.unwrap();
        assert!(!store.has(*a.address()).await.unwrap());
        assert_eq!(rows(&store, a.address()), Rows::default());
        assert!(store.has(*b.address()).await.unwrap());
        assert_eq!(store.reserve_size().unwrap(), 1);
    }

    #[tokio::test]
    async fn mutable_batch_replaces_older_stamp() {
        let signer = Signer::generate(&mut rand::thread_rng());
        let batch_id = BatchId::new([1; 32]);
        let batch_store =
            BatchStore::new(hive_base::StateStore::in_memory().unwrap(), 1 << 20).unwrap();
        batch_store
            .save(&Batch {
                id: batch_id,
                owner: signer.eth_address(),
                value: 100,
                start: 1,
                depth: 16,
                bucket_depth: 8,
                immutable: false,
            })
            .unwrap();
        let store = LocalStore::builder(Address::ZERO)
            .config(LocalStoreConfig::memory(100))
            .batch_store(batch_store)
            .open()
            .await
            .unwrap();
        let (a, b) = colliding(&signer, batch_id, 10, 5);
        store.put(ModePut::Sync, vec![a.clone()]).await.unwrap();
        store.put(ModePut::Sync, vec![b.clone()]).await.unwrap();
        assert!(!store.has(*a.address()).await.unwrap());
        assert!(store.has(*b.address()).await.unwrap());
    }

    #[tokio::test]
    async fn failed_put_is_atomic() {
        let store = store(100).await;
        let signer = Signer::generate(&mut rand::thread_rng());
        let (a, b) = colliding(&signer, BatchId::new([1; 32]), 10, 5);
        store.put(ModePut::Sync, vec![a]).await.unwrap();
        let fresh = chunk(1000);
        let used = store.inner.sharky.used_slots();
        assert!(store.put(ModePut::Sync, vec![fresh.clone(), b]).await.is_err());
        assert!(!store.has(*fresh.address()).await.unwrap());
        assert_eq!(rows(&store, fresh.address()), Rows::default());
        assert_eq!(store.inner.sharky.used_slots(), used);
    }
}
