//! Garbage collection.
//!
//! Collectable chunks are ordered by `(access time, bin id)` in the gc
//! table. Once the gc size grows above the cache capacity a pass evicts
//! the oldest entries until it drops to the gc target.

use std::sync::{Weak, atomic::Ordering};

use hive_base::Address;
use redb::ReadableTable;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Inner, remove_chunk};
use crate::{
    error::LocalStoreError,
    tables::{GC_SIZE, GC_TABLE},
};

/// Upper bound of chunks evicted in one write transaction.
const GC_BATCH_SIZE: u64 = 1024;

pub(super) async fn gc_worker(
    inner: Weak<Inner>,
    mut trigger: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = trigger.recv() => {
                if msg.is_none() {
                    break;
                }
            }
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || inner.collect_garbage()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(evicted)) => debug!(evicted, "gc pass done"),
            Ok(Err(err)) => warn!("gc pass failed: {err:#}"),
            Err(err) => warn!("gc pass panicked: {err:#}"),
        }
    }
    debug!("gc worker stopped");
}

impl Inner {
    /// Runs a gc pass if the gc size is above capacity.
    pub(super) fn collect_garbage(&self) -> Result<usize, LocalStoreError> {
        let _lock = self.gc.lock.lock().expect("poisoned");
        if self.counter(GC_SIZE)? <= self.config.cache_capacity {
            return Ok(0);
        }
        self.gc.running.store(true, Ordering::Release);
        let res = self.evict();
        self.gc.running.store(false, Ordering::Release);

        let dirty: Vec<Address> = self.gc.dirty.lock().expect("poisoned").drain().collect();
        if !dirty.is_empty() {
            self.touch_now(&dirty)?;
        }
        self.metrics.gc_runs.inc();
        let evicted = res?;
        self.metrics.gc_evictions.inc_by(evicted as u64);
        Ok(evicted)
    }

    fn evict(&self) -> Result<usize, LocalStoreError> {
        let target = self.config.gc_target();
        let mut gc_size = self.counter(GC_SIZE)?;
        let mut evicted = 0;
        while gc_size > target {
            let candidates = self.gc_candidates((gc_size - target).min(GC_BATCH_SIZE))?;
            if candidates.is_empty() {
                break;
            }
            let dirty = self.gc.dirty.lock().expect("poisoned").clone();
            let removed = self.write(|t, c| {
                let mut removed = 0;
                for (ts, bin_id, address) in &candidates {
                    if dirty.contains(address) {
                        continue;
                    }
                    // pinned, accessed or removed since the candidates were read
                    if t.gc.get((*ts, *bin_id, address.as_bytes()))?.is_none() {
                        continue;
                    }
                    if remove_chunk(t, address, c)? {
                        removed += 1;
                    }
                }
                Ok(removed)
            })?;
            if removed == 0 {
                break;
            }
            evicted += removed;
            gc_size = self.counter(GC_SIZE)?;
        }
        Ok(evicted)
    }

    fn gc_candidates(&self, limit: u64) -> Result<Vec<(u64, u64, Address)>, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(GC_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()?.take(limit as usize) {
            let (key, _) = entry?;
            let (ts, bin_id, address) = key.value();
            out.push((ts, bin_id, Address::new(*address)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hive_base::storage::{ModeGet, ModePut, ModeSet};
    use tracing_test::traced_test;

    use crate::store::tests::{chunk, store};

    #[tokio::test]
    async fn evicts_oldest_down_to_target() {
        // capacity 10, target 9
        let store = store(10).await;
        for i in 0..10 {
            store.put(ModePut::Request, vec![chunk(i)]).await.unwrap();
        }
        assert_eq!(store.collect_garbage().await.unwrap(), 0);

        store.put(ModePut::Request, vec![chunk(10)]).await.unwrap();
        // the worker may have been first
        let _ = store.collect_garbage().await.unwrap();
        assert_eq!(store.gc_size().unwrap(), 9);
        for i in 0..2 {
            assert!(!store.has(*chunk(i).address()).await.unwrap());
        }
        for i in 2..11 {
            assert!(store.has(*chunk(i).address()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn accessed_and_pinned_chunks_survive() {
        let store = store(4).await;
        for i in 0..4 {
            store.put(ModePut::Request, vec![chunk(i)]).await.unwrap();
        }
        store.get(ModeGet::Request, *chunk(0).address()).await.unwrap();
        store.set(ModeSet::Pin, vec![*chunk(1).address()]).await.unwrap();
        store
            .put(ModePut::Request, vec![chunk(4), chunk(5)])
            .await
            .unwrap();
        let _ = store.collect_garbage().await.unwrap();
        // gc size 5 over capacity 4, target 4 (fraction rounds to 0)
        assert!(store.has(*chunk(0).address()).await.unwrap());
        assert!(store.has(*chunk(1).address()).await.unwrap());
        assert!(!store.has(*chunk(2).address()).await.unwrap());
        assert_eq!(store.gc_size().unwrap(), 4);
    }

    #[tokio::test]
    async fn uploads_are_not_collected() {
        let store = store(2).await;
        store
            .put(ModePut::Upload, (0..5).map(chunk).collect())
            .await
            .unwrap();
        assert_eq!(store.collect_garbage().await.unwrap(), 0);
        for i in 0..5 {
            assert!(store.has(*chunk(i).address()).await.unwrap());
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn worker_runs_when_over_capacity() {
        let store = store(4).await;
        store
            .put(ModePut::Request, (0..8).map(chunk).collect())
            .await
            .unwrap();
        let mut tries = 0;
        while store.metrics().gc_evictions.get() < 4 {
            tries += 1;
            assert!(tries < 100, "gc worker did not run");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.gc_size().unwrap(), 4);
        assert_eq!(store.metrics().gc_evictions.get(), 4);
    }
}
