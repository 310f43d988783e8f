use std::sync::atomic::Ordering;

use hive_base::{
    Address, Chunk,
    storage::{ModeGet, NotFoundSnafu},
};
use redb::ReadableTable;

use super::{Inner, Item, gc_add, gc_remove, now_nanos, read_item};
use crate::{
    error::LocalStoreError,
    tables::{BIN_IDS_TABLE, PIN_TABLE, POSTAGE_RADIUS_TABLE, RETRIEVAL_DATA_TABLE},
};

impl Inner {
    pub(super) fn get(&self, mode: ModeGet, address: &Address) -> Result<Chunk, LocalStoreError> {
        let cached = self
            .lru
            .as_ref()
            .and_then(|lru| lru.lock().expect("poisoned").get(address).cloned());
        let chunk = match cached {
            Some(chunk) => {
                self.metrics.gets_lru.inc();
                chunk
            }
            None => {
                // a remove pops the cache under the write side of this lock
                let _guard = self.release_lock.read().expect("poisoned");
                let chunk = self.read_chunk_locked(address).inspect_err(|err| {
                    if matches!(err, LocalStoreError::Storage { source, .. } if source.is_not_found())
                    {
                        self.metrics.gets_not_found.inc();
                    }
                })?;
                if let Some(lru) = &self.lru {
                    lru.lock().expect("poisoned").put(*address, chunk.clone());
                }
                chunk
            }
        };
        if matches!(mode, ModeGet::Request | ModeGet::RequestPin) {
            self.touch(address)?;
        }
        self.metrics.gets.inc();
        Ok(chunk)
    }

    /// Reads a chunk from the indexes and sharky.
    pub(super) fn read_chunk(&self, address: &Address) -> Result<Chunk, LocalStoreError> {
        let _guard = self.release_lock.read().expect("poisoned");
        self.read_chunk_locked(address)
    }

    /// Like [`Self::read_chunk`], with the release lock already held.
    fn read_chunk_locked(&self, address: &Address) -> Result<Chunk, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RETRIEVAL_DATA_TABLE)?;
        let item = match table.get(address.as_bytes())? {
            Some(v) => Item::decode(v.value())?,
            None => return Err(NotFoundSnafu { address: *address }.build().into()),
        };
        let data = self.sharky.read(item.location)?;
        let mut chunk = Chunk::new(*address, data);
        if let Some(stamp) = item.stamp()? {
            chunk = chunk.with_stamp(stamp);
        }
        if let Some(tag) = item.tag {
            chunk = chunk.with_tag_id(tag);
        }
        Ok(chunk)
    }

    pub(super) fn has(&self, address: &Address) -> Result<bool, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RETRIEVAL_DATA_TABLE)?;
        Ok(table.get(address.as_bytes())?.is_some())
    }

    /// Records an access. While a gc pass runs the update is deferred.
    fn touch(&self, address: &Address) -> Result<(), LocalStoreError> {
        if self.gc.running.load(Ordering::Acquire) {
            self.gc.dirty.lock().expect("poisoned").insert(*address);
            return Ok(());
        }
        self.touch_now(std::slice::from_ref(address))
    }

    /// Updates the access time of each chunk, moving it to the back of the
    /// gc order if it is collectable.
    pub(super) fn touch_now(&self, addresses: &[Address]) -> Result<(), LocalStoreError> {
        self.write(|t, c| {
            let now = now_nanos();
            for address in addresses {
                let Some(item) = read_item(t, address)? else {
                    continue;
                };
                let collectable = gc_remove(t, address, &item, c)?;
                t.retrieval_access.insert(address.as_bytes(), now)?;
                if collectable {
                    gc_add(t, address, &item, c)?;
                }
            }
            Ok(())
        })
    }

    pub(super) fn last_pull_bin_id(&self, bin: u8) -> Result<u64, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(BIN_IDS_TABLE)?;
        Ok(table.get(bin)?.map(|v| v.value()).unwrap_or(0))
    }

    pub(super) fn pin_counter(&self, address: &Address) -> Result<u64, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PIN_TABLE)?;
        Ok(table.get(address.as_bytes())?.map(|v| v.value()).unwrap_or(0))
    }

    pub(super) fn pinned_addresses(&self) -> Result<Vec<Address>, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PIN_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            out.push(Address::new(*key.value()));
        }
        Ok(out)
    }

    pub(super) fn batch_radius(
        &self,
        batch: &hive_base::BatchId,
    ) -> Result<Option<u8>, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(POSTAGE_RADIUS_TABLE)?;
        Ok(table.get(batch.as_bytes())?.map(|v| v.value()))
    }
}
