use hive_base::{
    Address,
    chunk::TagId,
    storage::{ModeSet, NotFoundSnafu},
};
use tracing::trace;

use super::{Inner, gc_add, gc_remove, in_push, pin_count, pin_inc, read_item, remove_chunk};
use crate::{error::LocalStoreError, tags::State};

impl Inner {
    pub(super) fn set(&self, mode: ModeSet, addresses: &[Address]) -> Result<(), LocalStoreError> {
        match mode {
            ModeSet::Sync => {
                let synced = self.write(|t, c| {
                    let mut synced: Vec<TagId> = Vec::new();
                    for address in addresses {
                        let Some(item) = read_item(t, address)? else {
                            continue;
                        };
                        let tag = t
                            .push
                            .remove((item.store_ts, address.as_bytes()))?
                            .map(|v| v.value());
                        if let Some(tag) = tag.filter(|tag| *tag != 0) {
                            synced.push(tag);
                        }
                        if pin_count(t, address)? == 0 && !item.reserved {
                            gc_add(t, address, &item, c)?;
                        }
                    }
                    Ok(synced)
                })?;
                if let Some(tags) = &self.tags {
                    for uid in synced {
                        if let Some(tag) = tags.get(uid) {
                            tag.inc(State::Synced);
                        }
                    }
                }
            }
            ModeSet::Remove => {
                self.write(|t, c| {
                    for address in addresses {
                        remove_chunk(t, address, c)?;
                    }
                    Ok(())
                })?;
            }
            ModeSet::Pin => {
                self.write(|t, c| {
                    for address in addresses {
                        let Some(item) = read_item(t, address)? else {
                            return Err(NotFoundSnafu { address: *address }.build().into());
                        };
                        pin_inc(t, address, &item, c)?;
                    }
                    Ok(())
                })?;
                self.metrics.pins.inc_by(addresses.len() as u64);
            }
            ModeSet::Unpin => {
                self.write(|t, c| {
                    for address in addresses {
                        let count = pin_count(t, address)?;
                        let item = match read_item(t, address)? {
                            Some(item) if count > 0 => item,
                            _ => return Err(NotFoundSnafu { address: *address }.build().into()),
                        };
                        if count > 1 {
                            t.pin.insert(address.as_bytes(), count - 1)?;
                            continue;
                        }
                        t.pin.remove(address.as_bytes())?;
                        // a stale gc row can not exist while pinned
                        gc_remove(t, address, &item, c)?;
                        if !in_push(t, address, &item)? && !item.reserved {
                            gc_add(t, address, &item, c)?;
                        }
                    }
                    Ok(())
                })?;
                self.metrics.unpins.inc_by(addresses.len() as u64);
            }
        }
        trace!(?mode, count = addresses.len(), "set");
        Ok(())
    }
}
