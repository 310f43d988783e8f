//! A small persistent key value store for node state.
//!
//! Values are postcard encoded and stored under string keys in a single
//! redb table. Keys are grouped by prefix, e.g. `batch_<id>` or
//! `blocklist-<address>`, and can be iterated by prefix in key order.

use std::{path::Path, sync::Arc};

use nested_enum_utils::common_fields;
use redb::{Database, ReadableTable, TableDefinition, backends::InMemoryBackend};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{Backtrace, Snafu};
use tracing::info;

const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("state-1");

/// Errors from the [`StateStore`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum StateStoreError {
    #[snafu(transparent)]
    Io { source: std::io::Error },
    #[snafu(transparent)]
    Database { source: redb::DatabaseError },
    #[snafu(transparent)]
    Transaction { source: redb::TransactionError },
    #[snafu(transparent)]
    Table { source: redb::TableError },
    #[snafu(transparent)]
    Storage { source: redb::StorageError },
    #[snafu(transparent)]
    Commit { source: redb::CommitError },
    #[snafu(transparent)]
    Encoding { source: postcard::Error },
}

/// Persistent key value store for node state.
#[derive(Debug, Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Opens or creates the store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StateStoreError> {
        let path = path.as_ref();
        info!("loading state store from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::builder().create(path)?;
        Self::open(db)
    }

    /// Creates a store that lives in memory.
    pub fn in_memory() -> Result<Self, StateStoreError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self, StateStoreError> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(STATE_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Reads and decodes the value stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(STATE_TABLE)?;
        let Some(row) = table.get(key)? else {
            return Ok(None);
        };
        let value = postcard::from_bytes(row.value())?;
        Ok(Some(value))
    }

    /// Encodes and stores `value` under `key`.
    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StateStoreError> {
        let bytes = postcard::to_stdvec(value)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(STATE_TABLE)?;
            table.insert(key, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool, StateStoreError> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut table = tx.open_table(STATE_TABLE)?;
            table.remove(key)?.is_some()
        };
        tx.commit()?;
        Ok(removed)
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn iter_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StateStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(STATE_TABLE)?;
        let mut out = Vec::new();
        for item in table.range(prefix..)? {
            let (key, value) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), postcard::from_bytes(value.value())?));
        }
        Ok(out)
    }

    /// Removes every key starting with `prefix`, returning how many were
    /// removed.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize, StateStoreError> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut table = tx.open_table(STATE_TABLE)?;
            let keys = {
                let mut keys = Vec::new();
                for item in table.range(prefix..)? {
                    let (key, _) = item?;
                    let key = key.value();
                    if !key.starts_with(prefix) {
                        break;
                    }
                    keys.push(key.to_string());
                }
                keys
            };
            for key in &keys {
                table.remove(key.as_str())?;
            }
            keys.len()
        };
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        a: u64,
        b: String,
    }

    #[test]
    fn put_get_delete() {
        let store = StateStore::in_memory().unwrap();
        assert_eq!(store.get::<Entry>("x").unwrap(), None);
        let entry = Entry {
            a: 3,
            b: "three".into(),
        };
        store.put("x", &entry).unwrap();
        assert_eq!(store.get::<Entry>("x").unwrap(), Some(entry));
        assert!(store.delete("x").unwrap());
        assert!(!store.delete("x").unwrap());
    }

    #[test]
    fn prefixes() {
        let store = StateStore::in_memory().unwrap();
        store.put("batch_b", &2u32).unwrap();
        store.put("batch_a", &1u32).unwrap();
        store.put("batcz", &9u32).unwrap();
        store.put("chainState", &0u32).unwrap();
        let batches = store.iter_prefix::<u32>("batch_").unwrap();
        assert_eq!(
            batches,
            vec![("batch_a".to_string(), 1), ("batch_b".to_string(), 2)]
        );
        assert_eq!(store.delete_prefix("batch_").unwrap(), 2);
        assert!(store.iter_prefix::<u32>("batch_").unwrap().is_empty());
        assert_eq!(store.get::<u32>("batcz").unwrap(), Some(9));
    }

    #[test]
    fn persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("state.redb");
        {
            let store = StateStore::persistent(&path).unwrap();
            store.put("k", "value").unwrap();
        }
        let store = StateStore::persistent(&path).unwrap();
        assert_eq!(store.get::<String>("k").unwrap().as_deref(), Some("value"));
    }
}
