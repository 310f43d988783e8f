//! Validation of stamps received along with chunks.

use hive_base::{Chunk, Stamp};

use crate::{batchstore::BatchStore, error::PostageError};

/// Validates the stamp attached to an incoming chunk.
pub trait ValidStamp: Send + Sync + std::fmt::Debug + 'static {
    /// Parses `stamp`, checks it against the batch it claims to belong to
    /// and returns `chunk` with the stamp attached.
    fn valid_stamp(&self, chunk: Chunk, stamp: &[u8]) -> Result<Chunk, PostageError>;
}

impl ValidStamp for BatchStore {
    fn valid_stamp(&self, chunk: Chunk, stamp: &[u8]) -> Result<Chunk, PostageError> {
        let stamp = Stamp::from_bytes(stamp)?;
        let batch = self.get(stamp.batch_id())?;
        stamp.valid(chunk.address(), &batch.info())?;
        Ok(chunk.with_stamp(stamp))
    }
}
