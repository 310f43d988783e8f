//! Visiting every chunk of stored content.

use std::sync::Arc;

use hive_base::{
    Address, soc,
    storage::{Getter, ModeGet, StorageError},
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tracing::trace;

use crate::file::{JoinError, Joiner, Reference};

/// Errors from traversal.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum TraversalError {
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Join { source: JoinError },
}

/// Walks content trees through a [`Getter`].
///
/// A single owner chunk is its own content. Anything else is read as a
/// byte trie.
#[derive(derive_more::Debug)]
pub struct Traverser {
    #[debug("Getter")]
    getter: Arc<dyn Getter>,
    mode: ModeGet,
}

impl Traverser {
    /// A traverser fetching chunks with [`ModeGet::Request`].
    pub fn new(getter: Arc<dyn Getter>) -> Self {
        Self::with_mode(getter, ModeGet::Request)
    }

    /// A traverser fetching chunks with `mode`.
    pub fn with_mode(getter: Arc<dyn Getter>, mode: ModeGet) -> Self {
        Self { getter, mode }
    }

    /// Calls `f` with the address of every chunk under `reference`, the
    /// root first.
    pub async fn traverse<F>(&self, reference: Reference, mut f: F) -> Result<(), TraversalError>
    where
        F: FnMut(&Address) + Send,
    {
        let root = *reference.address();
        if !reference.is_encrypted() {
            let chunk = self.getter.get(self.mode, root).await?;
            if soc::valid(&chunk) {
                trace!(root = %root.fmt_short(), "single owner chunk");
                f(&root);
                return Ok(());
            }
        }
        let joiner = Joiner::with_mode(self.getter.clone(), reference, self.mode).await?;
        joiner.iterate_chunk_addresses(f).await?;
        Ok(())
    }

    /// Addresses of every chunk under `reference`, the root first.
    pub async fn addresses(&self, reference: Reference) -> Result<Vec<Address>, TraversalError> {
        let mut out = Vec::new();
        self.traverse(reference, |address| out.push(*address)).await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use hive_base::{Signer, cac, chunk::CHUNK_SIZE, soc::Soc, storage::{MemStore, ModePut, Putter}};
    use rand::SeedableRng;

    use super::*;
    use crate::file::{Pipeline, feed_pipeline};

    #[tokio::test]
    async fn visits_bytes_trie() {
        let store = MemStore::new();
        let data = vec![3u8; CHUNK_SIZE * 130];
        let pipeline = Pipeline::builder(Arc::new(store.clone())).build();
        let reference = feed_pipeline(pipeline, &data[..]).await.unwrap();

        let traverser = Traverser::new(Arc::new(store.clone()));
        let addresses = traverser.addresses(reference).await.unwrap();
        assert_eq!(addresses[0], *reference.address());
        let distinct: HashSet<_> = addresses.iter().collect();
        // identical leaves share one address
        assert_eq!(distinct.len(), store.len());
    }

    #[tokio::test]
    async fn single_owner_chunk_is_one_chunk() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(4);
        let signer = Signer::generate(&mut rng);
        let inner = cac::new(b"foo").unwrap();
        let chunk = Soc::new([1; 32], inner).sign(&signer).unwrap();
        let store = MemStore::new();
        store.put(ModePut::Upload, vec![chunk.clone()]).await.unwrap();

        let traverser = Traverser::new(Arc::new(store));
        let addresses = traverser
            .addresses(Reference::new(*chunk.address()))
            .await
            .unwrap();
        assert_eq!(addresses, vec![*chunk.address()]);
    }

    #[tokio::test]
    async fn missing_root_fails() {
        let traverser = Traverser::new(Arc::new(MemStore::new()));
        let err = traverser
            .addresses(Reference::new(Address::new([5; 32])))
            .await
            .unwrap_err();
        assert!(matches!(err, TraversalError::Storage { .. }));
    }
}
