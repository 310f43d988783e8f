//! Keeps content alive on the network: re-uploads it and checks whether
//! it can still be retrieved.

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, future::BoxFuture, stream};
use hive_base::{
    Address, Chunk,
    storage::{Getter, ModeGet, StorageError},
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tracing::{debug, instrument};

use crate::{
    file::Reference,
    pushsync::{PushSync, PushSyncError},
    retrieval::{Retrieval, RetrievalError},
    traversal::{TraversalError, Traverser},
};

/// Chunks pushed concurrently by [`Warden::reupload`].
pub const PARALLEL_PUSH: usize = 5;

/// Errors from the warden.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WardenError {
    #[snafu(transparent)]
    Traversal { source: TraversalError },
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Push { source: PushSyncError },
}

/// A [`Getter`] that only asks the network.
#[derive(Debug, Clone)]
pub struct NetworkGetter {
    retrieval: Retrieval,
}

impl NetworkGetter {
    /// Wraps `retrieval`.
    pub fn new(retrieval: Retrieval) -> Self {
        Self { retrieval }
    }
}

impl Getter for NetworkGetter {
    fn get(&self, _mode: ModeGet, address: Address) -> BoxFuture<'_, Result<Chunk, StorageError>> {
        Box::pin(async move {
            self.retrieval
                .retrieve_chunk(address, Address::ZERO)
                .await
                .map_err(|err| match err {
                    RetrievalError::NotFound { address } => {
                        hive_base::storage::NotFoundSnafu { address }.build()
                    }
                    err => StorageError::from_err(err),
                })
        })
    }
}

/// Re-uploads content and checks it is retrievable.
#[derive(derive_more::Debug)]
pub struct Warden {
    #[debug("Getter")]
    local: Arc<dyn Getter>,
    pushsync: PushSync,
    retrieval: Retrieval,
}

impl Warden {
    /// Creates a warden reading content from `local`.
    pub fn new(local: Arc<dyn Getter>, pushsync: PushSync, retrieval: Retrieval) -> Self {
        Self {
            local,
            pushsync,
            retrieval,
        }
    }

    /// Pushes every chunk of `reference` to its neighbourhood again.
    ///
    /// Chunks are read from the local store and must carry a stamp.
    #[instrument(skip_all, fields(root = %reference.address().fmt_short()))]
    pub async fn reupload(&self, reference: Reference) -> Result<(), WardenError> {
        let addresses = Traverser::new(self.local.clone())
            .addresses(reference)
            .await?;
        debug!(chunks = addresses.len(), "reuploading");
        stream::iter(addresses)
            .map(|address| self.reupload_chunk(address))
            .buffer_unordered(PARALLEL_PUSH)
            .try_collect::<()>()
            .await
    }

    async fn reupload_chunk(&self, address: Address) -> Result<(), WardenError> {
        let chunk = self.local.get(ModeGet::Request, address).await?;
        match self.pushsync.push_chunk_to_closest(chunk).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_want_self() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether every chunk of `reference` can be retrieved from the
    /// network, without falling back to the local store.
    #[instrument(skip_all, fields(root = %reference.address().fmt_short()))]
    pub async fn is_retrievable(&self, reference: Reference) -> bool {
        let network = Arc::new(NetworkGetter::new(self.retrieval.clone()));
        let traverser = Traverser::new(network.clone());
        let addresses = match traverser.addresses(reference).await {
            Ok(addresses) => addresses,
            Err(err) => {
                debug!("traversal failed: {err}");
                return false;
            }
        };
        // traversal fetched the inner nodes, leaves are fetched here
        let mut fetches = stream::iter(addresses)
            .map(|address| {
                let network = network.clone();
                async move { network.get(ModeGet::Request, address).await }
            })
            .buffer_unordered(PARALLEL_PUSH);
        while let Some(res) = fetches.next().await {
            if let Err(err) = res {
                debug!("chunk not retrievable: {err}");
                return false;
            }
        }
        true
    }
}
