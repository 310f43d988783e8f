//! An in memory network and postage batches for tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures_util::future::BoxFuture;
use hive_base::{Address, BatchId, Signer, StateStore};
use hive_postage::{Batch, BatchStore, PostageError, StampIssuer, Stamper};
use tokio::sync::mpsc;

use crate::p2p::{Incoming, Stream, StreamError, Streamer, UnreachableSnafu};

const DUPLEX_BUFFER: usize = 64 * 1024;
const INCOMING_BUFFER: usize = 64;

/// Connects nodes in the same process over [`tokio::io::duplex`] pipes.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    peers: HashMap<Address, mpsc::Sender<Incoming>>,
    streams: HashMap<(Address, Address, String), usize>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Returns its streamer and the streams opened to it.
    pub fn join(&self, overlay: Address) -> (MemoryStreamer, mpsc::Receiver<Incoming>) {
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        self.inner
            .lock()
            .expect("poisoned")
            .peers
            .insert(overlay, tx);
        let streamer = MemoryStreamer {
            network: self.clone(),
            local: overlay,
        };
        (streamer, rx)
    }

    /// Removes a node, streams to it fail from now on.
    pub fn leave(&self, overlay: &Address) {
        self.inner.lock().expect("poisoned").peers.remove(overlay);
    }

    /// Number of streams `from` opened to `to` for `protocol`.
    pub fn stream_count(&self, from: &Address, to: &Address, protocol: &str) -> usize {
        self.inner
            .lock()
            .expect("poisoned")
            .streams
            .get(&(*from, *to, protocol.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

/// The [`Streamer`] of one node of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryStreamer {
    network: MemoryNetwork,
    local: Address,
}

impl MemoryStreamer {
    /// Overlay address of the node.
    pub fn local(&self) -> &Address {
        &self.local
    }
}

impl Streamer for MemoryStreamer {
    fn new_stream<'a>(
        &'a self,
        peer: Address,
        protocol: &'a str,
    ) -> BoxFuture<'a, Result<Stream, StreamError>> {
        Box::pin(async move {
            let sender = {
                let mut inner = self.network.inner.lock().expect("poisoned");
                let Some(sender) = inner.peers.get(&peer).cloned() else {
                    return UnreachableSnafu { peer }.fail();
                };
                *inner
                    .streams
                    .entry((self.local, peer, protocol.to_string()))
                    .or_default() += 1;
                sender
            };
            let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
            let (local_read, local_write) = tokio::io::split(local);
            let (remote_read, remote_write) = tokio::io::split(remote);
            let incoming = Incoming {
                protocol: protocol.to_string(),
                stream: Stream::new(self.local, remote_read, remote_write),
            };
            if sender.send(incoming).await.is_err() {
                return UnreachableSnafu { peer }.fail();
            }
            Ok(Stream::new(peer, local_read, local_write))
        })
    }
}

/// Id of the batch created by [`test_postage`].
pub const TEST_BATCH_ID: BatchId = BatchId::new([7; 32]);

/// An in memory batch store holding one batch owned by `owner`, and a
/// stamper issuing from it.
///
/// The batch has depth 16 and bucket depth 8, enough for a few thousand
/// chunks in every test.
pub fn test_postage(owner: Arc<Signer>) -> Result<(Arc<BatchStore>, Stamper), PostageError> {
    let batches = BatchStore::new(StateStore::in_memory()?, 1 << 20)?;
    batches.save(&Batch {
        id: TEST_BATCH_ID,
        owner: owner.eth_address(),
        value: 1_000_000,
        start: 0,
        depth: 16,
        bucket_depth: 8,
        immutable: false,
    })?;
    let issuer = StampIssuer::new("test", "default", TEST_BATCH_ID, 1_000_000, 16, 8, 0, false);
    Ok((Arc::new(batches), Stamper::new(Arc::new(issuer), owner)))
}
