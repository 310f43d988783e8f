//! Pushing chunks to the neighbourhood responsible for storing them.
//!
//! A pushed chunk travels hop by hop towards its address, each hop handing
//! it to the connected peer closest to it. The first node inside the
//! chunk's neighbourhood stores it and answers with a signed [`Receipt`],
//! which is relayed back along the path to the originator.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use hive_base::{
    Address, Chunk, Signature, Signer, cac,
    crypto::{CryptoError, recover_address},
    soc,
    storage::{ModePut, StorageError, Storer},
};
use hive_postage::{PostageError, ValidStamp};
use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu, ensure};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace};

use crate::{
    accounting::{Accounting, AccountingError, DEFAULT_BASE_PRICE, NoAccounting, Pricer},
    config::PushSyncConfig,
    metrics::PushSyncMetrics,
    p2p::{AcceptError, ProtocolHandler, Stream, StreamError, Streamer},
    topology::{ClosestPeerer, NeighborhoodDepther, Topology, TopologyError},
};

/// Protocol name of push sync.
pub const PROTOCOL: &str = "pushsync/1.0.0";

/// Peers tried for one chunk before a push fails.
pub const MAX_PUSH_ATTEMPTS: usize = 3;

/// Errors from push sync.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PushSyncError {
    #[snafu(display("this node is the closest to the chunk"))]
    WantSelf {},
    #[snafu(display("no peer to push to"))]
    NoPeer {},
    #[snafu(display("chunk {address} has no stamp"))]
    MissingStamp { address: Address },
    #[snafu(display("invalid chunk {address}"))]
    InvalidChunk { address: Address },
    #[snafu(display("invalid stamp"))]
    InvalidStamp { source: PostageError },
    #[snafu(display("invalid receipt from {peer}"))]
    InvalidReceipt { peer: Address },
    #[snafu(display("peer {peer} refused the chunk: {message}"))]
    Remote { peer: Address, message: String },
    #[snafu(display("stream to {peer} failed"))]
    Stream { peer: Address, source: StreamError },
    #[snafu(display("peer {peer} sent no receipt in time"))]
    Timeout { peer: Address },
    #[snafu(display("signing receipt"))]
    Sign { source: CryptoError },
    #[snafu(transparent)]
    Accounting { source: AccountingError },
    #[snafu(transparent)]
    Store { source: StorageError },
    #[snafu(display("push sync closed"))]
    Closed {},
}

impl PushSyncError {
    /// Whether the chunk's closest node is this one, so it counts as
    /// delivered.
    pub fn is_want_self(&self) -> bool {
        matches!(self, PushSyncError::WantSelf { .. })
    }
}

/// Called with every chunk this node stored as the end of a push.
pub type StoredHook = Arc<dyn Fn(&Chunk) + Send + Sync>;

/// Proof that a node in the chunk's neighbourhood stored it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// The stored chunk.
    pub address: Address,
    /// Signature of the storer over the chunk address.
    pub signature: Signature,
}

impl Receipt {
    /// Recovers the ethereum address of the node that signed the receipt.
    pub fn signer(&self) -> Result<hive_base::EthAddress, CryptoError> {
        recover_address(&self.signature, self.address.as_bytes())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Delivery {
    address: Address,
    data: Bytes,
    stamp: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
enum Response {
    Receipt { address: Address, signature: Bytes },
    Error { message: String },
}

/// Pushes chunks towards their neighbourhood and serves [`PROTOCOL`].
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct PushSync {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    base: Address,
    signer: Arc<Signer>,
    streamer: Arc<dyn Streamer>,
    topology: Arc<dyn Topology>,
    store: Arc<dyn Storer>,
    valid_stamp: Arc<dyn ValidStamp>,
    accounting: Arc<dyn Accounting>,
    pricer: Pricer,
    config: PushSyncConfig,
    #[debug(skip)]
    stored_hook: OnceLock<StoredHook>,
    cancel: CancellationToken,
    metrics: Arc<PushSyncMetrics>,
}

/// Builder for [`PushSync`].
#[derive(derive_more::Debug)]
pub struct Builder {
    base: Address,
    signer: Arc<Signer>,
    streamer: Arc<dyn Streamer>,
    topology: Arc<dyn Topology>,
    store: Arc<dyn Storer>,
    valid_stamp: Arc<dyn ValidStamp>,
    accounting: Option<Arc<dyn Accounting>>,
    pricer: Option<Pricer>,
    config: PushSyncConfig,
    metrics: Option<Arc<PushSyncMetrics>>,
}

impl Builder {
    /// Sets the accounting. Defaults to [`NoAccounting`].
    pub fn accounting(mut self, accounting: Arc<dyn Accounting>) -> Self {
        self.accounting = Some(accounting);
        self
    }

    /// Sets the pricer.
    pub fn pricer(mut self, pricer: Pricer) -> Self {
        self.pricer = Some(pricer);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: PushSyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares metrics with other components.
    pub fn metrics(mut self, metrics: Arc<PushSyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the service.
    pub fn build(self) -> PushSync {
        PushSync {
            inner: Arc::new(Inner {
                pricer: self
                    .pricer
                    .unwrap_or_else(|| Pricer::new(self.base, DEFAULT_BASE_PRICE)),
                base: self.base,
                signer: self.signer,
                streamer: self.streamer,
                topology: self.topology,
                store: self.store,
                valid_stamp: self.valid_stamp,
                accounting: self.accounting.unwrap_or_else(|| Arc::new(NoAccounting)),
                config: self.config,
                stored_hook: OnceLock::new(),
                cancel: CancellationToken::new(),
                metrics: self.metrics.unwrap_or_default(),
            }),
        }
    }
}

impl PushSync {
    /// Creates a builder.
    ///
    /// Receipts are signed with `signer`. Chunks this node is responsible
    /// for are stored in `store` once their stamp passes `valid_stamp`.
    pub fn builder(
        base: Address,
        signer: Arc<Signer>,
        streamer: Arc<dyn Streamer>,
        topology: Arc<dyn Topology>,
        store: Arc<dyn Storer>,
        valid_stamp: Arc<dyn ValidStamp>,
    ) -> Builder {
        Builder {
            base,
            signer,
            streamer,
            topology,
            store,
            valid_stamp,
            accounting: None,
            pricer: None,
            config: PushSyncConfig::default(),
            metrics: None,
        }
    }

    /// Metrics of this service.
    pub fn metrics(&self) -> &Arc<PushSyncMetrics> {
        &self.inner.metrics
    }

    /// Installs the hook called with chunks stored at the end of a push.
    ///
    /// Only the first hook is kept, returns whether this one was.
    pub fn set_stored_hook(&self, hook: StoredHook) -> bool {
        self.inner.stored_hook.set(hook).is_ok()
    }

    /// The peer a push of `address` would go to first.
    pub fn closest_peer(&self, address: &Address) -> Result<Address, PushSyncError> {
        match self.inner.topology.closest_peer(address, true, &[]) {
            Ok(peer) => Ok(peer),
            Err(TopologyError::WantSelf) => WantSelfSnafu.fail(),
            Err(_) => NoPeerSnafu.fail(),
        }
    }

    /// Pushes a stamped chunk towards its neighbourhood and waits for the
    /// receipt.
    ///
    /// Fails with [`PushSyncError::WantSelf`] if this node is the closest
    /// one, in which case the chunk is already where it belongs.
    pub async fn push_chunk_to_closest(&self, chunk: Chunk) -> Result<Receipt, PushSyncError> {
        ensure!(!self.inner.cancel.is_cancelled(), ClosedSnafu);
        let address = *chunk.address();
        self.push_to_closest(chunk, None)
            .instrument(debug_span!("push", chunk = %address.fmt_short()))
            .await
    }

    /// Stops serving and refuses new pushes.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// `source` is the peer the chunk came from, `None` when we originate.
    async fn push_to_closest(&self, chunk: Chunk, source: Option<Address>) -> Result<Receipt, PushSyncError> {
        let address = *chunk.address();
        let stamp = chunk
            .stamp()
            .context(MissingStampSnafu { address })?
            .to_bytes();
        let origin = source.is_none();
        let mut skip: Vec<Address> = source.into_iter().collect();
        let mut last_err = None;

        for _ in 0..MAX_PUSH_ATTEMPTS {
            let peer = match self.inner.topology.closest_peer(&address, true, &skip) {
                Ok(peer) => peer,
                Err(TopologyError::WantSelf) => return WantSelfSnafu.fail(),
                Err(_) => break,
            };
            skip.push(peer);
            let price = self.inner.pricer.peer_price(&peer, &address);
            let credit = match self.inner.accounting.prepare_credit(peer, price, origin) {
                Ok(credit) => credit,
                Err(err) => {
                    trace!(peer = %peer.fmt_short(), "{err}, trying next peer");
                    last_err = Some(err.into());
                    continue;
                }
            };
            self.inner.metrics.pushed.inc();
            let res = tokio::select! {
                _ = self.inner.cancel.cancelled() => return ClosedSnafu.fail(),
                res = tokio::time::timeout(self.inner.config.timeout, self.push_peer(peer, &chunk, &stamp)) => {
                    res.unwrap_or_else(|_| TimeoutSnafu { peer }.fail())
                }
            };
            match res {
                Ok(receipt) => {
                    credit.apply();
                    self.inner.metrics.receipts.inc();
                    return Ok(receipt);
                }
                Err(err) => {
                    debug!(peer = %peer.fmt_short(), "push failed: {err}");
                    self.inner.metrics.push_failures.inc();
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => NoPeerSnafu.fail(),
        }
    }

    async fn push_peer(&self, peer: Address, chunk: &Chunk, stamp: &[u8]) -> Result<Receipt, PushSyncError> {
        let address = *chunk.address();
        let mut stream = self
            .inner
            .streamer
            .new_stream(peer, PROTOCOL)
            .await
            .context(StreamSnafu { peer })?;
        stream
            .write(&Delivery {
                address,
                data: chunk.data().clone(),
                stamp: Bytes::copy_from_slice(stamp),
            })
            .await
            .context(StreamSnafu { peer })?;
        match stream.read().await.context(StreamSnafu { peer })? {
            Response::Receipt {
                address: receipt_address,
                signature,
            } => {
                let receipt = Signature::from_slice(&signature)
                    .ok()
                    .filter(|_| receipt_address == address)
                    .map(|signature| Receipt { address, signature })
                    .filter(|receipt| receipt.signer().is_ok());
                match receipt {
                    Some(receipt) => Ok(receipt),
                    None => {
                        self.inner.metrics.invalid_receipts.inc();
                        InvalidReceiptSnafu { peer }.fail()
                    }
                }
            }
            Response::Error { message } => RemoteSnafu { peer, message }.fail(),
        }
    }

    async fn handle(&self, mut stream: Stream) -> Result<(), PushSyncError> {
        let peer = *stream.peer();
        let delivery: Delivery = stream.read().await.context(StreamSnafu { peer })?;
        let res = self
            .handle_delivery(peer, delivery)
            .instrument(debug_span!("pushsync.handle", peer = %peer.fmt_short()))
            .await;
        let response = match &res {
            Ok(receipt) => Response::Receipt {
                address: receipt.address,
                signature: Bytes::copy_from_slice(receipt.signature.as_bytes()),
            },
            Err(err) => {
                self.inner.metrics.handler_errors.inc();
                Response::Error {
                    message: err.to_string(),
                }
            }
        };
        stream.write(&response).await.context(StreamSnafu { peer })?;
        res.map(|_| ())
    }

    async fn handle_delivery(&self, peer: Address, delivery: Delivery) -> Result<Receipt, PushSyncError> {
        let Delivery {
            address,
            data,
            stamp,
        } = delivery;
        let chunk = Chunk::new(address, data);
        ensure!(
            cac::valid(&chunk) || soc::valid(&chunk),
            InvalidChunkSnafu { address }
        );
        let chunk = self
            .inner
            .valid_stamp
            .valid_stamp(chunk, &stamp)
            .inspect_err(|_| {
                self.inner.metrics.invalid_stamps.inc();
            })
            .context(InvalidStampSnafu)?;

        let price = self.inner.pricer.price(&address);
        let debit = self.inner.accounting.prepare_debit(peer, price)?;
        let receipt = if self.in_neighborhood(&address) {
            self.store_and_sign(chunk).await?
        } else {
            match self.push_to_closest(chunk.clone(), Some(peer)).await {
                Ok(receipt) => receipt,
                Err(err) if err.is_want_self() => self.store_and_sign(chunk).await?,
                Err(err) => return Err(err),
            }
        };
        debit.apply();
        Ok(receipt)
    }

    fn in_neighborhood(&self, address: &Address) -> bool {
        self.inner.base.proximity(address) >= self.inner.topology.neighborhood_depth()
    }

    async fn store_and_sign(&self, chunk: Chunk) -> Result<Receipt, PushSyncError> {
        let address = *chunk.address();
        self.inner.store.put(ModePut::Sync, vec![chunk.clone()]).await?;
        self.inner.metrics.stored.inc();
        if let Some(hook) = self.inner.stored_hook.get() {
            hook(&chunk);
        }
        let signature = self
            .inner
            .signer
            .sign(address.as_bytes())
            .context(SignSnafu)?;
        trace!(chunk = %address.fmt_short(), "stored, signed receipt");
        Ok(Receipt { address, signature })
    }
}

impl ProtocolHandler for PushSync {
    fn accept(&self, stream: Stream) -> BoxFuture<Result<(), AcceptError>> {
        let this = self.clone();
        Box::pin(async move { this.handle(stream).await.map_err(AcceptError::from_err) })
    }

    fn shutdown(&self) -> BoxFuture<()> {
        let this = self.clone();
        Box::pin(async move { this.close() })
    }
}

#[cfg(test)]
mod tests {
    use hive_base::storage::MemStore;
    use hive_postage::{BatchStore, Stamper};
    use rand::SeedableRng;

    use super::*;
    use crate::{
        p2p::Router,
        test_utils::{MemoryNetwork, test_postage},
        topology::StaticTopology,
    };

    /// `target` with bit `po` flipped, so its proximity to `target` is `po`.
    fn at_po(target: &Address, po: u8) -> Address {
        let mut bytes = *target.as_bytes();
        bytes[(po / 8) as usize] ^= 0x80 >> (po % 8);
        Address::new(bytes)
    }

    struct TestNode {
        signer: Arc<Signer>,
        store: MemStore,
        topology: Arc<StaticTopology>,
        pushsync: PushSync,
        _router: Router,
    }

    fn node(net: &MemoryNetwork, base: Address, seed: u64, batches: Arc<BatchStore>) -> TestNode {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let signer = Arc::new(Signer::generate(&mut rng));
        let (streamer, incoming) = net.join(base);
        let store = MemStore::new();
        let topology = Arc::new(StaticTopology::new(base));
        let pushsync = PushSync::builder(
            base,
            signer.clone(),
            Arc::new(streamer),
            topology.clone(),
            Arc::new(store.clone()),
            batches,
        )
        .build();
        let router = Router::builder(incoming)
            .accept(PROTOCOL, pushsync.clone())
            .spawn();
        TestNode {
            signer,
            store,
            topology,
            pushsync,
            _router: router,
        }
    }

    fn stamped(stamper: &Stamper, data: &[u8]) -> Chunk {
        let chunk = cac::new(data).unwrap();
        let stamp = stamper.stamp(chunk.address()).unwrap();
        chunk.with_stamp(stamp)
    }

    fn postage() -> (Arc<BatchStore>, Stamper) {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(99);
        test_postage(Arc::new(Signer::generate(&mut rng))).unwrap()
    }

    #[tokio::test]
    async fn closest_peer_stores_and_signs() {
        let (batches, stamper) = postage();
        let chunk = stamped(&stamper, b"push me");
        let net = MemoryNetwork::new();
        let a = node(&net, at_po(chunk.address(), 0), 1, batches.clone());
        let b = node(&net, at_po(chunk.address(), 20), 2, batches);
        a.topology.add_peer(at_po(chunk.address(), 20));

        let receipt = a.pushsync.push_chunk_to_closest(chunk.clone()).await.unwrap();
        assert_eq!(receipt.address, *chunk.address());
        assert_eq!(receipt.signer().unwrap(), b.signer.eth_address());
        assert!(b.store.contains(chunk.address()));
        assert!(a.store.is_empty());
        assert_eq!(a.pushsync.metrics().receipts.get(), 1);
        assert_eq!(b.pushsync.metrics().stored.get(), 1);
    }

    #[tokio::test]
    async fn closest_node_wants_itself() {
        let (batches, stamper) = postage();
        let chunk = stamped(&stamper, b"mine");
        let net = MemoryNetwork::new();
        let a = node(&net, at_po(chunk.address(), 30), 1, batches);
        let err = a.pushsync.push_chunk_to_closest(chunk.clone()).await.unwrap_err();
        assert!(err.is_want_self());

        a.topology.add_peer(at_po(chunk.address(), 2));
        let err = a.pushsync.push_chunk_to_closest(chunk).await.unwrap_err();
        assert!(err.is_want_self());
    }

    #[tokio::test]
    async fn forwards_towards_the_neighbourhood() {
        let (batches, stamper) = postage();
        let chunk = stamped(&stamper, b"far away");
        let net = MemoryNetwork::new();
        let a = node(&net, at_po(chunk.address(), 0), 1, batches.clone());
        let b = node(&net, at_po(chunk.address(), 4), 2, batches.clone());
        let c = node(&net, at_po(chunk.address(), 16), 3, batches);
        a.topology.add_peer(at_po(chunk.address(), 4));
        b.topology.add_peer(at_po(chunk.address(), 0));
        b.topology.add_peer(at_po(chunk.address(), 16));
        // b's neighbourhood is too deep for the chunk
        b.topology.set_depth(8);

        let receipt = a.pushsync.push_chunk_to_closest(chunk.clone()).await.unwrap();
        assert_eq!(receipt.signer().unwrap(), c.signer.eth_address());
        assert!(c.store.contains(chunk.address()));
        assert!(!b.store.contains(chunk.address()));
        assert_eq!(
            net.stream_count(&at_po(chunk.address(), 4), &at_po(chunk.address(), 16), PROTOCOL),
            1
        );
    }

    #[tokio::test]
    async fn invalid_stamps_are_refused() {
        let (batches, _) = postage();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let (_, foreign) = test_postage(Arc::new(Signer::generate(&mut rng))).unwrap();
        let chunk = stamped(&foreign, b"forged");
        let net = MemoryNetwork::new();
        let a = node(&net, at_po(chunk.address(), 0), 1, batches.clone());
        let b = node(&net, at_po(chunk.address(), 20), 2, batches);
        a.topology.add_peer(at_po(chunk.address(), 20));

        let err = a.pushsync.push_chunk_to_closest(chunk.clone()).await.unwrap_err();
        assert!(matches!(err, PushSyncError::Remote { .. }), "{err}");
        assert!(b.store.is_empty());
        assert_eq!(b.pushsync.metrics().invalid_stamps.get(), 1);
    }

    #[tokio::test]
    async fn unstamped_chunks_are_not_pushed() {
        let (batches, _) = postage();
        let net = MemoryNetwork::new();
        let a = node(&net, Address::ZERO, 1, batches);
        let err = a
            .pushsync
            .push_chunk_to_closest(cac::new(b"bare").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PushSyncError::MissingStamp { .. }));
    }
}
