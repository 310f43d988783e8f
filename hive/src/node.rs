//! Node API
//!
//! A node owns a local store and serves the retrieval and push sync
//! protocols to its peers. Content is added with [`Node::upload`] and read
//! back, from the network if needed, with [`Node::download`].
//!
//! The transport is injected: a [`Streamer`] opening streams to peers and
//! the receiving end of the streams peers open to us. The same goes for
//! the [`Topology`] deciding which peers are closest to an address.
//!
//! To shut down the node, call [`Node::shutdown`].

use std::sync::Arc;

use bytes::Bytes;
use hive_base::{
    Address, BatchId, Signer, StateStore,
    crypto::overlay_address,
    state::StateStoreError,
    storage::{ModePut, ModeSet, StorageError},
};
use hive_postage::{
    BatchStore, PostageError, PostageService, Stamper, ValidStamp,
    events::{BatchService, EventFeed},
};
use hive_store::{LocalStore, LocalStoreError, Tags};
use n0_future::task::AbortOnDropHandle;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::{io::AsyncRead, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::{
    accounting::{Accounting, Bookkeeper, Pricer},
    blocklist::Blocklist,
    config::NodeConfig,
    depthmonitor::DepthMonitor,
    file::{JoinError, Joiner, Pipeline, PipelineError, Reference, feed_pipeline},
    metrics::NodeMetrics,
    netstore::{NetStore, NetStoreError},
    p2p::{BlocklistLimit, Incoming, Router, Streamer},
    pss::Pss,
    pusher::Pusher,
    pushsync::{self, PushSync},
    retrieval::{self, Retrieval},
    topology::{ClosestPeerer, Topology},
    traversal::{TraversalError, Traverser},
    warden::Warden,
};

/// Label of upload tags created by [`Node::upload`].
const UPLOAD_TAG: &str = "upload";

/// Errors from the node.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum NodeError {
    #[snafu(display("no transport configured"))]
    NoTransport {},
    #[snafu(display("no topology configured"))]
    NoTopology {},
    #[snafu(transparent)]
    State { source: StateStoreError },
    #[snafu(transparent)]
    Postage { source: PostageError },
    #[snafu(transparent)]
    LocalStore { source: LocalStoreError },
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Pipeline { source: PipelineError },
    #[snafu(transparent)]
    Join { source: JoinError },
    #[snafu(transparent)]
    Traversal { source: TraversalError },
    #[snafu(transparent)]
    NetStore { source: NetStoreError },
}

/// Builder for the [`Node`].
///
/// A transport and a topology must be supplied, everything else is
/// optional. Create and run the node by calling [`Builder::spawn`].
#[derive(derive_more::Debug)]
pub struct Builder {
    config: NodeConfig,
    signer: Arc<Signer>,
    nonce: [u8; 32],
    streamer: Option<Arc<dyn Streamer>>,
    incoming: Option<mpsc::Receiver<Incoming>>,
    #[debug("Topology")]
    topology: Option<(Arc<dyn Topology>, Arc<dyn ClosestPeerer>)>,
    event_feed: Option<Arc<dyn EventFeed>>,
}

impl Builder {
    /// Sets the nonce the overlay address is derived from.
    pub fn nonce(mut self, nonce: [u8; 32]) -> Self {
        self.nonce = nonce;
        self
    }

    /// Sets the transport: `streamer` opens streams to peers, `incoming`
    /// yields the streams peers open to this node.
    pub fn transport(mut self, streamer: Arc<dyn Streamer>, incoming: mpsc::Receiver<Incoming>) -> Self {
        self.streamer = Some(streamer);
        self.incoming = Some(incoming);
        self
    }

    /// Sets the view of the connected peers.
    pub fn topology<T: Topology>(mut self, topology: Arc<T>) -> Self {
        let full: Arc<dyn Topology> = topology.clone();
        let closest: Arc<dyn ClosestPeerer> = topology;
        self.topology = Some((full, closest));
        self
    }

    /// Applies chain events from `feed` when the chain is enabled.
    pub fn event_feed(mut self, feed: Arc<dyn EventFeed>) -> Self {
        self.event_feed = Some(feed);
        self
    }

    /// The overlay address the node will have.
    pub fn overlay(&self) -> Address {
        overlay_address(&self.signer.eth_address(), self.config.network_id, &self.nonce)
    }

    /// Opens the stores and starts every service.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn spawn(self) -> Result<Node, NodeError> {
        let base = self.overlay();
        let Builder {
            config,
            signer,
            streamer,
            incoming,
            topology,
            event_feed,
            ..
        } = self;
        let (Some(streamer), Some(incoming)) = (streamer, incoming) else {
            return NoTransportSnafu.fail();
        };
        let Some((topology, closest)) = topology else {
            return NoTopologySnafu.fail();
        };
        let metrics = NodeMetrics::default();
        let cancel = CancellationToken::new();

        let state = match config.state_path() {
            Some(path) => StateStore::persistent(path)?,
            None => StateStore::in_memory()?,
        };
        let localstore_config = config.localstore_config();
        let batch_store = BatchStore::new(state.clone(), localstore_config.reserve_capacity)?;
        let postage = PostageService::new(
            state.clone(),
            batch_store.clone(),
            signer.eth_address(),
            config.chain_id,
        )?;
        let tags = Tags::new(state.clone())?;
        let blocklist = Blocklist::new(state.clone());

        let localstore = LocalStore::builder(base)
            .config(localstore_config.clone())
            .batch_store(batch_store.clone())
            .tags(tags.clone())
            .metrics(metrics.localstore.clone())
            .open()
            .await?;
        batch_store.set_unreserve_fn(localstore.unreserve_fn());
        batch_store.set_radius_fn({
            let localstore = localstore.clone();
            Arc::new(move |radius| localstore.set_radius(radius))
        });

        let valid_stamp: Arc<dyn ValidStamp> = Arc::new(batch_store.clone());
        let accounting: Arc<dyn Accounting> = Arc::new(Bookkeeper::new(config.accounting.clone()));
        let pricer = Pricer::new(base, config.base_price);

        let retrieval = Retrieval::builder(
            base,
            streamer.clone(),
            closest,
            Arc::new(localstore.clone()),
            valid_stamp.clone(),
        )
        .accounting(accounting.clone())
        .pricer(pricer.clone())
        .config(config.retrieval.clone())
        .metrics(metrics.retrieval.clone())
        .build();
        let netstore = NetStore::new(
            Arc::new(localstore.clone()),
            retrieval.clone(),
            valid_stamp.clone(),
            false,
            localstore_config.lru_capacity,
            metrics.netstore.clone(),
        );
        let pushsync = PushSync::builder(
            base,
            signer.clone(),
            streamer,
            topology,
            Arc::new(localstore.clone()),
            valid_stamp,
        )
        .accounting(accounting)
        .pricer(pricer)
        .config(config.pushsync.clone())
        .metrics(metrics.pushsync.clone())
        .build();
        let pss = Pss::new(signer.clone(), pushsync.clone());
        let pusher = Pusher::spawn(localstore.clone(), pushsync.clone(), config.pushsync.clone());

        // radius changes reach the local store through the batch store
        let depth_monitor = DepthMonitor::new(
            Arc::new(localstore.clone()),
            Arc::new(batch_store.clone()),
            config.depthmonitor.clone(),
            None,
            metrics.depthmonitor.clone(),
        );
        let mut tasks = vec![depth_monitor.spawn(cancel.child_token())];

        match (config.chain_enabled, event_feed) {
            (true, Some(feed)) => {
                let service = BatchService::new(state.clone(), batch_store.clone(), postage.clone());
                let from = service.start(0)?;
                let task = tokio::spawn(
                    service
                        .run(feed.subscribe(from), cancel.child_token())
                        .instrument(info_span!("batchservice")),
                );
                tasks.push(AbortOnDropHandle::new(task));
            }
            (true, None) => warn!("chain enabled without an event feed, batches stay as they are"),
            (false, _) => debug!("chain disabled"),
        }

        let router = Router::builder(incoming)
            .accept(
                retrieval::PROTOCOL,
                BlocklistLimit::new(retrieval.clone(), blocklist.clone()),
            )
            .accept(
                pushsync::PROTOCOL,
                BlocklistLimit::new(pushsync.clone(), blocklist.clone()),
            )
            .spawn();

        info!(base = %base.fmt_short(), "node started");
        Ok(Node {
            inner: Arc::new(NodeInner {
                base,
                signer,
                config,
                state,
                batch_store,
                postage,
                tags,
                blocklist,
                localstore,
                retrieval,
                netstore,
                pushsync,
                pss,
                pusher,
                depth_monitor,
                router,
                cancel,
                tasks: std::sync::Mutex::new(tasks),
                metrics,
            }),
        })
    }
}

/// A running node.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(derive_more::Debug)]
struct NodeInner {
    base: Address,
    signer: Arc<Signer>,
    config: NodeConfig,
    #[debug(skip)]
    state: StateStore,
    batch_store: BatchStore,
    postage: PostageService,
    #[debug(skip)]
    tags: Tags,
    blocklist: Blocklist,
    localstore: LocalStore,
    retrieval: Retrieval,
    netstore: NetStore,
    pushsync: PushSync,
    pss: Pss,
    pusher: Pusher,
    depth_monitor: DepthMonitor,
    router: Router,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<AbortOnDropHandle<()>>>,
    metrics: NodeMetrics,
}

impl Node {
    /// Creates a builder for a node signing with `signer`.
    pub fn builder(config: NodeConfig, signer: Arc<Signer>) -> Builder {
        Builder {
            config,
            signer,
            nonce: [0; 32],
            streamer: None,
            incoming: None,
            topology: None,
            event_feed: None,
        }
    }

    /// The overlay address.
    pub fn base(&self) -> &Address {
        &self.inner.base
    }

    /// The node key.
    pub fn signer(&self) -> &Arc<Signer> {
        &self.inner.signer
    }

    /// The configuration the node was started with.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// The local store.
    pub fn localstore(&self) -> &LocalStore {
        &self.inner.localstore
    }

    /// The local store backed by the network.
    pub fn netstore(&self) -> &NetStore {
        &self.inner.netstore
    }

    /// The retrieval service.
    pub fn retrieval(&self) -> &Retrieval {
        &self.inner.retrieval
    }

    /// The push sync service.
    pub fn pushsync(&self) -> &PushSync {
        &self.inner.pushsync
    }

    /// Anonymous messaging.
    pub fn pss(&self) -> &Pss {
        &self.inner.pss
    }

    /// The stamp issuers of the batches this node owns.
    pub fn postage(&self) -> &PostageService {
        &self.inner.postage
    }

    /// Every batch known on chain.
    pub fn batch_store(&self) -> &BatchStore {
        &self.inner.batch_store
    }

    /// Upload tags.
    pub fn tags(&self) -> &Tags {
        &self.inner.tags
    }

    /// Peers refused by the protocols.
    pub fn blocklist(&self) -> &Blocklist {
        &self.inner.blocklist
    }

    /// The storage radius controller.
    pub fn depth_monitor(&self) -> &DepthMonitor {
        &self.inner.depth_monitor
    }

    /// The node wide state store.
    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    /// Metrics of every component.
    pub fn metrics(&self) -> &NodeMetrics {
        &self.inner.metrics
    }

    /// Re-uploading and retrievability checks for content.
    pub fn warden(&self) -> Warden {
        Warden::new(
            Arc::new(self.inner.localstore.clone()),
            self.inner.pushsync.clone(),
            self.inner.retrieval.clone(),
        )
    }

    /// A stamper issuing from the owned batch `batch`.
    pub fn stamper(&self, batch: &BatchId) -> Result<Stamper, NodeError> {
        let issuer = self.inner.postage.get_stamp_issuer(batch)?;
        Ok(Stamper::new(issuer, self.inner.signer.clone()))
    }

    /// Splits `data` into chunks stamped with `batch` and stores them for
    /// push sync. Returns the root reference.
    #[instrument(skip_all, fields(batch = %batch))]
    pub async fn upload(
        &self,
        data: impl AsyncRead + Unpin,
        batch: &BatchId,
        encrypt: bool,
        pin: bool,
    ) -> Result<Reference, NodeError> {
        let stamper = self.stamper(batch)?;
        let tag = self.inner.tags.create(UPLOAD_TAG, 0);
        let mode = if pin {
            ModePut::UploadPin
        } else {
            ModePut::Upload
        };
        let pipeline = Pipeline::builder(Arc::new(self.inner.localstore.clone()))
            .stamper(stamper)
            .encrypt(encrypt)
            .mode(mode)
            .tag(tag.clone())
            .build();
        let reference = feed_pipeline(pipeline, data).await?;
        tag.set_address(*reference.address());
        if let Err(err) = self.inner.tags.persist(tag.uid()) {
            warn!("failed to persist upload tag: {err}");
        }
        debug!(root = %reference.address().fmt_short(), encrypt, pin, "uploaded");
        Ok(reference)
    }

    /// Reads the content under `reference`, fetching missing chunks from
    /// the network.
    #[instrument(skip_all, fields(root = %reference.address().fmt_short()))]
    pub async fn download(&self, reference: Reference) -> Result<Bytes, NodeError> {
        let joiner = Joiner::new(Arc::new(self.inner.netstore.clone()), reference).await?;
        Ok(joiner.read_all().await?)
    }

    /// Pins every chunk of the content under `reference`, fetching missing
    /// ones from the network.
    pub async fn pin_root(&self, reference: Reference) -> Result<(), NodeError> {
        let addresses = Traverser::new(Arc::new(self.inner.netstore.clone()))
            .addresses(reference)
            .await?;
        self.inner.localstore.set(ModeSet::Pin, addresses).await?;
        Ok(())
    }

    /// Removes one pin from every chunk of the content under `reference`.
    pub async fn unpin_root(&self, reference: Reference) -> Result<(), NodeError> {
        let addresses = Traverser::new(Arc::new(self.inner.localstore.clone()))
            .addresses(reference)
            .await?;
        self.inner.localstore.set(ModeSet::Unpin, addresses).await?;
        Ok(())
    }

    /// Stops every service and closes the stores.
    ///
    /// Incoming streams are refused first, then the background tasks are
    /// cancelled and given a bounded time to drain.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let inner = &self.inner;
        inner.router.shutdown().await;
        inner.pusher.shutdown().await;
        inner.pss.shutdown().await;
        inner.cancel.cancel();
        let tasks = std::mem::take(&mut *inner.tasks.lock().expect("poisoned"));
        for task in tasks {
            if let Err(err) = task.await {
                warn!("node task failed: {err}");
            }
        }
        let netstore = inner.netstore.close().await;
        inner.retrieval.close();
        inner.pushsync.close();
        if let Err(err) = inner.postage.close() {
            warn!("failed to persist stamp issuers: {err}");
        }
        if let Err(err) = inner.tags.persist_all() {
            warn!("failed to persist upload tags: {err}");
        }
        inner.localstore.close().await?;
        netstore?;
        info!(base = %inner.base.fmt_short(), "node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hive_postage::{Batch, ChainState, StampIssuer};
    use rand::SeedableRng;

    use super::*;
    use crate::{test_utils::MemoryNetwork, topology::StaticTopology};

    const BATCH: BatchId = BatchId::new([3; 32]);

    async fn node(seed: u64, config: NodeConfig) -> Node {
        let signer = Arc::new(Signer::generate(&mut rand_chacha::ChaCha8Rng::seed_from_u64(seed)));
        let net = MemoryNetwork::new();
        let builder = Node::builder(config, signer.clone());
        let base = builder.overlay();
        let (streamer, incoming) = net.join(base);
        let node = builder
            .transport(Arc::new(streamer), incoming)
            .topology(Arc::new(StaticTopology::new(base)))
            .spawn()
            .await
            .unwrap();
        // a reopened node already knows the batch
        if !node.batch_store().exists(&BATCH).unwrap() {
            node.batch_store()
                .save(&Batch {
                    id: BATCH,
                    owner: signer.eth_address(),
                    value: 1_000_000,
                    start: 0,
                    depth: 16,
                    bucket_depth: 8,
                    immutable: false,
                })
                .unwrap();
        }
        node.batch_store()
            .put_chain_state(ChainState {
                block: 100,
                ..Default::default()
            })
            .unwrap();
        node.postage()
            .add(StampIssuer::new("test", "", BATCH, 1_000_000, 16, 8, 0, false))
            .unwrap();
        node
    }

    #[tokio::test]
    async fn upload_download_pin() {
        let node = node(1, NodeConfig::memory()).await;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let reference = node.upload(&data[..], &BATCH, false, false).await.unwrap();
        assert_eq!(&node.download(reference).await.unwrap()[..], &data[..]);

        node.pin_root(reference).await.unwrap();
        assert_eq!(node.localstore().pin_counter(reference.address()).unwrap(), 1);
        node.unpin_root(reference).await.unwrap();
        assert_eq!(node.localstore().pin_counter(reference.address()).unwrap_or(0), 0);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn encrypted_upload() {
        let node = node(2, NodeConfig::memory()).await;
        let data = vec![9u8; 5000];
        let reference = node.upload(&data[..], &BATCH, true, true).await.unwrap();
        assert!(reference.is_encrypted());
        assert_eq!(&node.download(reference).await.unwrap()[..], &data[..]);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_batch_is_refused() {
        let node = node(3, NodeConfig::memory()).await;
        let err = node
            .upload(&b"x"[..], &BatchId::new([4; 32]), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Postage { .. }));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn persistent_node_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..NodeConfig::memory()
        };
        let reference = {
            let node = node(4, config.clone()).await;
            let reference = node.upload(&b"persisted"[..], &BATCH, false, true).await.unwrap();
            node.shutdown().await.unwrap();
            reference
        };
        let node = node(4, config).await;
        assert_eq!(&node.download(reference).await.unwrap()[..], b"persisted");
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn localstore_follows_batch_store_radius() {
        let mut config = NodeConfig::memory();
        config.localstore.reserve_capacity = 100;
        let node = node(6, config).await;
        // a depth 16 batch over a reserve of 100 chunks
        assert_eq!(node.batch_store().reserve_state().storage_radius, 10);
        assert_eq!(node.localstore().radius(), 10);

        node.batch_store().set_storage_radius(12).unwrap();
        assert_eq!(node.localstore().radius(), 12);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn needs_transport() {
        let signer = Arc::new(Signer::generate(&mut rand_chacha::ChaCha8Rng::seed_from_u64(5)));
        let err = Node::builder(NodeConfig::memory(), signer)
            .spawn()
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NoTransport { .. }));
    }
}
