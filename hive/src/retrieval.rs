//! Fetching chunks from the network, and serving them to it.
//!
//! A chunk is requested from the connected peer closest to its address.
//! That peer either has it or forwards the request to a peer closer still,
//! so every hop moves towards the chunk. A node that forwards never asks a
//! peer further away than itself.
//!
//! Concurrent retrievals of the same address share one attempt. Within an
//! attempt a new peer is asked every round tick while earlier requests are
//! still pending, up to [`RetrievalConfig::max_selects`] at once.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures_util::{StreamExt, stream::FuturesUnordered};
use hive_base::{
    Address, Chunk, Stamp, cac, soc,
    storage::{ModeGet, ModePut, Storer},
};
use hive_postage::ValidStamp;
use n0_future::boxed::BoxFuture;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    accounting::{Accounting, AccountingError, Pricer},
    config::RetrievalConfig,
    metrics::RetrievalMetrics,
    p2p::{AcceptError, ProtocolHandler, Stream, Streamer},
    singleflight::SingleFlight,
    topology::{ClosestPeerer, TopologyError},
};

/// Protocol name of retrieval.
pub const PROTOCOL: &str = "retrieval/1.2.0";

/// Errors from retrieval.
///
/// Shared between all callers waiting on the same retrieval, hence `Clone`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum RetrievalError {
    #[snafu(display("chunk {address} not found"))]
    NotFound { address: Address },
    #[snafu(display("peer {peer} delivered an invalid chunk {address}"))]
    InvalidChunk { address: Address, peer: Address },
    #[snafu(display("peer {peer} did not deliver in time"))]
    Timeout { peer: Address },
    #[snafu(display("request to {peer} failed: {message}"))]
    Peer { peer: Address, message: String },
    #[snafu(display("local store: {message}"))]
    Store { message: String },
    #[snafu(display("retrieval cancelled"))]
    Cancelled,
    #[snafu(display("retrieval closed"))]
    Closed,
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    address: Address,
}

#[derive(Debug, Serialize, Deserialize)]
struct Delivery {
    data: Bytes,
    /// Serialized stamp, empty if the chunk has none.
    stamp: Bytes,
}

/// Peers not to ask again during one retrieval.
///
/// Peers that were asked are skipped for good, peers we could not pay are
/// skipped until [`SkipPeers::reset_overdraft`].
#[derive(Debug, Default)]
struct SkipPeers {
    inner: Mutex<SkipInner>,
}

#[derive(Debug, Default)]
struct SkipInner {
    permanent: HashSet<Address>,
    overdraft: HashSet<Address>,
}

impl SkipPeers {
    fn add(&self, peer: Address) {
        self.inner.lock().expect("poisoned").permanent.insert(peer);
    }

    fn add_overdraft(&self, peer: Address) {
        self.inner.lock().expect("poisoned").overdraft.insert(peer);
    }

    fn has_overdraft(&self) -> bool {
        !self.inner.lock().expect("poisoned").overdraft.is_empty()
    }

    fn reset_overdraft(&self) {
        self.inner.lock().expect("poisoned").overdraft.clear();
    }

    fn all(&self) -> Vec<Address> {
        let inner = self.inner.lock().expect("poisoned");
        inner
            .permanent
            .iter()
            .chain(inner.overdraft.iter())
            .copied()
            .collect()
    }
}

/// Retrieves chunks from peers and serves [`PROTOCOL`].
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Retrieval {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    base: Address,
    streamer: Arc<dyn Streamer>,
    topology: Arc<dyn ClosestPeerer>,
    accounting: Arc<dyn Accounting>,
    pricer: Pricer,
    store: Arc<dyn Storer>,
    valid_stamp: Arc<dyn ValidStamp>,
    config: RetrievalConfig,
    #[debug(skip)]
    flights: SingleFlight<String, Result<Chunk, RetrievalError>>,
    cancel: CancellationToken,
    metrics: Arc<RetrievalMetrics>,
}

/// Builder for [`Retrieval`].
#[derive(derive_more::Debug)]
pub struct Builder {
    base: Address,
    streamer: Arc<dyn Streamer>,
    topology: Arc<dyn ClosestPeerer>,
    store: Arc<dyn Storer>,
    valid_stamp: Arc<dyn ValidStamp>,
    accounting: Option<Arc<dyn Accounting>>,
    pricer: Option<Pricer>,
    config: RetrievalConfig,
    metrics: Option<Arc<RetrievalMetrics>>,
}

impl Builder {
    /// Sets the accounting. Defaults to [`crate::accounting::NoAccounting`].
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
    pub fn config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares metrics with other components.
    pub fn metrics(mut self, metrics: Arc<RetrievalMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the service.
    pub fn build(self) -> Retrieval {
        Retrieval {
            inner: Arc::new(Inner {
                pricer: self
                    .pricer
                    .unwrap_or_else(|| Pricer::new(self.base, crate::accounting::DEFAULT_BASE_PRICE)),
                base: self.base,
                streamer: self.streamer,
                topology: self.topology,
                accounting: self
                    .accounting
                    .unwrap_or_else(|| Arc::new(crate::accounting::NoAccounting)),
                store: self.store,
                valid_stamp: self.valid_stamp,
                config: self.config,
                flights: SingleFlight::default(),
                cancel: CancellationToken::new(),
                metrics: self.metrics.unwrap_or_default(),
            }),
        }
    }
}

impl Retrieval {
    /// Creates a builder.
    ///
    /// `store` serves incoming requests and caches forwarded chunks,
    /// `valid_stamp` decides how cached chunks are stored.
    pub fn builder(
        base: Address,
        streamer: Arc<dyn Streamer>,
        topology: Arc<dyn ClosestPeerer>,
        store: Arc<dyn Storer>,
        valid_stamp: Arc<dyn ValidStamp>,
    ) -> Builder {
        Builder {
            base,
            streamer,
            topology,
            store,
            valid_stamp,
            accounting: None,
            pricer: None,
            config: RetrievalConfig::default(),
            metrics: None,
        }
    }

    /// Metrics of this service.
    pub fn metrics(&self) -> &Arc<RetrievalMetrics> {
        &self.inner.metrics
    }

    /// Retrieves `address` from the network.
    ///
    /// `source` is the peer that asked us for the chunk, [`Address::ZERO`]
    /// if we want it ourselves.
    pub async fn retrieve_chunk(&self, address: Address, source: Address) -> Result<Chunk, RetrievalError> {
        if self.inner.cancel.is_cancelled() {
            return ClosedSnafu.fail();
        }
        let origin = source.is_zero();
        let key = if origin {
            format!("{address}_origin")
        } else {
            address.to_string()
        };
        let this = self.clone();
        let fut = async move { this.retrieve(address, source, origin).await }
            .instrument(debug_span!("retrieve", chunk = %address.fmt_short(), origin));
        let (res, shared) = self.inner.flights.run(key, fut).await;
        if shared {
            self.inner.metrics.singleflight_shared.inc();
        }
        res
    }

    /// Cancels retrievals in flight and refuses new ones.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    async fn retrieve(&self, address: Address, source: Address, origin: bool) -> Result<Chunk, RetrievalError> {
        let config = &self.inner.config;
        let skip = SkipPeers::default();
        if !origin {
            skip.add(source);
        }
        let mut inflight = FuturesUnordered::new();
        let mut tick = tokio::time::interval(config.round_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.reset();
        let mut rounds = 0;
        let mut select_next = true;
        let mut last_err = RetrievalError::NotFound { address };

        loop {
            if select_next && inflight.len() < config.max_selects && rounds < config.max_request_rounds {
                select_next = false;
                rounds += 1;
                match self.closest_peer(&address, &skip, origin) {
                    Ok(peer) => {
                        let price = self.inner.pricer.peer_price(&peer, &address);
                        match self.inner.accounting.prepare_credit(peer, price, origin) {
                            Ok(credit) => {
                                skip.add(peer);
                                self.inner.metrics.peer_requests.inc();
                                let this = self.clone();
                                inflight.push(async move {
                                    let res = tokio::time::timeout(
                                        this.inner.config.attempt_timeout,
                                        this.request(peer, address),
                                    )
                                    .await
                                    .unwrap_or_else(|_| TimeoutSnafu { peer }.fail());
                                    if res.is_ok() {
                                        credit.apply();
                                    }
                                    res
                                });
                            }
                            Err(AccountingError::Overdraft { .. }) => {
                                trace!(peer = %peer.fmt_short(), "overdraft, skipping for this round");
                                skip.add_overdraft(peer);
                                select_next = true;
                                continue;
                            }
                        }
                    }
                    Err(_) if skip.has_overdraft() && inflight.is_empty() => {
                        tokio::select! {
                            _ = self.inner.cancel.cancelled() => return CancelledSnafu.fail(),
                            _ = tokio::time::sleep(config.round_cooldown) => {}
                        }
                        skip.reset_overdraft();
                        select_next = true;
                        continue;
                    }
                    Err(_) => {
                        if inflight.is_empty() {
                            debug!("no peer left to ask");
                            self.inner.metrics.errors.inc();
                            return Err(last_err);
                        }
                    }
                }
            }
            if inflight.is_empty() {
                if rounds >= config.max_request_rounds {
                    self.inner.metrics.errors.inc();
                    return Err(last_err);
                }
                select_next = true;
                continue;
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return CancelledSnafu.fail(),
                Some(res) = inflight.next() => match res {
                    Ok(chunk) => {
                        self.inner.metrics.retrieved.inc();
                        return Ok(chunk);
                    }
                    Err(err) => {
                        debug!("attempt failed: {err}");
                        self.inner.metrics.peer_request_failures.inc();
                        last_err = err;
                        select_next = true;
                    }
                },
                _ = tick.tick() => select_next = true,
            }
        }
    }

    /// The peer to ask next. Forwarding nodes only ask peers closer to the
    /// chunk than themselves.
    fn closest_peer(&self, address: &Address, skip: &SkipPeers, origin: bool) -> Result<Address, TopologyError> {
        let peer = self
            .inner
            .topology
            .closest_peer(address, false, &skip.all())?;
        if !origin && !address.is_closer(&peer, &self.inner.base) {
            return Err(TopologyError::NotFound);
        }
        Ok(peer)
    }

    async fn request(&self, peer: Address, address: Address) -> Result<Chunk, RetrievalError> {
        let peer_err = |err: crate::p2p::StreamError| RetrievalError::Peer {
            peer,
            message: err.to_string(),
        };
        let mut stream = self
            .inner
            .streamer
            .new_stream(peer, PROTOCOL)
            .await
            .map_err(peer_err)?;
        stream.write(&Request { address }).await.map_err(peer_err)?;
        let delivery: Delivery = stream.read().await.map_err(peer_err)?;
        let mut chunk = Chunk::new(address, delivery.data);
        if !(cac::valid(&chunk) || soc::valid(&chunk)) {
            self.inner.metrics.invalid_chunks.inc();
            return InvalidChunkSnafu { address, peer }.fail();
        }
        if !delivery.stamp.is_empty() {
            let stamp = Stamp::from_bytes(&delivery.stamp).map_err(|err| RetrievalError::Peer {
                peer,
                message: err.to_string(),
            })?;
            chunk = chunk.with_stamp(stamp);
        }
        trace!(peer = %peer.fmt_short(), "retrieved");
        Ok(chunk)
    }

    /// Serves one request from `stream`.
    async fn handle(&self, mut stream: Stream) -> Result<(), RetrievalError> {
        let peer = *stream.peer();
        let stream_err = |err: crate::p2p::StreamError| RetrievalError::Peer {
            peer,
            message: err.to_string(),
        };
        let Request { address } = stream.read().await.map_err(stream_err)?;
        self.inner.metrics.served.inc();
        let (chunk, forwarded) = match self.inner.store.get(ModeGet::Request, address).await {
            Ok(chunk) => (chunk, false),
            Err(err) if err.is_not_found() => {
                self.inner.metrics.forwarded.inc();
                (self.retrieve_chunk(address, peer).await?, true)
            }
            Err(err) => {
                return StoreSnafu {
                    message: err.to_string(),
                }
                .fail();
            }
        };
        let price = self.inner.pricer.price(&address);
        let debit = self
            .inner
            .accounting
            .prepare_debit(peer, price)
            .map_err(|err| RetrievalError::Peer {
                peer,
                message: err.to_string(),
            })?;
        let delivery = Delivery {
            data: chunk.data().clone(),
            stamp: chunk
                .stamp()
                .map(|s| Bytes::copy_from_slice(&s.to_bytes()))
                .unwrap_or_default(),
        };
        stream.write(&delivery).await.map_err(stream_err)?;
        debit.apply();

        if forwarded && self.inner.config.caching {
            let mode = cache_mode(self.inner.valid_stamp.as_ref(), &chunk);
            if let Err(err) = self.inner.store.put(mode, vec![chunk]).await {
                warn!(chunk = %address.fmt_short(), "caching forwarded chunk failed: {err}");
            }
        }
        Ok(())
    }
}

/// The mode a retrieved chunk is stored with: [`ModePut::Request`] if its
/// stamp is valid, else it is forced into the cache.
pub(crate) fn cache_mode(valid_stamp: &dyn ValidStamp, chunk: &Chunk) -> ModePut {
    let valid = chunk.stamp().is_some_and(|stamp| {
        valid_stamp
            .valid_stamp(chunk.clone(), &stamp.to_bytes())
            .is_ok()
    });
    if valid {
        ModePut::Request
    } else {
        ModePut::RequestCache
    }
}

impl ProtocolHandler for Retrieval {
    fn accept(&self, stream: Stream) -> BoxFuture<Result<(), AcceptError>> {
        let this = self.clone();
        Box::pin(async move { this.handle(stream).await.map_err(AcceptError::from_err) })
    }

    fn shutdown(&self) -> BoxFuture<()> {
        let this = self.clone();
        Box::pin(async move { this.close() })
    }
}
