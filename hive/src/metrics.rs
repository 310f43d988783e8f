//! Metrics of the node protocols.

use std::sync::Arc;

use iroh_metrics::{Counter, MetricsGroup, MetricsGroupSet};

/// Metrics tracked for retrieval
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "retrieval")]
pub struct RetrievalMetrics {
    /// Requests sent to peers.
    pub peer_requests: Counter,
    /// Requests to peers that failed.
    pub peer_request_failures: Counter,
    /// Chunks retrieved from peers.
    pub retrieved: Counter,
    /// Retrievals that failed after trying every candidate.
    pub errors: Counter,
    /// Chunks from peers that failed validation.
    pub invalid_chunks: Counter,
    /// Retrievals that joined one already in flight.
    pub singleflight_shared: Counter,
    /// Requests served to peers.
    pub served: Counter,
    /// Served requests forwarded to another peer.
    pub forwarded: Counter,
}

/// Metrics tracked for push sync
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "pushsync")]
pub struct PushSyncMetrics {
    /// Chunks pushed to peers.
    pub pushed: Counter,
    /// Receipts received.
    pub receipts: Counter,
    /// Receipts that failed validation.
    pub invalid_receipts: Counter,
    /// Pushes that failed.
    pub push_failures: Counter,
    /// Chunks stored as the closest node.
    pub stored: Counter,
    /// Incoming pushes that failed.
    pub handler_errors: Counter,
    /// Incoming chunks with an invalid stamp.
    pub invalid_stamps: Counter,
}

/// Metrics tracked for the network store
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "netstore")]
pub struct NetStoreMetrics {
    /// Gets served by the local store.
    pub local_hits: Counter,
    /// Local chunks that failed validation.
    pub local_invalid: Counter,
    /// Gets served from the in memory cache.
    pub cache_hits: Counter,
    /// Gets that went to the network.
    pub network_fetches: Counter,
    /// Background puts of retrieved chunks that failed.
    pub bg_put_failures: Counter,
    /// Background puts dropped because the put limit was reached.
    pub bg_put_dropped: Counter,
}

/// Metrics tracked for the depth monitor
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "depthmonitor")]
pub struct DepthMonitorMetrics {
    /// Monitor rounds.
    pub rounds: Counter,
    /// Storage radius decrements.
    pub radius_decrements: Counter,
}

/// All metrics of a node.
#[derive(Debug, Default, Clone, MetricsGroupSet)]
#[metrics(name = "hive")]
pub struct NodeMetrics {
    /// Metrics of the local store.
    pub localstore: Arc<hive_store::metrics::Metrics>,
    /// Metrics of retrieval.
    pub retrieval: Arc<RetrievalMetrics>,
    /// Metrics of push sync.
    pub pushsync: Arc<PushSyncMetrics>,
    /// Metrics of the network store.
    pub netstore: Arc<NetStoreMetrics>,
    /// Metrics of the depth monitor.
    pub depthmonitor: Arc<DepthMonitorMetrics>,
}
