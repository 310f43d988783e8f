use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked for the local store
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "localstore")]
pub struct Metrics {
    /// Chunks written by a put, excluding ones already present.
    pub puts: Counter,
    /// Puts of chunks that were already present.
    pub puts_existing: Counter,
    /// Puts rejected because a newer chunk holds the stamp slot.
    pub puts_overwrite_rejected: Counter,
    /// Successful gets.
    pub gets: Counter,
    /// Gets served from the in memory cache.
    pub gets_lru: Counter,
    /// Gets for chunks that are not stored.
    pub gets_not_found: Counter,
    /// Garbage collection passes.
    pub gc_runs: Counter,
    /// Chunks evicted by garbage collection.
    pub gc_evictions: Counter,
    /// Chunks moved out of the reserve by unreserve.
    pub reserve_evictions: Counter,
    /// Pin counter increments.
    pub pins: Counter,
    /// Pin counter decrements.
    pub unpins: Counter,
}
