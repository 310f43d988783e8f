//! Lowers the storage radius when the reserve stays underused.
//!
//! A node stores the chunks within its storage radius. When the reserve
//! keeps being less than [`DepthMonitorConfig::utilization_threshold`] full
//! and nothing is being synced, the radius is too deep for the node's share
//! of the network, so the monitor lowers it by one after every
//! [`DepthMonitorConfig::adaptation_window`]. Other components may only
//! raise it, see [`DepthMonitor::set_storage_radius`].

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use hive_base::storage::StorageError;
use hive_postage::{BatchStore, PostageError};
use hive_store::LocalStore;
use n0_future::task::AbortOnDropHandle;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{config::DepthMonitorConfig, metrics::DepthMonitorMetrics};

/// Errors from the depth monitor.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DepthMonitorError {
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Postage { source: PostageError },
}

/// Reports how full the reserve is and how fast it is filled by sync.
pub trait ReserveReporter: Send + Sync + Debug + 'static {
    /// Chunks in the reserve.
    fn reserve_size(&self) -> Result<u64, StorageError>;
    /// Chunks the reserve may hold.
    fn reserve_capacity(&self) -> u64;
    /// Chunks stored by sync per second, recently.
    fn sync_rate(&self) -> f64;
}

impl ReserveReporter for LocalStore {
    fn reserve_size(&self) -> Result<u64, StorageError> {
        LocalStore::reserve_size(self)
    }

    fn reserve_capacity(&self) -> u64 {
        self.config().reserve_capacity
    }

    fn sync_rate(&self) -> f64 {
        LocalStore::sync_rate(self)
    }
}

/// Persists the storage radius.
pub trait RadiusStore: Send + Sync + Debug + 'static {
    /// The current storage radius.
    fn storage_radius(&self) -> u8;
    /// Persists a new storage radius.
    fn set_storage_radius(&self, radius: u8) -> Result<(), PostageError>;
}

impl RadiusStore for BatchStore {
    fn storage_radius(&self) -> u8 {
        self.reserve_state().storage_radius
    }

    fn set_storage_radius(&self, radius: u8) -> Result<(), PostageError> {
        BatchStore::set_storage_radius(self, radius)
    }
}

/// Called with the new radius whenever it changes.
pub type RadiusHook = Arc<dyn Fn(u8) + Send + Sync>;

/// Watches reserve utilization and adapts the storage radius.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct DepthMonitor {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    reserve: Arc<dyn ReserveReporter>,
    radius: Arc<dyn RadiusStore>,
    config: DepthMonitorConfig,
    started: Instant,
    /// Start of the current stretch of low utilization. Also serializes
    /// radius changes.
    low_since: Mutex<Option<Instant>>,
    #[debug(skip)]
    on_change: Option<RadiusHook>,
    metrics: Arc<DepthMonitorMetrics>,
}

impl DepthMonitor {
    /// Creates a monitor. The warmup starts now.
    pub fn new(
        reserve: Arc<dyn ReserveReporter>,
        radius: Arc<dyn RadiusStore>,
        config: DepthMonitorConfig,
        on_change: Option<RadiusHook>,
        metrics: Arc<DepthMonitorMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reserve,
                radius,
                config,
                started: Instant::now(),
                low_since: Mutex::new(None),
                on_change,
                metrics,
            }),
        }
    }

    /// The current storage radius.
    pub fn storage_radius(&self) -> u8 {
        self.inner.radius.storage_radius()
    }

    /// Raises the storage radius to `radius`. Lower values are ignored.
    pub fn set_storage_radius(&self, radius: u8) -> Result<(), PostageError> {
        let mut low_since = self.inner.low_since.lock().expect("poisoned");
        if radius <= self.inner.radius.storage_radius() {
            return Ok(());
        }
        self.inner.radius.set_storage_radius(radius)?;
        *low_since = None;
        drop(low_since);
        info!(radius, "storage radius raised");
        self.notify(radius);
        Ok(())
    }

    /// Runs one round of the monitor at `now`, returning the new radius if
    /// it was lowered.
    pub fn step(&self, now: Instant) -> Result<Option<u8>, DepthMonitorError> {
        let config = &self.inner.config;
        self.inner.metrics.rounds.inc();
        if now.saturating_duration_since(self.inner.started) < config.warmup {
            return Ok(None);
        }
        let size = self.inner.reserve.reserve_size()?;
        let capacity = self.inner.reserve.reserve_capacity().max(1);
        let utilization = size as f64 / capacity as f64;
        let rate = self.inner.reserve.sync_rate();

        let mut low_since = self.inner.low_since.lock().expect("poisoned");
        if utilization >= config.utilization_threshold || rate > 0.0 {
            debug!(utilization, rate, "holding storage radius");
            *low_since = None;
            return Ok(None);
        }
        let since = *low_since.get_or_insert(now);
        if now.saturating_duration_since(since) < config.adaptation_window {
            return Ok(None);
        }
        let current = self.inner.radius.storage_radius();
        if current <= config.minimum_radius {
            return Ok(None);
        }
        let radius = current - 1;
        self.inner.radius.set_storage_radius(radius)?;
        *low_since = Some(now);
        drop(low_since);
        self.inner.metrics.radius_decrements.inc();
        info!(radius, utilization, "storage radius lowered");
        self.notify(radius);
        Ok(Some(radius))
    }

    fn notify(&self, radius: u8) {
        if let Some(f) = &self.inner.on_change {
            f(radius);
        }
    }

    /// Runs the monitor every [`DepthMonitorConfig::wake_interval`] until
    /// `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> AbortOnDropHandle<()> {
        let this = self.clone();
        let task = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(this.inner.config.wake_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.reset();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(err) = this.step(Instant::now()) {
                                warn!("depth monitor round failed: {err}");
                            }
                        }
                    }
                }
                debug!("depth monitor stopped");
            }
            .instrument(info_span!("depthmonitor")),
        );
        AbortOnDropHandle::new(task)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, AtomicU8, Ordering},
        time::Duration,
    };

    use hive_base::StateStore;

    use super::*;

    #[derive(Debug, Default)]
    struct FakeReserve {
        size: AtomicU64,
        rate: Mutex<f64>,
    }

    impl ReserveReporter for FakeReserve {
        fn reserve_size(&self) -> Result<u64, StorageError> {
            Ok(self.size.load(Ordering::Relaxed))
        }

        fn reserve_capacity(&self) -> u64 {
            100
        }

        fn sync_rate(&self) -> f64 {
            *self.rate.lock().unwrap()
        }
    }

    const MIN: Duration = Duration::from_secs(60);

    fn config() -> DepthMonitorConfig {
        DepthMonitorConfig {
            wake_interval: MIN,
            warmup: 10 * MIN,
            adaptation_window: 5 * MIN,
            ..Default::default()
        }
    }

    fn setup(radius: u8) -> (DepthMonitor, Arc<FakeReserve>, Arc<AtomicU8>) {
        let reserve = Arc::new(FakeReserve::default());
        let batches = BatchStore::new(StateStore::in_memory().unwrap(), 100).unwrap();
        batches.set_storage_radius(radius).unwrap();
        let seen = Arc::new(AtomicU8::new(u8::MAX));
        let hook: RadiusHook = {
            let seen = seen.clone();
            Arc::new(move |r| seen.store(r, Ordering::Relaxed))
        };
        let monitor = DepthMonitor::new(
            reserve.clone(),
            Arc::new(batches),
            config(),
            Some(hook),
            Default::default(),
        );
        (monitor, reserve, seen)
    }

    #[test]
    fn lowers_radius_after_window() {
        let (monitor, reserve, seen) = setup(3);
        let start = Instant::now();
        reserve.size.store(10, Ordering::Relaxed);

        // still warming up
        assert_eq!(monitor.step(start + 5 * MIN).unwrap(), None);
        // low utilization starts the window
        assert_eq!(monitor.step(start + 10 * MIN).unwrap(), None);
        assert_eq!(monitor.step(start + 14 * MIN).unwrap(), None);
        assert_eq!(monitor.step(start + 15 * MIN).unwrap(), Some(2));
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        // the window restarts after each decrement
        assert_eq!(monitor.step(start + 16 * MIN).unwrap(), None);
        assert_eq!(monitor.step(start + 20 * MIN).unwrap(), Some(1));
        assert_eq!(monitor.step(start + 25 * MIN).unwrap(), Some(0));
        assert_eq!(monitor.step(start + 30 * MIN).unwrap(), None);
        assert_eq!(monitor.storage_radius(), 0);
    }

    #[test]
    fn holds_while_full_or_syncing() {
        let (monitor, reserve, _) = setup(3);
        let start = Instant::now();
        reserve.size.store(60, Ordering::Relaxed);
        assert_eq!(monitor.step(start + 10 * MIN).unwrap(), None);
        assert_eq!(monitor.step(start + 30 * MIN).unwrap(), None);

        reserve.size.store(10, Ordering::Relaxed);
        *reserve.rate.lock().unwrap() = 0.5;
        assert_eq!(monitor.step(start + 31 * MIN).unwrap(), None);
        assert_eq!(monitor.step(start + 40 * MIN).unwrap(), None);

        // syncing stopped, a new window starts
        *reserve.rate.lock().unwrap() = 0.0;
        assert_eq!(monitor.step(start + 41 * MIN).unwrap(), None);
        assert_eq!(monitor.step(start + 46 * MIN).unwrap(), Some(2));
    }

    #[test]
    fn external_setter_only_raises() {
        let (monitor, _, seen) = setup(3);
        monitor.set_storage_radius(1).unwrap();
        assert_eq!(monitor.storage_radius(), 3);
        assert_eq!(seen.load(Ordering::Relaxed), u8::MAX);
        monitor.set_storage_radius(5).unwrap();
        assert_eq!(monitor.storage_radius(), 5);
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_interval() {
        let (monitor, reserve, _) = setup(2);
        reserve.size.store(0, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let _task = monitor.spawn(cancel.clone());
        tokio::time::sleep(25 * MIN).await;
        assert!(monitor.storage_radius() < 2);
        cancel.cancel();
    }
}
