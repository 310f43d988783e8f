//! Configuration of a node.
//!
//! The config is usually loaded from a TOML file with [`NodeConfig::load`].
//! Every field has a default, so a file only needs to name what it changes.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use hive_store::LocalStoreConfig;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::accounting::{BookkeeperConfig, DEFAULT_BASE_PRICE};

/// Default number of peers asked concurrently for one chunk.
pub const DEFAULT_MAX_SELECTS: usize = 32;
/// Default number of peer selections for one chunk.
pub const DEFAULT_MAX_REQUEST_ROUNDS: usize = 1024;
/// Default time a single peer has to deliver a chunk.
pub const DEFAULT_RETRIEVE_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);
/// Default pause before retrying peers that were skipped for overdraft.
pub const DEFAULT_ROUND_COOLDOWN: Duration = Duration::from_millis(600);
/// Default interval after which another peer is asked in parallel.
pub const DEFAULT_ROUND_TICK: Duration = Duration::from_secs(1);
/// Default network id.
pub const DEFAULT_NETWORK_ID: u64 = 1;

/// Errors loading the configuration.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid config"))]
    Parse { source: toml::de::Error },
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir {},
}

/// Configuration of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    /// Store chunks retrieved on behalf of other peers.
    pub caching: bool,
    /// Peers asked concurrently for one chunk.
    pub max_selects: usize,
    /// Peer selections for one chunk before giving up.
    pub max_request_rounds: usize,
    /// Time a single peer has to deliver.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Pause before overdrawn peers are retried.
    #[serde(with = "humantime_serde")]
    pub round_cooldown: Duration,
    /// Interval after which another peer is asked in parallel.
    #[serde(with = "humantime_serde")]
    pub round_tick: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            caching: true,
            max_selects: DEFAULT_MAX_SELECTS,
            max_request_rounds: DEFAULT_MAX_REQUEST_ROUNDS,
            attempt_timeout: DEFAULT_RETRIEVE_CHUNK_TIMEOUT,
            round_cooldown: DEFAULT_ROUND_COOLDOWN,
            round_tick: DEFAULT_ROUND_TICK,
        }
    }
}

/// Configuration of push sync and the pusher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushSyncConfig {
    /// Pushes per second to a single peer.
    pub rate_per_peer: u32,
    /// Pushes to a single peer allowed in a burst.
    pub burst: u32,
    /// Pushes in flight at once.
    pub max_in_flight: usize,
    /// Time a push has to be answered with a receipt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause before failed chunks are pushed again.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for PushSyncConfig {
    fn default() -> Self {
        Self {
            rate_per_peer: 100,
            burst: 20,
            max_in_flight: 128,
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration of the depth monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DepthMonitorConfig {
    /// Interval between checks.
    #[serde(with = "humantime_serde")]
    pub wake_interval: Duration,
    /// Time after start before the radius is lowered at all.
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
    /// How long utilization has to stay low before the radius is lowered.
    #[serde(with = "humantime_serde")]
    pub adaptation_window: Duration,
    /// Reserve utilization below which the radius is lowered.
    pub utilization_threshold: f64,
    /// The radius is never lowered below this.
    pub minimum_radius: u8,
}

impl Default for DepthMonitorConfig {
    fn default() -> Self {
        Self {
            wake_interval: Duration::from_secs(5 * 60),
            warmup: Duration::from_secs(2 * 60 * 60),
            adaptation_window: Duration::from_secs(15 * 60),
            utilization_threshold: 0.5,
            minimum_radius: 0,
        }
    }
}

/// Configuration of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Data directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Network id, part of the overlay address.
    pub network_id: u64,
    /// Whether a chain backend is connected.
    pub chain_enabled: bool,
    /// Chain id of the postage contract.
    pub chain_id: u64,
    /// Price of a chunk at maximum proximity.
    pub base_price: u64,
    /// Default duration of blocklist entries.
    #[serde(with = "humantime_serde")]
    pub blocklist_duration: Duration,
    /// Local store settings. Its path is derived from `data_dir`.
    pub localstore: LocalStoreConfig,
    /// Retrieval settings.
    pub retrieval: RetrievalConfig,
    /// Push sync settings.
    pub pushsync: PushSyncConfig,
    /// Depth monitor settings.
    pub depthmonitor: DepthMonitorConfig,
    /// Accounting settings.
    pub accounting: BookkeeperConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            network_id: DEFAULT_NETWORK_ID,
            chain_enabled: false,
            chain_id: 0,
            base_price: DEFAULT_BASE_PRICE,
            blocklist_duration: Duration::from_secs(60 * 60),
            localstore: LocalStoreConfig::default(),
            retrieval: RetrievalConfig::default(),
            pushsync: PushSyncConfig::default(),
            depthmonitor: DepthMonitorConfig::default(),
            accounting: BookkeeperConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path).await.context(ReadSnafu { path })?;
        Self::from_toml(&s)
    }

    /// Parses a TOML config.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).context(ParseSnafu)
    }

    /// A config keeping everything in memory, with small capacities.
    pub fn memory() -> Self {
        Self {
            localstore: LocalStoreConfig::memory(10_000),
            ..Default::default()
        }
    }

    /// The default data directory: `HIVE_DATA_DIR` if set, else `hive`
    /// in the data directory of the operating environment.
    pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
        if let Some(val) = env::var_os("HIVE_DATA_DIR") {
            return Ok(PathBuf::from(val));
        }
        let path = dirs_next::data_dir().context(NoDataDirSnafu)?;
        Ok(path.join("hive"))
    }

    /// The local store config with its path placed in the data directory.
    pub fn localstore_config(&self) -> LocalStoreConfig {
        let mut config = self.localstore.clone();
        if let Some(dir) = &self.data_dir {
            config.path.get_or_insert_with(|| dir.join("localstore"));
        }
        config
    }

    /// Path of the state store, `None` when kept in memory.
    pub fn state_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("state.db"))
    }
}
