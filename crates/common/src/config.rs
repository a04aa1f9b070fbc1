use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control-link option names and the values applied for a pool run
pub mod control {
    /// Default control port
    pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9051";

    /// Manual stream routing opt-in
    pub const LEAVE_STREAMS_UNATTACHED: &str = "__LeaveStreamsUnattached";

    pub const CIRCUIT_BUILD_TIMEOUT: &str = "CircuitBuildTimeout";
    pub const CIRCUIT_IDLE_TIMEOUT: &str = "CircuitIdleTimeout";
    pub const CIRCUIT_STREAM_TIMEOUT: &str = "CircuitStreamTimeout";
    pub const NEW_CIRCUIT_PERIOD: &str = "NewCircuitPeriod";
    pub const MAX_CLIENT_CIRCUITS_PENDING: &str = "MaxClientCircuitsPending";

    /// Effectively "never" for the stream timeout and circuit period
    pub const NEVER_SECS: u64 = 9_999_999;
}

/// Default knobs for a pool run
pub mod defaults {
    /// Seconds to wait for a circuit to report BUILT
    pub const BUILD_TIMEOUT_SECS: u64 = 10;

    /// Seconds to wait for the first stream to be attached
    pub const ATTACH_TIMEOUT_SECS: u64 = 10;

    pub const CIRCUIT_IDLE_TIMEOUT_SECS: u64 = 60;

    /// Guards are drawn from `guards[1..GUARD_SLICE_LEN]`
    pub const GUARD_SLICE_LEN: usize = 50;

    pub const SOCKS_ADDRESS: &str = "127.0.0.1:9050";

    pub const REQUEST_TIMEOUT_SECS: u64 = 10;

    /// Sleep before retrying a timed-out request under the retry policy
    pub const TIMEOUT_BACKOFF_SECS: u64 = 120;

    /// Sleep before retrying after a transient transport error
    pub const TRANSIENT_BACKOFF_MILLIS: u64 = 1000;

    pub const STATS_INTERVAL_SECS: u64 = 30;

    pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_10_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/39.0.2171.95 Safari/537.36";
}

/// Where the control link listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum ControlAddress {
    Tcp(String),
    Unix(PathBuf),
}

/// How to authenticate to the control link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlAuth {
    None,
    Password { password: String },
    Cookie { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub address: ControlAddress,
    pub auth: ControlAuth,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            address: ControlAddress::Tcp(control::DEFAULT_ADDRESS.to_string()),
            auth: ControlAuth::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub build_timeout_secs: u64,
    pub attach_timeout_secs: u64,
    pub idle_timeout_secs: u64,

    /// Close circuits and streams left over from earlier runs
    pub close_stale: bool,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            build_timeout_secs: defaults::BUILD_TIMEOUT_SECS,
            attach_timeout_secs: defaults::ATTACH_TIMEOUT_SECS,
            idle_timeout_secs: defaults::CIRCUIT_IDLE_TIMEOUT_SECS,
            close_stale: true,
        }
    }
}

impl CircuitSettings {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_secs)
    }

    /// Option overrides applied to the control link for the run
    pub fn overrides(&self) -> Vec<(&'static str, String)> {
        vec![
            (control::CIRCUIT_BUILD_TIMEOUT, self.build_timeout_secs.to_string()),
            (control::CIRCUIT_IDLE_TIMEOUT, self.idle_timeout_secs.to_string()),
            (control::CIRCUIT_STREAM_TIMEOUT, control::NEVER_SECS.to_string()),
            (control::NEW_CIRCUIT_PERIOD, control::NEVER_SECS.to_string()),
            (control::MAX_CLIENT_CIRCUITS_PENDING, "1".to_string()),
        ]
    }
}

/// Entry-guard choice for each exit node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    /// Draw from the first `slice_len` guards by bandwidth
    pub slice_len: usize,

    /// Skip the single highest-bandwidth guard
    pub exclude_top: bool,

    /// Re-draw when the guard is the exit node itself
    pub avoid_exit_collision: bool,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            slice_len: defaults::GUARD_SLICE_LEN,
            exclude_top: true,
            avoid_exit_collision: true,
        }
    }
}

/// What a worker does when a request times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimeoutPolicy {
    GiveUp,
    RetryAfter { secs: u64 },
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::RetryAfter {
            secs: defaults::TIMEOUT_BACKOFF_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Hard ceiling on launched workers; `None` means one per exit node
    pub max_workers: Option<usize>,

    pub socks_address: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub timeout_policy: TimeoutPolicy,
    pub transient_backoff_millis: u64,

    /// Fetched once while the circuit waits for its first stream
    pub probe_url: Option<String>,

    /// Fetched round-robin by the bundled worker
    pub urls: Vec<String>,

    /// Pause between successive fetches
    pub pause_millis: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: None,
            socks_address: defaults::SOCKS_ADDRESS.to_string(),
            user_agent: defaults::USER_AGENT.to_string(),
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            timeout_policy: TimeoutPolicy::default(),
            transient_backoff_millis: defaults::TRANSIENT_BACKOFF_MILLIS,
            probe_url: None,
            urls: Vec::new(),
            pause_millis: 0,
        }
    }
}

impl WorkerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_millis)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: defaults::STATS_INTERVAL_SECS,
        }
    }
}

impl StatsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Full configuration of a pool run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub control: ControlSettings,
    pub circuit: CircuitSettings,
    pub guards: GuardPolicy,
    pub workers: WorkerSettings,
    pub stats: StatsSettings,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control_address(mut self, address: ControlAddress) -> Self {
        self.control.address = address;
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.workers.max_workers = Some(max);
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.workers.timeout_policy = policy;
        self
    }

    pub fn with_guard_policy(mut self, policy: GuardPolicy) -> Self {
        self.guards = policy;
        self
    }

    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.workers.urls = urls;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
