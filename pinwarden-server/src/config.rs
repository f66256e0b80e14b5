use num_bigint::BigUint;
use pinwarden_core::{
    DEFAULT_EPOCH_DURATION_MS, ExpirySettings, OrchestratorSettings, Result, SourceConfig,
    ThrottleSettings, WardenError, parse_limit,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ipfs: IpfsConfig,
    pub chain: ChainConfig,
    pub quota: QuotaConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpfsConfig {
    pub api_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Decimal byte count; may exceed 64 bits.
    pub limit_bytes: String,
    #[serde(default)]
    pub require_membership: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub pin_concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub unpin_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_concurrency(),
            pin_concurrency: default_concurrency(),
            unpin_concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    15
}

fn default_backoff_base_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "default_epoch_duration_ms")]
    pub epoch_duration_ms: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            epoch_duration_ms: default_epoch_duration_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_epoch_duration_ms() -> i64 {
    DEFAULT_EPOCH_DURATION_MS
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_snapshot_interval_secs(),
        }
    }
}

fn default_snapshot_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind_addr: String,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("PINWARDEN").separator("__"))
            .build()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limit()?;

        if self.ipfs.api_url.trim().is_empty() {
            return Err(WardenError::Config("ipfs.api_url cannot be empty".to_string()));
        }
        if self.chain.rpc_url.trim().is_empty() {
            return Err(WardenError::Config("chain.rpc_url cannot be empty".to_string()));
        }
        if self.throttle.max_attempts == 0 {
            return Err(WardenError::Config(
                "throttle.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.expiry.epoch_duration_ms <= 0 {
            return Err(WardenError::Config(
                "expiry.epoch_duration_ms must be positive".to_string(),
            ));
        }
        if self.expiry.sweep_interval_secs == 0 || self.snapshot.interval_secs == 0 {
            return Err(WardenError::Config(
                "sweep and snapshot intervals must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// The initial per-principal limit. Anything but an unsigned decimal is fatal.
    pub fn limit(&self) -> Result<BigUint> {
        parse_limit(&self.quota.limit_bytes).map_err(|error| {
            WardenError::Config(format!("quota.limit_bytes: {}", error))
        })
    }

    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings> {
        Ok(OrchestratorSettings {
            limit: self.limit()?,
            require_membership: self.quota.require_membership,
            throttle: ThrottleSettings {
                fetch_concurrency: self.throttle.fetch_concurrency,
                pin_concurrency: self.throttle.pin_concurrency,
                unpin_concurrency: self.throttle.unpin_concurrency,
                max_attempts: self.throttle.max_attempts,
                backoff_base: Duration::from_millis(self.throttle.backoff_base_ms),
            },
            expiry: ExpirySettings {
                epoch_duration_ms: self.expiry.epoch_duration_ms,
            },
            sweep_interval: Duration::from_secs(self.expiry.sweep_interval_secs),
            snapshot_interval: Duration::from_secs(self.snapshot.interval_secs),
            ..OrchestratorSettings::default()
        })
    }
}
