use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::policy::{MetricPolicy, PolicySettings};

/// Top-level configuration for the historian agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Local cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Dispatch sweep configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// History query configuration.
    #[serde(default)]
    pub query: QueryConfig,

    /// Ingest filter configuration and initial policies.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Event and history HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,
}

/// Which store implementation backs the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    ClickHouse,
    /// In-process store, contents are lost on exit.
    Memory,
}

/// Database store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database holding the dimension and partition tables.
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_pool_min")]
    pub pool_min: u16,

    #[serde(default = "default_pool_max")]
    pub pool_max: u16,

    /// Upper bound on waiting for a pooled connection. Default: 5s.
    #[serde(default = "default_borrow_timeout", with = "humantime_serde")]
    pub borrow_timeout: Duration,

    /// Reachability probe timeout. Default: 2s.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Decimal digits numbers read back from history are rounded to.
    #[serde(default)]
    pub round: Option<u32>,

    /// Create the schema on startup. Default: true.
    #[serde(default = "default_true")]
    pub bootstrap: bool,
}

/// Local cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding one log file per metric.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// How often dirty logs are written to disk. Default: 10m.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Default retention horizon for persisted entries. Default: 7d.
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// How often the retention sweep runs. Default: 10m.
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,
}

/// Dispatch sweep configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Dispatch sweep interval. Default: 1m.
    #[serde(default = "default_dispatch_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// History query configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Maximum rows returned by one history query. Default: 2000.
    #[serde(default = "default_query_limit")]
    pub limit: usize,

    /// Added to now when a query has no end. Default: 5000s.
    #[serde(default = "default_end_skew", with = "humantime_serde")]
    pub end_skew: Duration,
}

/// Ingest filter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// Debounce window for policies that do not set one. Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub debounce: Duration,

    /// Policies installed at startup, keyed by metric id.
    #[serde(default)]
    pub policies: HashMap<String, PolicySettings>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for the metrics server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Event and history HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the API server. Default: ":8089".
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

// --- Default value functions for serde ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database() -> String {
    "historian".to_string()
}

fn default_pool_min() -> u16 {
    2
}

fn default_pool_max() -> u16 {
    5
}

fn default_borrow_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_dispatch_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_query_limit() -> usize {
    2000
}

fn default_end_skew() -> Duration {
    Duration::from_secs(5000)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_api_addr() -> String {
    ":8089".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            dispatch: DispatchConfig::default(),
            query: QueryConfig::default(),
            ingest: IngestConfig::default(),
            health: HealthConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            borrow_timeout: default_borrow_timeout(),
            probe_timeout: default_probe_timeout(),
            round: None,
            bootstrap: default_true(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            flush_interval: default_flush_interval(),
            retention: default_retention(),
            prune_interval: default_prune_interval(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: default_dispatch_interval(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            limit: default_query_limit(),
            end_skew: default_end_skew(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
        }
    }
}

/// Largest rounding precision accepted; 10^digits must stay exact in f64.
const MAX_ROUND_DIGITS: u32 = 15;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == Backend::ClickHouse && self.store.endpoint.is_empty() {
            bail!("store.endpoint is required for the clickhouse backend");
        }

        if self.store.database.is_empty() {
            bail!("store.database is required");
        }

        if self.store.pool_max == 0 {
            bail!("store.pool_max must be positive");
        }

        if self.store.pool_min > self.store.pool_max {
            bail!(
                "store.pool_min ({}) must not exceed store.pool_max ({})",
                self.store.pool_min,
                self.store.pool_max
            );
        }

        if self.store.borrow_timeout.is_zero() {
            bail!("store.borrow_timeout must be positive");
        }

        if self.store.probe_timeout.is_zero() {
            bail!("store.probe_timeout must be positive");
        }

        if let Some(digits) = self.store.round {
            if digits > MAX_ROUND_DIGITS {
                bail!("store.round must be at most {MAX_ROUND_DIGITS} digits");
            }
        }

        if self.cache.dir.as_os_str().is_empty() {
            bail!("cache.dir is required");
        }

        if self.cache.flush_interval.is_zero() {
            bail!("cache.flush_interval must be positive");
        }

        if self.cache.retention.is_zero() {
            bail!("cache.retention must be positive");
        }

        if self.cache.prune_interval.is_zero() {
            bail!("cache.prune_interval must be positive");
        }

        if self.dispatch.interval.is_zero() {
            bail!("dispatch.interval must be positive");
        }

        if self.query.limit == 0 {
            bail!("query.limit must be positive");
        }

        if self.ingest.policies.keys().any(|id| id.is_empty()) {
            bail!("ingest.policies contains an empty metric id");
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        if self.api.addr.is_empty() {
            bail!("api.addr is required");
        }

        Ok(())
    }
}

impl IngestConfig {
    /// Startup policies with the configured default debounce applied.
    pub fn resolved_policies(&self) -> impl Iterator<Item = (&str, MetricPolicy)> + '_ {
        self.policies
            .iter()
            .map(|(id, settings)| (id.as_str(), settings.resolve(self.debounce)))
    }
}
