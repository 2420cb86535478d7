use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the relaytally daemon.
///
/// This file is loaded once at startup. The list of monitored instances lives
/// in a separate `KEY=value` file (see [`crate::agent::instances`]) that is
/// re-read at the start of every poll cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to the operator-maintained instance file.
    #[serde(default = "default_instances_file")]
    pub instances_file: PathBuf,

    /// Directory receiving the snapshot, ledger, caches and markers.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Time between poll cycles. Default: 15s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Hard bound on one control-channel round trip. Default: 5s.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// How long a fetched credential is trusted. Default: 60s.
    #[serde(default = "default_credential_ttl", with = "humantime_serde")]
    pub credential_ttl: Duration,

    /// Ledger rotation configuration.
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Geo resolution configuration.
    #[serde(default)]
    pub geo: GeoConfig,

    /// Unique-visitor ledger configuration.
    #[serde(default)]
    pub visitors: VisitorsConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Ledger rotation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    /// How long monthly archives are kept. Default: 90 days.
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
}

/// Geo resolution configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    /// Cache size that triggers a trim. Default: 10000.
    #[serde(default = "default_geo_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Number of most recent entries kept by a trim. Default: 5000.
    #[serde(default = "default_geo_cache_trim_to")]
    pub cache_trim_to: usize,

    /// Local lookup tools, tried in order. Default: geoiplookup, mmdblookup.
    #[serde(default = "default_geo_tools")]
    pub tools: Vec<String>,

    /// MaxMind database used by `mmdblookup`.
    #[serde(default = "default_mmdb_path")]
    pub mmdb_path: PathBuf,
}

/// Unique-visitor ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VisitorsConfig {
    /// Line count that triggers a trim. Default: 50000.
    #[serde(default = "default_visitors_max_lines")]
    pub max_lines: usize,

    /// Number of most recent lines kept by a trim. Default: 25000.
    #[serde(default = "default_visitors_trim_to")]
    pub trim_to: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_instances_file() -> PathBuf {
    PathBuf::from("/etc/relaytally/instances.conf")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/relaytally")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_credential_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_retention() -> Duration {
    Duration::from_secs(90 * 24 * 60 * 60)
}

fn default_geo_cache_max_entries() -> usize {
    10_000
}

fn default_geo_cache_trim_to() -> usize {
    5_000
}

fn default_geo_tools() -> Vec<String> {
    vec!["geoiplookup".to_string(), "mmdblookup".to_string()]
}

fn default_mmdb_path() -> PathBuf {
    PathBuf::from("/usr/share/GeoIP/GeoLite2-Country.mmdb")
}

fn default_visitors_max_lines() -> usize {
    50_000
}

fn default_visitors_trim_to() -> usize {
    25_000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            instances_file: default_instances_file(),
            state_dir: default_state_dir(),
            poll_interval: default_poll_interval(),
            query_timeout: default_query_timeout(),
            credential_ttl: default_credential_ttl(),
            rotation: RotationConfig::default(),
            geo: GeoConfig::default(),
            visitors: VisitorsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: default_geo_cache_max_entries(),
            cache_trim_to: default_geo_cache_trim_to(),
            tools: default_geo_tools(),
            mmdb_path: default_mmdb_path(),
        }
    }
}

impl Default for VisitorsConfig {
    fn default() -> Self {
        Self {
            max_lines: default_visitors_max_lines(),
            trim_to: default_visitors_trim_to(),
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

// --- Validation and loading ---

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
        if self.instances_file.as_os_str().is_empty() {
            bail!("instances_file is required");
        }

        if self.state_dir.as_os_str().is_empty() {
            bail!("state_dir is required");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be > 0");
        }

        if self.query_timeout.is_zero() {
            bail!("query_timeout must be > 0");
        }

        if self.query_timeout >= self.poll_interval {
            bail!(
                "query_timeout ({:?}) must be shorter than poll_interval ({:?})",
                self.query_timeout,
                self.poll_interval,
            );
        }

        if self.rotation.retention.is_zero() {
            bail!("rotation.retention must be > 0");
        }

        if self.geo.cache_trim_to == 0 || self.geo.cache_trim_to >= self.geo.cache_max_entries {
            bail!("geo.cache_trim_to must be > 0 and smaller than geo.cache_max_entries");
        }

        for tool in &self.geo.tools {
            if !crate::geo::tools::GeoTool::is_supported(tool) {
                bail!("geo.tools: unsupported tool {tool:?}");
            }
        }

        if self.visitors.trim_to == 0 || self.visitors.trim_to >= self.visitors.max_lines {
            bail!("visitors.trim_to must be > 0 and smaller than visitors.max_lines");
        }

        Ok(())
    }
}
