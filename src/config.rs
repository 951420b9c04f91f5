use crate::error::{Result, ScoutError};
use crate::types::{AddressFamily, LocationFilter};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const APP_NAME: &str = "edgescout";

pub const TLS_PORTS: &str = "443,2053,2083,2087,2096,8443";
pub const PLAIN_PORTS: &str = "80,8080,8880,2052,2082,2086,2095";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub desired_count: usize,
    pub use_tls: bool,
    /// 数据中心代码, 或 "any"
    pub target_location: String,
    pub min_bandwidth_mbps: f64,
    pub address_family: AddressFamily,
    /// Candidates drawn per batch
    pub batch_size: usize,
    /// Subnet picks per batch before giving up on filling it
    pub subnet_draws: usize,
    /// Consecutive empty batches tolerated before the search reports exhaustion
    pub max_idle_batches: usize,
    pub location_concurrency: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            desired_count: 5,
            use_tls: true,
            target_location: "any".to_string(),
            min_bandwidth_mbps: 5.0,
            address_family: AddressFamily::V4,
            batch_size: 10,
            subnet_draws: 30,
            max_idle_batches: 20,
            location_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_secs: f64,
    pub window_secs: f64,
    pub window_samples: usize,
    pub sample_interval_ms: u64,
    pub trace_path: String,
    pub http_port: u16,
    pub https_port: u16,
    pub accept_invalid_certs: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            window_secs: 10.0,
            window_samples: 5,
            sample_interval_ms: 500,
            trace_path: "cdn-cgi/trace".to_string(),
            http_port: 80,
            https_port: 443,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Empty means `find.txt` inside the data dir
    pub path: String,
    pub tls_ports: String,
    pub plain_ports: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            tls_ports: TLS_PORTS.to_string(),
            plain_ports: PLAIN_PORTS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Empty means the platform data dir
    pub dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub probe: ProbeConfig,
    pub output: OutputConfig,
    pub data: DataConfig,
}

/// Immutable parameters of one search run, derived from a validated [`Config`].
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub target_location: LocationFilter,
    pub min_bandwidth_mbps: f64,
    pub probe_timeout: Duration,
    pub throughput_window: Duration,
    pub use_tls: bool,
    pub desired_count: usize,
    pub address_family: AddressFamily,
    pub batch_size: usize,
    pub subnet_draws: usize,
    pub max_idle_batches: usize,
    pub location_concurrency: usize,
}

/// Everything the HTTP probe needs besides the virtual host.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub trace_path: String,
    pub http_port: u16,
    pub https_port: u16,
    pub accept_invalid_certs: bool,
    pub window_samples: usize,
    pub sample_interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Config::default().probe_settings()
    }
}

impl Config {
    /// Default config file location (~/.config/edgescout/config.toml on Linux)
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load strategy:
    /// 1. An explicit path must exist and parse
    /// 2. Otherwise the user config file, if present
    /// 3. Otherwise built-in defaults
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path).await;
        }
        if let Some(path) = Self::default_path() {
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Self::load_file(&path).await;
            }
        }
        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    async fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ScoutError::Input {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Config = toml::from_str(&content)?;
        tracing::info!(?path, "Loaded configuration");
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject parameters a run cannot start with. Nothing is checked mid-run.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, v: f64) -> Result<()> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ScoutError::InvalidConfig(format!("{} must be positive, got {}", name, v)))
            }
        }
        fn nonzero(name: &str, v: usize) -> Result<()> {
            if v == 0 {
                Err(ScoutError::InvalidConfig(format!("{} must be at least 1", name)))
            } else {
                Ok(())
            }
        }

        let s = &self.search;
        positive("search.min_bandwidth_mbps", s.min_bandwidth_mbps)?;
        nonzero("search.desired_count", s.desired_count)?;
        nonzero("search.batch_size", s.batch_size)?;
        nonzero("search.subnet_draws", s.subnet_draws)?;
        nonzero("search.max_idle_batches", s.max_idle_batches)?;
        nonzero("search.location_concurrency", s.location_concurrency)?;

        let p = &self.probe;
        positive("probe.timeout_secs", p.timeout_secs)?;
        positive("probe.window_secs", p.window_secs)?;
        nonzero("probe.window_samples", p.window_samples)?;
        if p.sample_interval_ms == 0 {
            return Err(ScoutError::InvalidConfig(
                "probe.sample_interval_ms must be at least 1".to_string(),
            ));
        }
        if p.http_port == 0 || p.https_port == 0 {
            return Err(ScoutError::InvalidConfig("probe ports must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn search_params(&self) -> SearchParams {
        let s = &self.search;
        SearchParams {
            target_location: LocationFilter::parse(&s.target_location),
            min_bandwidth_mbps: s.min_bandwidth_mbps,
            probe_timeout: Duration::from_secs_f64(self.probe.timeout_secs),
            throughput_window: Duration::from_secs_f64(self.probe.window_secs),
            use_tls: s.use_tls,
            desired_count: s.desired_count,
            address_family: s.address_family,
            batch_size: s.batch_size,
            subnet_draws: s.subnet_draws,
            max_idle_batches: s.max_idle_batches,
            location_concurrency: s.location_concurrency,
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        let p = &self.probe;
        ProbeSettings {
            trace_path: p.trace_path.trim_start_matches('/').to_string(),
            http_port: p.http_port,
            https_port: p.https_port,
            accept_invalid_certs: p.accept_invalid_certs,
            window_samples: p.window_samples,
            sample_interval: Duration::from_millis(p.sample_interval_ms),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        if !self.data.dir.is_empty() {
            return PathBuf::from(&self.data.dir);
        }
        ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn output_path(&self) -> PathBuf {
        if self.output.path.is_empty() {
            self.data_dir().join("find.txt")
        } else {
            PathBuf::from(&self.output.path)
        }
    }

    pub fn ports_for(&self, use_tls: bool) -> &str {
        if use_tls {
            &self.output.tls_ports
        } else {
            &self.output.plain_ports
        }
    }
}
