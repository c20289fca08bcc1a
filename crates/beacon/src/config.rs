//! Configuration management for Beacon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_common::constants::{
    DEFAULT_BEAT_COUNT, DEFAULT_BEAT_INTERVAL_SECS, DEFAULT_PEERS, DEFAULT_REQUEST_TIMEOUT_SECS,
    LEASE_PERIOD_MULTIPLIER, keys,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// etcd client URLs
    #[serde(default = "default_peers")]
    pub peers: Vec<String>,

    /// CA bundle (PEM) used to verify the etcd peers
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// etcd username
    #[serde(default)]
    pub username: Option<String>,

    /// etcd password
    #[serde(default)]
    pub password: Option<String>,

    /// Timeout for each non-watch request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Key layout
    #[serde(default)]
    pub keys: KeyLayout,

    /// Heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
}

/// Roots of the config and liveness namespaces
#[derive(Debug, Clone, Deserialize)]
pub struct KeyLayout {
    #[serde(default = "default_config_root")]
    pub config_root: String,

    #[serde(default = "default_running_root")]
    pub running_root: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            config_root: default_config_root(),
            running_root: default_running_root(),
        }
    }
}

/// Heartbeat-specific configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    /// Seconds between beats
    #[serde(default = "default_beat_interval")]
    pub interval_secs: u64,

    /// Number of beats (0 = forever)
    #[serde(default = "default_beat_count")]
    pub count: u64,

    /// Token lease in seconds (defaults to a multiple of the interval)
    #[serde(default)]
    pub lease_ttl_secs: Option<u64>,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_beat_interval(),
            count: default_beat_count(),
            lease_ttl_secs: None,
        }
    }
}

impl HeartbeatSettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Configured lease, or `LEASE_PERIOD_MULTIPLIER` periods
    pub fn lease(&self) -> Result<Duration> {
        match self.lease_ttl_secs {
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => self.period().checked_mul(LEASE_PERIOD_MULTIPLIER).with_context(|| {
                format!("heartbeat interval of {}s is too large", self.interval_secs)
            }),
        }
    }
}

// Default value functions
fn default_peers() -> Vec<String> {
    DEFAULT_PEERS.split(',').map(str::to_string).collect()
}
fn default_request_timeout() -> u64 { DEFAULT_REQUEST_TIMEOUT_SECS }
fn default_config_root() -> String { keys::CONFIG_ROOT.to_string() }
fn default_running_root() -> String { keys::RUNNING_ROOT.to_string() }
fn default_beat_interval() -> u64 { DEFAULT_BEAT_INTERVAL_SECS }
fn default_beat_count() -> u64 { DEFAULT_BEAT_COUNT }

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::debug!(path = config_path, "Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref peers) = args.peers {
            config.peers = peers.clone();
        }
        if let Some(ref cacert) = args.cacert {
            config.ca_cert = Some(cacert.clone());
        }
        if let Some(ref user) = args.user {
            config.username = Some(user.clone());
        }
        if let Some(ref pass) = args.pass {
            config.password = Some(pass.clone());
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            peers: default_peers(),
            ca_cert: None,
            username: None,
            password: None,
            request_timeout_secs: default_request_timeout(),
            keys: KeyLayout::default(),
            heartbeat: HeartbeatSettings::default(),
        }
    }
}
