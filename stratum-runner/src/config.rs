//! Runner configuration
//!
//! Every parameter comes from a `RUNNER_*` environment variable with a
//! default suitable for a single-node development setup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on
    pub bind_addr: SocketAddr,

    /// Root of all task workspaces and step artifacts
    pub storage_path: PathBuf,

    /// Host directory mounted read-only as the assets dir; `None` uses the
    /// assets packaged in the worker image
    pub assets_path: Option<PathBuf>,

    /// Host directory shared by all steps as terraform plugin cache
    pub plugin_cache_path: PathBuf,

    /// Image used when the request does not name one
    pub default_image: String,

    /// Container CLI binary (`podman`, `docker`)
    pub container_bin: String,

    /// Keep containers after the step exited (debugging)
    pub reserve_container: bool,

    /// Interval between two status stream messages
    pub status_interval: Duration,

    /// Sleep after EOF while following a log, also the grace delay after
    /// the step exited
    pub follow_delay: Duration,

    /// Backend address written into `_stratum.tf` when the request has none
    pub state_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 19030)),
            storage_path: PathBuf::from("var/storage"),
            assets_path: None,
            plugin_cache_path: PathBuf::from("var/plugin-cache"),
            default_image: "docker.io/stratum/worker:latest".to_string(),
            container_bin: "podman".to_string(),
            reserve_container: false,
            status_interval: Duration::from_secs(30),
            follow_delay: Duration::from_millis(1000),
            state_address: "127.0.0.1:8500".to_string(),
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - RUNNER_BIND_ADDR (default: 0.0.0.0:19030)
    /// - RUNNER_STORAGE_PATH (default: var/storage)
    /// - RUNNER_ASSETS_PATH
    /// - RUNNER_PLUGIN_CACHE_PATH (default: var/plugin-cache)
    /// - RUNNER_DEFAULT_IMAGE
    /// - RUNNER_CONTAINER_BIN (default: podman)
    /// - RUNNER_RESERVE_CONTAINER (default: false)
    /// - RUNNER_STATUS_INTERVAL (seconds, default: 30)
    /// - RUNNER_FOLLOW_DELAY_MS (default: 1000)
    /// - RUNNER_STATE_ADDRESS
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let bind_addr = match std::env::var("RUNNER_BIND_ADDR") {
            Ok(s) => s
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid RUNNER_BIND_ADDR '{}': {}", s, e))?,
            Err(_) => defaults.bind_addr,
        };

        let storage_path = std::env::var("RUNNER_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_path);

        let assets_path = std::env::var("RUNNER_ASSETS_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let plugin_cache_path = std::env::var("RUNNER_PLUGIN_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.plugin_cache_path);

        let default_image =
            std::env::var("RUNNER_DEFAULT_IMAGE").unwrap_or(defaults.default_image);

        let container_bin =
            std::env::var("RUNNER_CONTAINER_BIN").unwrap_or(defaults.container_bin);

        let reserve_container = std::env::var("RUNNER_RESERVE_CONTAINER")
            .ok()
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.reserve_container);

        let status_interval = std::env::var("RUNNER_STATUS_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.status_interval);

        let follow_delay = std::env::var("RUNNER_FOLLOW_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.follow_delay);

        let state_address =
            std::env::var("RUNNER_STATE_ADDRESS").unwrap_or(defaults.state_address);

        Ok(Self {
            bind_addr,
            storage_path,
            assets_path,
            plugin_cache_path,
            default_image,
            container_bin,
            reserve_container,
            status_interval,
            follow_delay,
            state_address,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage_path.as_os_str().is_empty() {
            anyhow::bail!("storage_path cannot be empty");
        }

        if self.default_image.is_empty() {
            anyhow::bail!("default_image cannot be empty");
        }

        if self.container_bin.is_empty() {
            anyhow::bail!("container_bin cannot be empty");
        }

        if self.status_interval.is_zero() {
            anyhow::bail!("status_interval must be greater than 0");
        }

        if self.follow_delay.is_zero() {
            anyhow::bail!("follow_delay must be greater than 0");
        }

        Ok(())
    }
}

/// Accepts the usual spellings of a boolean flag
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
