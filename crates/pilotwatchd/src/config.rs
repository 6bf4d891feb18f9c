//! pilotwatchd.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pilotwatch_health::{HttpStatusClient, WatcherConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Delay between watch cycles, in milliseconds.
    pub frequency_ms: u64,
    /// Port of the sidecar status endpoint.
    pub status_port: u16,
    /// Timeout for one sidecar request, in milliseconds.
    pub status_timeout_ms: u64,
    pub event_capacity: usize,
    /// Directory holding the state store.
    pub data_dir: PathBuf,
    /// Topology file to watch instead of a control plane.
    pub topology: Option<PathBuf>,
    pub control_plane: ControlPlaneConfig,
}

/// Control-plane endpoint and credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub url: Option<String>,
    pub account: Option<String>,
    pub key_id: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            frequency_ms: 1000,
            status_port: pilotwatch_health::checker::DEFAULT_STATUS_PORT,
            status_timeout_ms: 2000,
            event_capacity: 16,
            data_dir: PathBuf::from("/var/lib/pilotwatch"),
            topology: None,
            control_plane: ControlPlaneConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.control_plane = config.control_plane.with_env_fallbacks();
        Ok(config)
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            frequency: Duration::from_millis(self.frequency_ms),
            event_capacity: self.event_capacity,
        }
    }

    pub fn status_client(&self) -> HttpStatusClient {
        HttpStatusClient::new(self.status_port, self.status_timeout())
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

impl ControlPlaneConfig {
    /// Fill unset fields from `SDC_URL`, `SDC_ACCOUNT` and `SDC_KEY_ID`.
    pub fn with_env_fallbacks(self) -> Self {
        self.with_fallbacks(|key| std::env::var(key).ok())
    }

    fn with_fallbacks(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            url: self.url.or_else(|| lookup("SDC_URL")),
            account: self.account.or_else(|| lookup("SDC_ACCOUNT")),
            key_id: self.key_id.or_else(|| lookup("SDC_KEY_ID")),
        }
    }
}
