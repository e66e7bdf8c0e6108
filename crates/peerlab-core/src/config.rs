//! labd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabdConfig {
    /// Address the control API listens on.
    pub addr: String,
    /// Directory holding the metadata database.
    pub data_dir: PathBuf,
    pub provider: ProviderConfig,
    pub cluster: ClusterConfig,
    pub seeder: SeederConfig,
    pub trace: TraceConfig,
    pub experiment: ExperimentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Host the local provider binds node agents to.
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Health polls per node before cluster creation gives up.
    pub health_attempts: u32,
    pub health_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeederConfig {
    /// Peer addresses of the content seeder, `{transport}/p2p/{peer_id}`.
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Base URL of a trace UI; reports link `{ui_url}/trace/{trace_id}`.
    pub ui_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Upper bound on concurrently running trials. Zero means unbounded.
    pub max_concurrent_trials: usize,
    pub shutdown: ShutdownMode,
}

/// What happens to in-flight runs when the daemon shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Wait for every in-flight run to finish.
    Drain,
    /// Cancel in-flight runs and wait only for them to record their outcome.
    Abandon,
}

impl Default for LabdConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7001".to_string(),
            data_dir: PathBuf::from("/var/lib/peerlab"),
            provider: ProviderConfig::default(),
            cluster: ClusterConfig::default(),
            seeder: SeederConfig::default(),
            trace: TraceConfig::default(),
            experiment: ExperimentConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Local,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            health_attempts: 10,
            health_interval_ms: 500,
        }
    }
}

impl ClusterConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_trials: 0,
            shutdown: ShutdownMode::Abandon,
        }
    }
}

impl TraceConfig {
    /// The configured trace UI, if any.
    pub fn ui_url(&self) -> Option<&str> {
        let url = self.ui_url.trim_end_matches('/');
        (!url.is_empty()).then_some(url)
    }
}

impl LabdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LabdConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the metadata database inside `data_dir`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("labd.redb")
    }
}
