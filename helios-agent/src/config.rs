//! Agent configuration
//!
//! Handles:
//! - Coordination backend address and credentials
//! - Managed service identity and node identity overrides
//! - Install layout and debug dump location
//! - Poll intervals, session TTLs and the optional health timeout
//! - OS service-manager flavour, routing status command, artifact source

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Env var pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "HELIOS_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: BackendConfig,
    pub service: ServiceConfig,
    pub node: NodeConfig,
    pub paths: PathsConfig,
    pub timing: TimingConfig,
    pub platform: PlatformConfig,
    pub routing: RoutingConfig,
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub address: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    /// Server-side wait for blocking key reads
    pub blocking_wait_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Managed service. When unset it is read from `<node>/services`.
    pub name: Option<String>,
    /// Take part in leader election
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Backend node name; defaults to the hostname
    pub name: Option<String>,
    /// Interface whose IPv4 address becomes `host_ip`
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub install_root: PathBuf,
    /// Where the last merged configuration is dumped. Defaults to
    /// `<install_root>/<service>/data.json`.
    pub debug_dump: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub health_poll_interval_ms: u64,
    /// Pause between failed lock acquires. Zero spins without delay.
    pub lock_retry_interval_ms: u64,
    pub upgrade_session_ttl_secs: u64,
    pub leader_session_ttl_secs: u64,
    /// Upper bound on health waits. `None` waits forever.
    pub health_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitFlavor {
    Smf,
    Systemd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub flavor: UnitFlavor,
    /// Directory unit files are copied into (systemd only)
    pub unit_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Command publishing the node's routing status, `{status}` is
    /// replaced by `up` or `down`. ex: "mdata-put triton.cns.status {status}"
    pub status_command: Option<String>,
    /// DNS name to poll until it stops resolving to this node while draining
    pub dns_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Base URL serving `<service>-<version>-<platform>.tgz`
    pub base_url: Option<String>,
    /// Local directory holding the same archives
    pub local_dir: PathBuf,
    pub platform_suffix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            blocking_wait_secs: 300,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            interface: Some("net0".to_string()),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/opt/helium"),
            debug_dump: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            health_poll_interval_ms: 5_000,
            lock_retry_interval_ms: 0,
            upgrade_session_ttl_secs: 3_600,
            leader_session_ttl_secs: 120,
            health_timeout_secs: None,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let flavor = if cfg!(any(target_os = "illumos", target_os = "solaris")) {
            UnitFlavor::Smf
        } else {
            UnitFlavor::Systemd
        };
        Self {
            flavor,
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        let platform_suffix = if cfg!(any(target_os = "illumos", target_os = "solaris")) {
            "sunos"
        } else {
            std::env::consts::OS
        };
        Self {
            base_url: None,
            local_dir: PathBuf::from("."),
            platform_suffix: platform_suffix.to_string(),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn upgrade_session_ttl(&self) -> Duration {
        Duration::from_secs(self.upgrade_session_ttl_secs)
    }

    pub fn leader_session_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_session_ttl_secs)
    }

    pub fn health_timeout(&self) -> Option<Duration> {
        self.health_timeout_secs.map(Duration::from_secs)
    }
}

impl AgentConfig {
    /// Load config from `HELIOS_AGENT_CONFIG` or the OS-specific location.
    /// A missing file yields the defaults.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the config file path
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("helios-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Debug dump location for `service`
    pub fn debug_dump_path(&self, service: &str) -> PathBuf {
        self.paths
            .debug_dump
            .clone()
            .unwrap_or_else(|| self.paths.install_root.join(service).join("data.json"))
    }
}
