//! Drift detection: desired state in the backend vs. what this node runs

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

use crate::converge::{load_defaults, merge_config, read_desired_config, ConfigSnapshot};
use crate::coordination::{read_required_key, Coordination};
use crate::error::AgentResult;
use crate::layout::InstallLayout;
use crate::tags::ServiceTags;

pub fn version_key(service: &str) -> String {
    format!("{}/version", service)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub desired_version: String,
    /// Verified installed version (symlink and published tag agree)
    pub installed_version: Option<String>,
    pub version_drift: bool,
    pub desired_config: BTreeMap<String, String>,
    /// `None` when the installed defaults could not be read
    pub desired_fingerprint: Option<String>,
    pub config_drift: bool,
}

impl DriftReport {
    pub fn in_sync(&self) -> bool {
        !self.version_drift && !self.config_drift
    }
}

pub struct DriftDetector<'a, C: ?Sized> {
    coordination: &'a C,
    layout: &'a InstallLayout,
    host_ip: Ipv4Addr,
    key_retry: Duration,
}

impl<'a, C> DriftDetector<'a, C>
where
    C: Coordination + ?Sized,
{
    pub fn new(coordination: &'a C, layout: &'a InstallLayout, host_ip: Ipv4Addr, key_retry: Duration) -> Self {
        Self {
            coordination,
            layout,
            host_ip,
            key_retry,
        }
    }

    /// Compare desired version/config with the installed state. Blocks until
    /// the desired version key exists. No side effects.
    pub async fn detect(&self, published: &ServiceTags) -> AgentResult<DriftReport> {
        let service = self.layout.service();
        let desired_version =
            read_required_key(self.coordination, &version_key(service), self.key_retry).await?;

        let installed_version = self.layout.installed_version(published.version.as_deref()).await;
        let version_drift = installed_version.as_deref() != Some(desired_version.as_str());

        let desired_config = read_desired_config(self.coordination, service).await?;
        let desired_fingerprint = match load_defaults(&self.layout.definition()).await {
            Ok(defaults) => {
                let merged = merge_config(&defaults, &desired_config, self.host_ip);
                Some(ConfigSnapshot::new(merged)?.fingerprint)
            }
            Err(e) => {
                debug!("Cannot fingerprint installed config for {}: {}", service, e);
                None
            }
        };
        let config_drift = match (&desired_fingerprint, &published.config_fingerprint) {
            (Some(desired), Some(current)) => desired != current,
            _ => true,
        };

        if version_drift {
            info!(
                "Version drift for {}: installed {:?}, desired {}",
                service, installed_version, desired_version
            );
        }
        if config_drift {
            info!(
                "Config drift for {}: published {:?}, desired {:?}",
                service, published.config_fingerprint, desired_fingerprint
            );
        }

        Ok(DriftReport {
            desired_version,
            installed_version,
            version_drift,
            desired_config,
            desired_fingerprint,
            config_drift,
        })
    }
}
