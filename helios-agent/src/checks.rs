//! Health check manifests shipped with a service version
//!
//! Manifest format (`helios/checks/*.json`):
//! `{name, serviceid, interval, timeout, tcp | http | script}`

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::coordination::{CheckDefinition, CheckProbe, Coordination};
use crate::error::AgentResult;
use crate::layout::ServiceDefinition;
use crate::stats::ConvergenceStats;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckManifest {
    pub name: String,
    pub serviceid: String,
    pub interval: String,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
}

impl CheckManifest {
    /// Build the registration. `None` when no usable probe is declared.
    pub fn to_definition(&self) -> Option<CheckDefinition> {
        let probe = if let Some(hostport) = &self.tcp {
            let (host, port) = hostport.rsplit_once(':')?;
            CheckProbe::Tcp {
                host: host.to_string(),
                port: port.parse().ok()?,
            }
        } else if let Some(url) = &self.http {
            CheckProbe::Http { url: url.clone() }
        } else if let Some(command) = &self.script {
            CheckProbe::Script {
                command: command.clone(),
            }
        } else {
            return None;
        };

        // script checks carry no timeout
        let timeout = match probe {
            CheckProbe::Script { .. } => None,
            _ => self.timeout.clone(),
        };

        Some(CheckDefinition {
            name: self.name.clone(),
            service_id: self.serviceid.clone(),
            interval: self.interval.clone(),
            timeout,
            probe,
        })
    }
}

/// Manifest files of the installed version, sorted
pub fn manifest_paths(definition: &ServiceDefinition) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = glob::glob(&definition.checks_pattern())
        .map(|paths| paths.filter_map(Result::ok).collect())
        .unwrap_or_default();
    paths.sort();
    paths
}

async fn load_definition(path: &Path) -> Option<CheckDefinition> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!("Skipping unreadable check manifest {}: {}", path.display(), e);
            return None;
        }
    };
    let manifest: CheckManifest = match serde_json::from_str(&content) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("Skipping invalid check manifest {}: {}", path.display(), e);
            return None;
        }
    };
    let definition = manifest.to_definition();
    if definition.is_none() {
        warn!(
            "Skipping check manifest {} ({}): no usable tcp/http/script probe",
            path.display(),
            manifest.name
        );
    }
    definition
}

/// Register every check declared by the installed version. Returns
/// `(registered, skipped)`; skipped manifests are also counted in `stats`.
pub async fn register_checks<C>(
    coordination: &C,
    definition: &ServiceDefinition,
    stats: &ConvergenceStats,
) -> AgentResult<(usize, usize)>
where
    C: Coordination + ?Sized,
{
    let mut registered = 0;
    let mut skipped = 0;
    for path in manifest_paths(definition) {
        match load_definition(&path).await {
            Some(check) => {
                coordination.agent_check_register(&check).await?;
                debug!("Registered check {} for {}", check.name, check.service_id);
                registered += 1;
            }
            None => {
                stats.record_skipped_check();
                skipped += 1;
            }
        }
    }
    Ok((registered, skipped))
}
