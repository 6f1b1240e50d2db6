//! Configuration convergence
//!
//! The merged configuration is the service defaults shipped with the
//! installed version, overlaid with the desired keys from the backend, plus
//! the node's `host_ip`. Its fingerprint is the SHA-1 of the canonical JSON
//! form (sorted keys, 4-space indent), which is also what the debug dump
//! contains.

use serde::Serialize;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::coordination::Coordination;
use crate::error::{AgentError, AgentResult};
use crate::execution::Platform;
use crate::layout::{ServiceDefinition, TEMPLATE_EXTENSION};
use crate::stats::ConvergenceStats;
use crate::templates::TemplateEngine;

pub type MergedConfig = BTreeMap<String, Value>;

/// Merged configuration and its fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub merged: MergedConfig,
    pub fingerprint: String,
}

impl ConfigSnapshot {
    pub fn new(merged: MergedConfig) -> AgentResult<Self> {
        let fingerprint = fingerprint(&merged)?;
        Ok(Self { merged, fingerprint })
    }
}

/// Desired keys stored under `<service>/config/`, keyed by last path segment
pub async fn read_desired_config<C>(coordination: &C, service: &str) -> AgentResult<BTreeMap<String, String>>
where
    C: Coordination + ?Sized,
{
    let prefix = format!("{}/config/", service);
    let entries = coordination.kv_get_recursive(&prefix).await?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.key.rsplit('/').next()?.to_string();
            if name.is_empty() {
                return None;
            }
            Some((name, entry.value))
        })
        .collect())
}

/// Load `default.json` of the installed version
pub async fn load_defaults(definition: &ServiceDefinition) -> AgentResult<Map<String, Value>> {
    let path = definition.default_config();
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| AgentError::MissingDefaults(path.clone()))?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        _ => Err(AgentError::MissingDefaults(path)),
    }
}

/// Desired values win over defaults; `host_ip` always reflects this node
pub fn merge_config(
    defaults: &Map<String, Value>,
    desired: &BTreeMap<String, String>,
    host_ip: Ipv4Addr,
) -> MergedConfig {
    let mut merged: MergedConfig = defaults
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in desired {
        merged.insert(key.clone(), Value::String(value.clone()));
    }
    merged.insert("host_ip".to_string(), Value::String(host_ip.to_string()));
    merged
}

/// Canonical serialization: sorted keys, 4-space indent, `": "` separator
pub fn canonical_json(config: &MergedConfig) -> AgentResult<String> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    // BTreeMap keys are already sorted, nested objects are sorted by serde_json's Map
    config.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}

/// Hex SHA-1 of [`canonical_json`]
pub fn fingerprint(config: &MergedConfig) -> AgentResult<String> {
    let mut hasher = Sha1::new();
    hasher.update(canonical_json(config)?.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Re-renders templates and runs the config hook
pub struct ConfigConverger<'a> {
    engine: &'a dyn TemplateEngine,
    platform: &'a dyn Platform,
    stats: &'a ConvergenceStats,
    debug_dump: PathBuf,
}

impl<'a> ConfigConverger<'a> {
    pub fn new(
        engine: &'a dyn TemplateEngine,
        platform: &'a dyn Platform,
        stats: &'a ConvergenceStats,
        debug_dump: PathBuf,
    ) -> Self {
        Self {
            engine,
            platform,
            stats,
            debug_dump,
        }
    }

    /// Compute the merged config for the installed version. Missing
    /// defaults are fatal for this cycle.
    pub async fn snapshot(
        &self,
        definition: &ServiceDefinition,
        desired: &BTreeMap<String, String>,
        host_ip: Ipv4Addr,
    ) -> AgentResult<ConfigSnapshot> {
        let defaults = load_defaults(definition).await?;
        let snapshot = ConfigSnapshot::new(merge_config(&defaults, desired, host_ip))?;
        self.write_debug_dump(&snapshot).await;
        Ok(snapshot)
    }

    /// Render every template and run the config hook
    pub async fn apply(&self, definition: &ServiceDefinition, snapshot: &ConfigSnapshot) -> AgentResult<usize> {
        let templates = find_templates(definition);
        for template in &templates {
            self.render_template(template, &snapshot.merged).await?;
        }
        info!(
            "Rendered {} templates for config {}",
            templates.len(),
            snapshot.fingerprint
        );

        self.platform
            .run_hook(&definition.config_hook())
            .await
            .tolerate("config hook", self.stats);
        self.stats.record_reconfiguration();
        Ok(templates.len())
    }

    async fn render_template(&self, template: &Path, context: &MergedConfig) -> AgentResult<()> {
        let source = tokio::fs::read_to_string(template)
            .await
            .map_err(|e| AgentError::io(template, e))?;
        let rendered = self
            .engine
            .render(&source, context)
            .map_err(|message| AgentError::Template {
                path: template.to_path_buf(),
                message,
            })?;

        let output = template.with_extension("");
        tokio::fs::write(&output, rendered)
            .await
            .map_err(|e| AgentError::io(&output, e))?;
        debug!("Rendered {} -> {}", template.display(), output.display());
        Ok(())
    }

    async fn write_debug_dump(&self, snapshot: &ConfigSnapshot) {
        if let Some(parent) = self.debug_dump.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let content = match canonical_json(&snapshot.merged) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not serialize config dump: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.debug_dump, content).await {
            warn!("Could not write config dump {}: {}", self.debug_dump.display(), e);
        }
    }
}

/// Every `*.mustache` under the installed tree, sorted
pub fn find_templates(definition: &ServiceDefinition) -> Vec<PathBuf> {
    let pattern = definition.templates_pattern();
    let mut templates: Vec<PathBuf> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping unreadable template path: {}", e);
                    None
                }
            })
            .filter(|path| path.extension().is_some_and(|ext| ext == TEMPLATE_EXTENSION))
            .collect(),
        Err(e) => {
            warn!("Invalid template pattern {}: {}", pattern, e);
            Vec::new()
        }
    };
    templates.sort();
    templates
}
