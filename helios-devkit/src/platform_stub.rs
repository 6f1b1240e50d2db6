/*!
Hôte simulé pour les tests d'agent

Remplace les commandes OS (svcadm/systemctl, tar, hooks) par:
- Un enregistrement des opérations dans l'ordre
- Des archives "fixture" en JSON, extraites en arborescence réelle
- L'état de l'unité reporté sur les checks du backend simulé
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use helios_agent::artifacts::archive_name;
use helios_agent::execution::{ExecutionResult, Platform, RoutingStatus};
use helios_agent::upgrade::upgrade_lock_key;

use crate::backend_stub::SimulatedBackend;

/// Contenu d'une version de service, sérialisé comme "archive"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveFixture {
    pub service: String,
    pub version: String,
    pub defaults: Value,
    /// Chemin relatif → contenu (`etc/app.conf.mustache`)
    pub templates: BTreeMap<String, String>,
    /// Nom de fichier → contenu brut, même invalide
    pub checks: BTreeMap<String, String>,
}

impl ArchiveFixture {
    pub fn new(service: &str, version: &str, defaults: Value) -> Self {
        Self {
            service: service.to_string(),
            version: version.to_string(),
            defaults,
            templates: BTreeMap::new(),
            checks: BTreeMap::new(),
        }
    }

    pub fn with_template(mut self, path: &str, content: &str) -> Self {
        self.templates.insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_check(mut self, file: &str, content: &str) -> Self {
        self.checks.insert(file.to_string(), content.to_string());
        self
    }

    /// Check TCP standard `<service>-port`
    pub fn with_tcp_check(self, port: u16) -> Self {
        let manifest = serde_json::json!({
            "name": format!("{}-port", self.service),
            "serviceid": self.service,
            "interval": "10s",
            "timeout": "1s",
            "tcp": format!("localhost:{}", port),
        });
        let file = format!("{}-port.json", self.service);
        self.with_check(&file, &manifest.to_string())
    }

    /// Écrit l'archive dans `dir` sous le nom attendu par le store local
    pub fn write_to(&self, dir: &Path, platform_suffix: &str) -> anyhow::Result<PathBuf> {
        let path = dir.join(archive_name(&self.service, &self.version, platform_suffix));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    /// Crée `<destination>/<service>-<version>/...`
    pub fn materialize(&self, destination: &Path) -> anyhow::Result<PathBuf> {
        let root = destination.join(format!("{}-{}", self.service, self.version));
        let helios = root.join("helios");
        for dir in ["hooks", "checks", "smf", "systemd"] {
            std::fs::create_dir_all(helios.join(dir))?;
        }

        std::fs::write(helios.join("default.json"), serde_json::to_vec_pretty(&self.defaults)?)?;
        std::fs::write(helios.join("hooks").join("install.sh"), "#!/bin/sh\n")?;
        std::fs::write(helios.join("hooks").join("config.sh"), "#!/bin/sh\n")?;
        std::fs::write(helios.join("smf").join(format!("{}.xml", self.service)), "<service_bundle/>\n")?;
        std::fs::write(
            helios.join("systemd").join(format!("{}.service", self.service)),
            "[Service]\n",
        )?;

        for (file, content) in &self.checks {
            std::fs::write(helios.join("checks").join(file), content)?;
        }
        for (relative, content) in &self.templates {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(root)
    }
}

/// Opération enregistrée par l'hôte simulé
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    UnitDisabled(String),
    UnitEnabled(String),
    UnitCleared(String),
    UnitImported(String),
    /// Extraction, avec le nœud qui détenait le verrou d'upgrade à ce moment
    Extracted {
        service: String,
        version: String,
        lock_holder: Option<String>,
    },
    HookRun(String),
    Routing(RoutingStatus),
}

/// Implémente [`Platform`] pour un nœud du backend simulé
#[derive(Clone)]
pub struct SimulatedHost {
    backend: SimulatedBackend,
    node: String,
    imported: Arc<Mutex<HashSet<String>>>,
    events: Arc<Mutex<Vec<HostEvent>>>,
}

impl SimulatedHost {
    pub fn new(backend: SimulatedBackend, node: &str) -> Self {
        Self {
            backend,
            node: node.to_string(),
            imported: Arc::new(Mutex::new(HashSet::new())),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    /// Hooks exécutés, par nom de fichier (`install.sh`, `config.sh`)
    pub fn hooks_run(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HostEvent::HookRun(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn routing_changes(&self) -> Vec<RoutingStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HostEvent::Routing(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: HostEvent) {
        log::debug!("[SIM] {} {:?}", self.node, event);
        self.events.lock().push(event);
    }
}

#[async_trait]
impl Platform for SimulatedHost {
    async fn unit_exists(&self, service: &str) -> bool {
        self.imported.lock().contains(service)
    }

    async fn disable_unit(&self, service: &str) -> ExecutionResult {
        self.backend.set_unit_running(&self.node, service, false);
        self.record(HostEvent::UnitDisabled(service.to_string()));
        ExecutionResult::ok("")
    }

    async fn enable_unit(&self, service: &str) -> ExecutionResult {
        self.backend.set_unit_running(&self.node, service, true);
        self.record(HostEvent::UnitEnabled(service.to_string()));
        ExecutionResult::ok("")
    }

    async fn clear_unit(&self, service: &str) -> ExecutionResult {
        self.record(HostEvent::UnitCleared(service.to_string()));
        ExecutionResult::ok("")
    }

    async fn import_unit(&self, service: &str, definition: &Path) -> ExecutionResult {
        if tokio::fs::metadata(definition).await.is_err() {
            return ExecutionResult::failed(format!("{} not found", definition.display()));
        }
        self.imported.lock().insert(service.to_string());
        self.record(HostEvent::UnitImported(service.to_string()));
        ExecutionResult::ok("")
    }

    async fn extract_archive(&self, archive: &Path, destination: &Path) -> ExecutionResult {
        let fixture: ArchiveFixture = match std::fs::read(archive)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<ArchiveFixture>(&bytes)?))
        {
            Ok(fixture) => fixture,
            Err(e) => return ExecutionResult::failed(format!("bad archive {}: {}", archive.display(), e)),
        };

        let lock_holder = self.backend.holder(&upgrade_lock_key(&fixture.service));
        if let Err(e) = fixture.materialize(destination) {
            return ExecutionResult::failed(e.to_string());
        }
        self.record(HostEvent::Extracted {
            service: fixture.service,
            version: fixture.version,
            lock_holder,
        });
        ExecutionResult::ok("")
    }

    async fn run_hook(&self, hook: &Path) -> ExecutionResult {
        if tokio::fs::metadata(hook).await.is_err() {
            return ExecutionResult::failed(format!("{} not found", hook.display()));
        }
        let name = hook
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.record(HostEvent::HookRun(name));
        ExecutionResult::ok("")
    }

    async fn set_routing_status(&self, status: RoutingStatus) -> ExecutionResult {
        self.record(HostEvent::Routing(status));
        ExecutionResult::ok("")
    }
}
