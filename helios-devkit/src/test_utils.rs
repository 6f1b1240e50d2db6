/*!
Test Harness pour agents Helios

Facilite l'écriture de tests multi-nœuds avec:
- Un backend simulé partagé et un répertoire temporaire par test
- Publication d'archives fixture et de l'état désiré
- Construction d'agents avec des intervalles raccourcis
*/

use anyhow::Result;
use std::cell::Cell;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use helios_agent::artifacts::LocalArtifactStore;
use helios_agent::config::UnitFlavor;
use helios_agent::control::{Collaborators, ControlLoop, CycleReport};
use helios_agent::discovery::NodeIdentity;
use helios_agent::drift::version_key;
use helios_agent::layout::InstallLayout;
use helios_agent::templates::MustacheEngine;
use helios_agent::{AgentConfig, AgentResult};

use crate::backend_stub::SimulatedBackend;
use crate::platform_stub::{ArchiveFixture, SimulatedHost};

pub const PLATFORM_SUFFIX: &str = "linux";

/// Harness de test: un backend, N nœuds
pub struct TestHarness {
    pub backend: SimulatedBackend,
    root: TempDir,
    next_octet: Cell<u8>,
}

/// Un agent et son hôte simulé
pub struct TestNode {
    pub name: String,
    pub host: SimulatedHost,
    pub layout: InstallLayout,
    pub config: AgentConfig,
    pub identity: NodeIdentity,
    pub agent: ControlLoop,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub fn new() -> Result<Self> {
        env_logger::builder().is_test(true).try_init().ok(); // Init logging pour tests

        let root = tempfile::tempdir()?;
        std::fs::create_dir_all(root.path().join("artifacts"))?;
        Ok(Self {
            backend: SimulatedBackend::new(),
            root,
            next_octet: Cell::new(10),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.path().join("artifacts")
    }

    /// Rend une version disponible dans le store d'artefacts
    pub fn publish(&self, fixture: &ArchiveFixture) -> Result<()> {
        fixture.write_to(&self.artifacts_dir(), PLATFORM_SUFFIX)?;
        log::info!("[HARNESS] Published {}-{}", fixture.service, fixture.version);
        Ok(())
    }

    pub fn set_version(&self, service: &str, version: &str) {
        self.backend.put(&version_key(service), version);
    }

    pub fn set_config(&self, service: &str, key: &str, value: &str) {
        self.backend.put(&format!("{}/config/{}", service, key), value);
    }

    /// Configuration de test: intervalles de quelques millisecondes
    pub fn config(&self, node: &str, service: &str) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.service.name = Some(service.to_string());
        config.node.name = Some(node.to_string());
        config.paths.install_root = self.root.path().join("nodes").join(node);
        config.timing.poll_interval_ms = 10;
        config.timing.health_poll_interval_ms = 5;
        config.timing.lock_retry_interval_ms = 0;
        config.timing.health_timeout_secs = Some(5);
        config.platform.flavor = UnitFlavor::Systemd;
        config.artifacts.base_url = None;
        config.artifacts.local_dir = self.artifacts_dir();
        config.artifacts.platform_suffix = PLATFORM_SUFFIX.to_string();
        config
    }

    pub fn node(&self, name: &str, service: &str) -> TestNode {
        self.node_with(name, service, |_| {})
    }

    pub fn primary_node(&self, name: &str, service: &str) -> TestNode {
        self.node_with(name, service, |config| config.service.primary = true)
    }

    pub fn node_with<F>(&self, name: &str, service: &str, configure: F) -> TestNode
    where
        F: FnOnce(&mut AgentConfig),
    {
        self.node_known_as(name, name, service, configure)
    }

    /// Nœud dont le nom local (hostname) diffère du nom connu du backend
    pub fn node_known_as<F>(&self, name: &str, local_name: &str, service: &str, configure: F) -> TestNode
    where
        F: FnOnce(&mut AgentConfig),
    {
        let mut config = self.config(local_name, service);
        config.paths.install_root = self.root.path().join("nodes").join(name);
        configure(&mut config);

        let octet = self.next_octet.get();
        self.next_octet.set(octet.wrapping_add(1));
        let identity = NodeIdentity {
            node_name: local_name.to_string(),
            host_ip: Ipv4Addr::new(10, 0, 0, octet),
        };

        let host = SimulatedHost::new(self.backend.clone(), name);
        self.assemble(name, host, identity, config)
    }

    /// Simule un redémarrage de l'agent: même hôte, état mémoire perdu
    pub fn restart(&self, node: TestNode) -> TestNode {
        self.assemble(&node.name, node.host, node.identity, node.config)
    }

    fn assemble(&self, name: &str, host: SimulatedHost, identity: NodeIdentity, config: AgentConfig) -> TestNode {
        let service = config.service.name.clone().unwrap_or_default();
        let collaborators = Collaborators {
            coordination: Box::new(self.backend.node(name)),
            platform: Box::new(host.clone()),
            artifacts: Box::new(LocalArtifactStore::new(
                config.artifacts.local_dir.clone(),
                &config.artifacts.platform_suffix,
            )),
            engine: Box::new(MustacheEngine),
        };

        TestNode {
            name: name.to_string(),
            layout: InstallLayout::new(config.paths.install_root.clone(), service.clone()),
            agent: ControlLoop::new(collaborators, identity.clone(), service, &config),
            host,
            config,
            identity,
        }
    }
}

impl TestNode {
    /// Un cycle complet (avec reprise au premier appel)
    pub async fn step(&mut self) -> AgentResult<CycleReport> {
        self.agent.step().await
    }

    pub async fn current_version(&self) -> Option<String> {
        self.layout.symlink_version().await
    }

    /// Lit un fichier rendu sous `current/`
    pub fn rendered(&self, relative: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.layout.current_link().join(relative))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_stub::BackendEvent;
    use helios_agent::CyclePhase;

    #[tokio::test]
    async fn test_harness_first_install() {
        let harness = TestHarness::new().unwrap();
        harness
            .publish(&ArchiveFixture::new("svcA", "1.0", serde_json::json!({"port": 5432})).with_tcp_check(5432))
            .unwrap();
        harness.set_version("svcA", "1.0");

        let mut node = harness.node("node-a", "svcA");
        let report = node.step().await.unwrap();

        assert!(report.installed);
        assert!(report.visited(CyclePhase::Release));
        assert_eq!(node.current_version().await.as_deref(), Some("1.0"));
        assert_eq!(
            harness
                .backend
                .count_events(|e| matches!(e, BackendEvent::Acquired { node, .. } if node == "node-a")),
            1
        );
    }
}
