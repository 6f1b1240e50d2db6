/*!
Backend de coordination simulé, en mémoire

Permet de faire tourner plusieurs agents sans cluster réel:
- KV avec acquisition par session (un seul détenteur par clé)
- Sessions TTL liées à des checks: un check critique invalide la session
- Vue agent par nœud (checks, services, mode maintenance)
- Journal des événements pour les assertions de tests
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use helios_agent::coordination::{
    AgentCheck, AgentService, CheckDefinition, CheckStatus, Coordination, KvEntry, KvRead,
    SessionEntry, SessionId, SessionSpec, NODE_LIVENESS_CHECK,
};
use helios_agent::CoordinationError;

/// Événement enregistré par le backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    SessionCreated { node: String, name: String, id: SessionId },
    SessionDestroyed { node: String, name: String, id: SessionId },
    Acquired { key: String, node: String },
    Released { key: String, node: String },
    Maintenance { node: String, enabled: bool },
    ServiceRegistered { node: String, service: String, tags: Vec<String> },
}

#[derive(Debug, Clone)]
struct KvRecord {
    value: String,
    holder: Option<SessionId>,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    node: String,
    name: String,
    checks: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct UnitState {
    running: bool,
    healthy: bool,
}

impl Default for UnitState {
    fn default() -> Self {
        Self {
            running: false,
            healthy: true,
        }
    }
}

#[derive(Debug, Default)]
struct NodeState {
    checks: HashMap<String, AgentCheck>,
    services: HashMap<String, AgentService>,
    units: HashMap<String, UnitState>,
    maintenance: bool,
    registered_checks: Vec<CheckDefinition>,
}

#[derive(Debug, Default)]
struct BackendState {
    kv: BTreeMap<String, KvRecord>,
    index: u64,
    sessions: BTreeMap<SessionId, SessionRecord>,
    next_session: u64,
    nodes: HashMap<String, NodeState>,
    events: Vec<BackendEvent>,
}

impl BackendState {
    fn node(&mut self, node: &str) -> &mut NodeState {
        self.nodes.entry(node.to_string()).or_default()
    }

    /// Détruit une session et libère les clés qu'elle détenait
    fn destroy_session(&mut self, id: &SessionId) -> bool {
        let Some(record) = self.sessions.remove(id) else {
            return false;
        };
        let mut released = Vec::new();
        for (key, entry) in self.kv.iter_mut() {
            if entry.holder.as_ref() == Some(id) {
                entry.holder = None;
                released.push(key.clone());
            }
        }
        if !released.is_empty() {
            self.index += 1;
        }
        for key in released {
            self.events.push(BackendEvent::Released {
                key,
                node: record.node.clone(),
            });
        }
        self.events.push(BackendEvent::SessionDestroyed {
            node: record.node,
            name: record.name,
            id: id.clone(),
        });
        true
    }

    /// Invalide les sessions du nœud liées à `check_id`
    fn invalidate_bound(&mut self, node: &str, check_id: &str) {
        let doomed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.node == node && s.checks.iter().any(|c| c == check_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in doomed {
            log::info!("[SIM] Session {} invalidated by critical check {}", id, check_id);
            self.destroy_session(&id);
        }
    }

    /// Recalcule le statut des checks d'un service à partir de l'état de l'unité
    fn refresh_checks(&mut self, node: &str, service: &str) {
        let unit = self.node(node).units.get(service).copied().unwrap_or_default();
        let status = unit_status(unit);
        let mut went_critical = Vec::new();
        for check in self.node(node).checks.values_mut() {
            if check.service_name == service && check.status != status {
                check.status = status;
                if status == CheckStatus::Critical {
                    went_critical.push(check.check_id.clone());
                }
            }
        }
        for check_id in went_critical {
            self.invalidate_bound(node, &check_id);
        }
    }
}

fn unit_status(unit: UnitState) -> CheckStatus {
    if unit.running && unit.healthy {
        CheckStatus::Passing
    } else {
        CheckStatus::Critical
    }
}

/// Backend partagé entre tous les nœuds d'un test
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vue d'un nœud, implémente [`Coordination`]
    pub fn node(&self, node: &str) -> NodeHandle {
        self.state.lock().node(node);
        NodeHandle {
            backend: self.clone(),
            node: node.to_string(),
        }
    }

    /// Écrit une clé directement (état désiré publié par l'opérateur)
    pub fn put(&self, key: &str, value: &str) {
        let mut state = self.state.lock();
        state.index += 1;
        let holder = state.kv.get(key).and_then(|e| e.holder.clone());
        state.kv.insert(
            key.to_string(),
            KvRecord {
                value: value.to_string(),
                holder,
            },
        );
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().kv.get(key).map(|e| e.value.clone())
    }

    /// Nœud propriétaire de la session qui détient `key`
    pub fn holder(&self, key: &str) -> Option<String> {
        let state = self.state.lock();
        let session = state.kv.get(key)?.holder.as_ref()?;
        state.sessions.get(session).map(|s| s.node.clone())
    }

    pub fn sessions_named(&self, name: &str) -> Vec<SessionId> {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|(_, s)| s.name == name)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Simule l'expiration TTL d'une session
    pub fn expire_session(&self, id: &SessionId) -> bool {
        self.state.lock().destroy_session(id)
    }

    /// Simule une panne de nœud: toutes ses sessions tombent
    pub fn fail_node(&self, node: &str) {
        let mut state = self.state.lock();
        let doomed: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.node == node)
            .map(|(id, _)| id.clone())
            .collect();
        for id in doomed {
            state.destroy_session(&id);
        }
    }

    /// Démarre ou arrête l'unité du service sur le nœud
    pub fn set_unit_running(&self, node: &str, service: &str, running: bool) {
        let mut state = self.state.lock();
        state.node(node).units.entry(service.to_string()).or_default().running = running;
        state.refresh_checks(node, service);
    }

    /// Rend le service malade (ou le guérit) sans toucher à l'unité
    pub fn set_unit_healthy(&self, node: &str, service: &str, healthy: bool) {
        let mut state = self.state.lock();
        state.node(node).units.entry(service.to_string()).or_default().healthy = healthy;
        state.refresh_checks(node, service);
    }

    pub fn in_maintenance(&self, node: &str) -> bool {
        self.state.lock().node(node).maintenance
    }

    pub fn published_tags(&self, node: &str, service: &str) -> Vec<String> {
        self.state
            .lock()
            .node(node)
            .services
            .get(service)
            .map(|s| s.tags.clone())
            .unwrap_or_default()
    }

    pub fn registered_checks(&self, node: &str) -> Vec<CheckDefinition> {
        self.state.lock().node(node).registered_checks.clone()
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&BackendEvent) -> bool,
    {
        self.state.lock().events.iter().filter(|e| predicate(e)).count()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

/// Accès au backend vu depuis un nœud donné
#[derive(Clone)]
pub struct NodeHandle {
    backend: SimulatedBackend,
    node: String,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.node
    }

    pub fn backend(&self) -> &SimulatedBackend {
        &self.backend
    }
}

#[async_trait]
impl Coordination for NodeHandle {
    async fn kv_get(&self, key: &str, _index: Option<u64>) -> Result<KvRead, CoordinationError> {
        let state = self.backend.state.lock();
        Ok(KvRead {
            index: state.index,
            value: state.kv.get(key).map(|e| e.value.clone()),
        })
    }

    async fn kv_put(
        &self,
        key: &str,
        value: &str,
        acquire: Option<&SessionId>,
    ) -> Result<bool, CoordinationError> {
        let mut state = self.backend.state.lock();
        let Some(session) = acquire else {
            state.index += 1;
            let holder = state.kv.get(key).and_then(|e| e.holder.clone());
            state.kv.insert(
                key.to_string(),
                KvRecord {
                    value: value.to_string(),
                    holder,
                },
            );
            return Ok(true);
        };

        if !state.sessions.contains_key(session) {
            return Err(CoordinationError::SessionNotFound(session.to_string()));
        }
        let current = state.kv.get(key).and_then(|e| e.holder.clone());
        match current {
            Some(holder) if &holder != session => Ok(false),
            previous => {
                state.index += 1;
                state.kv.insert(
                    key.to_string(),
                    KvRecord {
                        value: value.to_string(),
                        holder: Some(session.clone()),
                    },
                );
                if previous.is_none() {
                    state.events.push(BackendEvent::Acquired {
                        key: key.to_string(),
                        node: self.node.clone(),
                    });
                }
                Ok(true)
            }
        }
    }

    async fn kv_get_recursive(&self, prefix: &str) -> Result<Vec<KvEntry>, CoordinationError> {
        let state = self.backend.state.lock();
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KvEntry {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn session_create(&self, spec: &SessionSpec) -> Result<SessionId, CoordinationError> {
        let mut state = self.backend.state.lock();
        let checks = spec
            .checks
            .clone()
            .unwrap_or_else(|| vec![NODE_LIVENESS_CHECK.to_string()]);

        for check_id in checks.iter().filter(|c| c.as_str() != NODE_LIVENESS_CHECK) {
            match state.node(&self.node).checks.get(check_id) {
                None => {
                    return Err(CoordinationError::Status {
                        status: 500,
                        path: "/v1/session/create".to_string(),
                        body: format!("Check '{}' is not registered", check_id),
                    })
                }
                Some(check) if check.status == CheckStatus::Critical => {
                    return Err(CoordinationError::Rejected(format!(
                        "Check '{}' is in critical state",
                        check_id
                    )))
                }
                Some(_) => {}
            }
        }

        state.next_session += 1;
        let id = SessionId(format!("sim-{:04}-{}", state.next_session, self.node));
        state.sessions.insert(
            id.clone(),
            SessionRecord {
                node: self.node.clone(),
                name: spec.name.clone(),
                checks,
            },
        );
        state.events.push(BackendEvent::SessionCreated {
            node: self.node.clone(),
            name: spec.name.clone(),
            id: id.clone(),
        });
        Ok(id)
    }

    async fn session_destroy(&self, id: &SessionId) -> Result<(), CoordinationError> {
        self.backend.state.lock().destroy_session(id);
        Ok(())
    }

    async fn session_renew(&self, id: &SessionId) -> Result<bool, CoordinationError> {
        Ok(self.backend.state.lock().sessions.contains_key(id))
    }

    async fn session_list(&self) -> Result<Vec<SessionEntry>, CoordinationError> {
        let state = self.backend.state.lock();
        Ok(state
            .sessions
            .iter()
            .map(|(id, s)| SessionEntry {
                id: id.clone(),
                node: s.node.clone(),
                name: s.name.clone(),
            })
            .collect())
    }

    async fn session_info(&self, id: &SessionId) -> Result<Option<SessionEntry>, CoordinationError> {
        let state = self.backend.state.lock();
        Ok(state.sessions.get(id).map(|s| SessionEntry {
            id: id.clone(),
            node: s.node.clone(),
            name: s.name.clone(),
        }))
    }

    async fn agent_maintenance(&self, enable: bool, _reason: &str) -> Result<(), CoordinationError> {
        let mut state = self.backend.state.lock();
        state.node(&self.node).maintenance = enable;
        state.events.push(BackendEvent::Maintenance {
            node: self.node.clone(),
            enabled: enable,
        });
        Ok(())
    }

    async fn agent_checks(&self) -> Result<HashMap<String, AgentCheck>, CoordinationError> {
        Ok(self.backend.state.lock().node(&self.node).checks.clone())
    }

    async fn agent_services(&self) -> Result<HashMap<String, AgentService>, CoordinationError> {
        Ok(self.backend.state.lock().node(&self.node).services.clone())
    }

    async fn agent_service_register(&self, name: &str, tags: &[String]) -> Result<(), CoordinationError> {
        let mut state = self.backend.state.lock();
        state.node(&self.node).services.insert(
            name.to_string(),
            AgentService {
                id: name.to_string(),
                service: name.to_string(),
                tags: tags.to_vec(),
            },
        );
        state.events.push(BackendEvent::ServiceRegistered {
            node: self.node.clone(),
            service: name.to_string(),
            tags: tags.to_vec(),
        });
        Ok(())
    }

    async fn agent_check_register(&self, check: &CheckDefinition) -> Result<(), CoordinationError> {
        let mut state = self.backend.state.lock();
        let node = state.node(&self.node);
        let unit = node.units.get(&check.service_id).copied().unwrap_or_default();
        node.checks.insert(
            check.name.clone(),
            AgentCheck {
                check_id: check.name.clone(),
                name: check.name.clone(),
                service_name: check.service_id.clone(),
                status: unit_status(unit),
            },
        );
        node.registered_checks.retain(|c| c.name != check.name);
        node.registered_checks.push(check.clone());
        Ok(())
    }

    async fn agent_node_name(&self) -> Result<String, CoordinationError> {
        Ok(self.node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(name: &str, checks: Option<Vec<String>>) -> SessionSpec {
        SessionSpec {
            name: name.to_string(),
            ttl: Duration::from_secs(60),
            lock_delay: Duration::ZERO,
            checks,
        }
    }

    #[tokio::test]
    async fn test_single_holder_per_key() {
        let backend = SimulatedBackend::new();
        let a = backend.node("node-a");
        let b = backend.node("node-b");

        let sa = a.session_create(&spec("svcA-upgrade", None)).await.unwrap();
        let sb = b.session_create(&spec("svcA-upgrade", None)).await.unwrap();

        assert!(a.kv_put("service/svcA/upgrade", "node-a", Some(&sa)).await.unwrap());
        assert!(!b.kv_put("service/svcA/upgrade", "node-b", Some(&sb)).await.unwrap());
        assert_eq!(backend.holder("service/svcA/upgrade").as_deref(), Some("node-a"));

        a.session_destroy(&sa).await.unwrap();
        assert_eq!(backend.holder("service/svcA/upgrade"), None);
        assert!(b.kv_put("service/svcA/upgrade", "node-b", Some(&sb)).await.unwrap());
    }

    #[tokio::test]
    async fn test_critical_check_invalidates_bound_session() {
        let backend = SimulatedBackend::new();
        let a = backend.node("node-a");
        backend.set_unit_running("node-a", "svcA", true);
        a.agent_check_register(&CheckDefinition {
            name: "svcA-port".to_string(),
            service_id: "svcA".to_string(),
            interval: "10s".to_string(),
            timeout: None,
            probe: helios_agent::coordination::CheckProbe::Tcp {
                host: "localhost".to_string(),
                port: 5432,
            },
        })
        .await
        .unwrap();

        let bound = Some(vec![NODE_LIVENESS_CHECK.to_string(), "svcA-port".to_string()]);
        let session = a.session_create(&spec("svcA-leader", bound.clone())).await.unwrap();
        assert!(a.kv_put("service/svcA/leader", "node-a", Some(&session)).await.unwrap());

        backend.set_unit_healthy("node-a", "svcA", false);
        assert!(!a.session_renew(&session).await.unwrap());
        assert_eq!(backend.holder("service/svcA/leader"), None);

        // critical bound check refuses new sessions
        assert!(matches!(
            a.session_create(&spec("svcA-leader", bound)).await,
            Err(CoordinationError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_recursive_read_is_prefix_scoped() {
        let backend = SimulatedBackend::new();
        backend.put("svcA/config/port", "5433");
        backend.put("svcA/config/mode", "fast");
        backend.put("svcA/version", "1.0");
        backend.put("svcB/config/port", "1");

        let entries = backend.node("node-a").kv_get_recursive("svcA/config/").await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["svcA/config/mode", "svcA/config/port"]);
    }
}
