//! Typed facade over the coordination backend
//!
//! Everything above this module talks to the backend through the
//! [`Coordination`] trait:
//! - Key/value reads (blocking queries), writes and session-bound acquires
//! - Session lifecycle (create, destroy, renew, list, info)
//! - Local agent view: maintenance mode, checks, services, registrations
//!
//! The production implementation is [`consul::ConsulClient`]. Tests use the
//! simulated backend from `helios-devkit`.

pub mod consul;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::CoordinationError;

pub use consul::ConsulClient;

/// Check id of the backend's built-in node liveness check
pub const NODE_LIVENESS_CHECK: &str = "serfHealth";

/// Opaque session identifier handed out by the backend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters for a new session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSpec {
    pub name: String,
    pub ttl: Duration,
    pub lock_delay: Duration,
    /// Health checks the session is bound to. `None` keeps the backend
    /// default, which is node liveness only.
    pub checks: Option<Vec<String>>,
}

/// One session as listed by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub id: SessionId,
    pub node: String,
    pub name: String,
}

/// Result of a (possibly blocking) key read
#[derive(Debug, Clone, PartialEq)]
pub struct KvRead {
    pub index: u64,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    #[serde(other)]
    Unknown,
}

/// A health check as seen by the local agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCheck {
    pub check_id: String,
    pub name: String,
    pub service_name: String,
    pub status: CheckStatus,
}

/// A service as registered with the local agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentService {
    pub id: String,
    pub service: String,
    pub tags: Vec<String>,
}

/// How a registered check probes the service
#[derive(Debug, Clone, PartialEq)]
pub enum CheckProbe {
    Tcp { host: String, port: u16 },
    Http { url: String },
    Script { command: String },
}

/// A check ready to be registered with the local agent
#[derive(Debug, Clone, PartialEq)]
pub struct CheckDefinition {
    pub name: String,
    pub service_id: String,
    pub interval: String,
    pub timeout: Option<String>,
    pub probe: CheckProbe,
}

/// Backend operations used by the agent
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Read one key. With `index` set the backend may block until the key
    /// changes past that index.
    async fn kv_get(&self, key: &str, index: Option<u64>) -> Result<KvRead, CoordinationError>;

    /// Write a key, optionally acquiring it with `session`. Returns whether
    /// the write (and the acquire) succeeded.
    async fn kv_put(
        &self,
        key: &str,
        value: &str,
        acquire: Option<&SessionId>,
    ) -> Result<bool, CoordinationError>;

    async fn kv_get_recursive(&self, prefix: &str) -> Result<Vec<KvEntry>, CoordinationError>;

    async fn session_create(&self, spec: &SessionSpec) -> Result<SessionId, CoordinationError>;

    async fn session_destroy(&self, id: &SessionId) -> Result<(), CoordinationError>;

    /// Renew a TTL session. `Ok(false)` means the session no longer exists.
    async fn session_renew(&self, id: &SessionId) -> Result<bool, CoordinationError>;

    async fn session_list(&self) -> Result<Vec<SessionEntry>, CoordinationError>;

    async fn session_info(&self, id: &SessionId) -> Result<Option<SessionEntry>, CoordinationError>;

    async fn agent_maintenance(&self, enable: bool, reason: &str) -> Result<(), CoordinationError>;

    async fn agent_checks(&self) -> Result<HashMap<String, AgentCheck>, CoordinationError>;

    async fn agent_services(&self) -> Result<HashMap<String, AgentService>, CoordinationError>;

    async fn agent_service_register(&self, name: &str, tags: &[String]) -> Result<(), CoordinationError>;

    async fn agent_check_register(&self, check: &CheckDefinition) -> Result<(), CoordinationError>;

    /// Node name the backend stamps on this agent's sessions
    async fn agent_node_name(&self) -> Result<String, CoordinationError>;
}

/// Read a key that must exist, blocking until it does.
///
/// Uses the backend's blocking index so a real backend parks the request
/// server-side; `retry` only paces backends that answer immediately.
pub async fn read_required_key<C>(
    coordination: &C,
    key: &str,
    retry: Duration,
) -> Result<String, CoordinationError>
where
    C: Coordination + ?Sized,
{
    let mut index = None;
    loop {
        let read = coordination.kv_get(key, index).await?;
        if let Some(value) = read.value {
            return Ok(value);
        }
        debug!("Required key {} not present yet (index {})", key, read.index);
        index = Some(read.index);
        tokio::time::sleep(retry).await;
    }
}

/// Checks registered for `service`
pub fn service_checks<'a>(
    checks: &'a HashMap<String, AgentCheck>,
    service: &'a str,
) -> impl Iterator<Item = &'a AgentCheck> + 'a {
    checks.values().filter(move |c| c.service_name == service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// Backend holding a single key that shows up at some point
    #[derive(Default)]
    struct LateKey {
        value: Mutex<Option<String>>,
        reads: AtomicU64,
    }

    #[async_trait]
    impl Coordination for LateKey {
        async fn kv_get(&self, _key: &str, _index: Option<u64>) -> Result<KvRead, CoordinationError> {
            let index = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(KvRead {
                index,
                value: self.value.lock().unwrap().clone(),
            })
        }

        async fn kv_put(&self, _: &str, value: &str, _: Option<&SessionId>) -> Result<bool, CoordinationError> {
            *self.value.lock().unwrap() = Some(value.to_string());
            Ok(true)
        }

        async fn kv_get_recursive(&self, _: &str) -> Result<Vec<KvEntry>, CoordinationError> {
            Ok(Vec::new())
        }

        async fn session_create(&self, _: &SessionSpec) -> Result<SessionId, CoordinationError> {
            unimplemented!()
        }

        async fn session_destroy(&self, _: &SessionId) -> Result<(), CoordinationError> {
            unimplemented!()
        }

        async fn session_renew(&self, _: &SessionId) -> Result<bool, CoordinationError> {
            unimplemented!()
        }

        async fn session_list(&self) -> Result<Vec<SessionEntry>, CoordinationError> {
            unimplemented!()
        }

        async fn session_info(&self, _: &SessionId) -> Result<Option<SessionEntry>, CoordinationError> {
            unimplemented!()
        }

        async fn agent_maintenance(&self, _: bool, _: &str) -> Result<(), CoordinationError> {
            unimplemented!()
        }

        async fn agent_checks(&self) -> Result<HashMap<String, AgentCheck>, CoordinationError> {
            unimplemented!()
        }

        async fn agent_services(&self) -> Result<HashMap<String, AgentService>, CoordinationError> {
            unimplemented!()
        }

        async fn agent_service_register(&self, _: &str, _: &[String]) -> Result<(), CoordinationError> {
            unimplemented!()
        }

        async fn agent_check_register(&self, _: &CheckDefinition) -> Result<(), CoordinationError> {
            unimplemented!()
        }

        async fn agent_node_name(&self) -> Result<String, CoordinationError> {
            Ok("node-a".to_string())
        }
    }

    #[tokio::test]
    async fn test_required_key_blocks_until_published() {
        let backend = Arc::new(LateKey::default());
        let retry = Duration::from_millis(5);

        // nothing published: the read keeps waiting
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            read_required_key(&*backend, "svcA/version", retry),
        )
        .await;
        assert!(pending.is_err());
        assert!(backend.reads.load(Ordering::SeqCst) > 1);

        let publisher = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                backend.kv_put("svcA/version", "2.0", None).await.unwrap();
            })
        };

        let value = tokio::time::timeout(
            Duration::from_secs(2),
            read_required_key(&*backend, "svcA/version", retry),
        )
        .await
        .expect("key was published")
        .unwrap();
        assert_eq!(value, "2.0");
        publisher.await.unwrap();
    }

    fn check(id: &str, service: &str, status: CheckStatus) -> (String, AgentCheck) {
        (
            id.to_string(),
            AgentCheck {
                check_id: id.to_string(),
                name: id.to_string(),
                service_name: service.to_string(),
                status,
            },
        )
    }

    #[test]
    fn test_service_checks_filters_by_service() {
        let checks: HashMap<_, _> = [
            check("a", "svcA", CheckStatus::Passing),
            check("b", "svcB", CheckStatus::Critical),
            check("serfHealth", "", CheckStatus::Passing),
        ]
        .into_iter()
        .collect();

        let ids: Vec<_> = service_checks(&checks, "svcA").map(|c| c.check_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_check_status_parses_unknown() {
        let status: CheckStatus = serde_json::from_str("\"maintenance\"").unwrap();
        assert_eq!(status, CheckStatus::Unknown);
        let status: CheckStatus = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(status, CheckStatus::Critical);
    }
}
