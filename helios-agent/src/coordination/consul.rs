//! Consul HTTP API client
//!
//! Maps the [`Coordination`] operations onto `/v1/kv`, `/v1/session` and
//! `/v1/agent`. KV values travel base64-encoded; blocking reads pass the
//! `X-Consul-Index` of the previous answer back as `?index=`.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::{
    AgentCheck, AgentService, CheckDefinition, CheckProbe, CheckStatus, Coordination, KvEntry,
    KvRead, SessionEntry, SessionId, SessionSpec,
};
use crate::config::BackendConfig;
use crate::error::CoordinationError;

#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
    blocking_wait_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ConsulKv {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreateBody<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    lock_delay: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConsulSession {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Node", default)]
    node: String,
    #[serde(rename = "Name", default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ConsulCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Status")]
    status: CheckStatus,
    #[serde(rename = "ServiceName", default)]
    service_name: String,
}

#[derive(Debug, Deserialize)]
struct ConsulService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AgentSelf {
    #[serde(rename = "Config")]
    config: AgentSelfConfig,
}

#[derive(Debug, Deserialize)]
struct AgentSelfConfig {
    #[serde(rename = "NodeName")]
    node_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegisterBody<'a> {
    name: &'a str,
    tags: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckRegisterBody<'a> {
    name: &'a str,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
    interval: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<&'a str>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    tcp: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Vec<String>>,
}

impl<'a> CheckRegisterBody<'a> {
    fn from_definition(check: &'a CheckDefinition) -> Self {
        let mut body = CheckRegisterBody {
            name: &check.name,
            service_id: &check.service_id,
            interval: &check.interval,
            timeout: check.timeout.as_deref(),
            tcp: None,
            http: None,
            args: None,
        };
        match &check.probe {
            CheckProbe::Tcp { host, port } => body.tcp = Some(format!("{}:{}", host, port)),
            CheckProbe::Http { url } => body.http = Some(url),
            CheckProbe::Script { command } => {
                body.args = Some(vec!["/bin/sh".to_string(), "-c".to_string(), command.clone()])
            }
        }
        body
    }
}

impl ConsulClient {
    pub fn new(config: &BackendConfig) -> Result<Self, CoordinationError> {
        let http = reqwest::Client::builder()
            .user_agent("helios-agent")
            .build()?;

        Ok(Self {
            http,
            base_url: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            blocking_wait_secs: config.blocking_wait_secs,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1/{}", self.base_url, path);
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }

    /// Same as `request` for datacenter-scoped endpoints (kv, session)
    fn scoped(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.request(method, path);
        match &self.datacenter {
            Some(dc) => req.query(&[("dc", dc)]),
            None => req,
        }
    }

    async fn ensure_success(response: Response, path: &str) -> Result<Response, CoordinationError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(CoordinationError::Status {
            status,
            path: path.to_string(),
            body,
        })
    }

    async fn send(&self, req: RequestBuilder, path: &str) -> Result<Response, CoordinationError> {
        let response = req.send().await?;
        Self::ensure_success(response, path).await
    }

    fn consul_index(response: &Response) -> u64 {
        response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn decode_value(encoded: &str) -> Result<String, CoordinationError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CoordinationError::Decode(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| CoordinationError::Decode(e.to_string()))
    }

    fn entry(session: ConsulSession) -> SessionEntry {
        SessionEntry {
            id: SessionId(session.id),
            node: session.node,
            name: session.name,
        }
    }
}

#[async_trait]
impl Coordination for ConsulClient {
    async fn kv_get(&self, key: &str, index: Option<u64>) -> Result<KvRead, CoordinationError> {
        let path = format!("kv/{}", key);
        let mut req = self.scoped(Method::GET, &path);
        if let Some(index) = index {
            req = req.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", self.blocking_wait_secs)),
            ]);
        }

        let response = req.send().await?;
        let index = Self::consul_index(&response);
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(KvRead { index, value: None });
        }

        let response = Self::ensure_success(response, &path).await?;
        let entries: Vec<ConsulKv> = response.json().await?;
        let value = match entries.into_iter().next().and_then(|e| e.value) {
            Some(encoded) => Some(Self::decode_value(&encoded)?),
            None => None,
        };
        Ok(KvRead { index, value })
    }

    async fn kv_put(
        &self,
        key: &str,
        value: &str,
        acquire: Option<&SessionId>,
    ) -> Result<bool, CoordinationError> {
        let path = format!("kv/{}", key);
        let mut req = self.scoped(Method::PUT, &path).body(value.to_string());
        if let Some(session) = acquire {
            req = req.query(&[("acquire", session.as_str())]);
        }
        let response = self.send(req, &path).await?;
        Ok(response.json::<bool>().await?)
    }

    async fn kv_get_recursive(&self, prefix: &str) -> Result<Vec<KvEntry>, CoordinationError> {
        let path = format!("kv/{}", prefix);
        let response = self
            .scoped(Method::GET, &path)
            .query(&[("recurse", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let response = Self::ensure_success(response, &path).await?;
        let entries: Vec<ConsulKv> = response.json().await?;
        entries
            .into_iter()
            .map(|e| {
                let value = match e.value {
                    Some(encoded) => Self::decode_value(&encoded)?,
                    None => String::new(),
                };
                Ok(KvEntry { key: e.key, value })
            })
            .collect()
    }

    async fn session_create(&self, spec: &SessionSpec) -> Result<SessionId, CoordinationError> {
        let body = SessionCreateBody {
            name: &spec.name,
            ttl: format!("{}s", spec.ttl.as_secs()),
            lock_delay: format!("{}s", spec.lock_delay.as_secs()),
            checks: spec.checks.as_deref(),
        };
        let req = self.scoped(Method::PUT, "session/create").json(&body);
        let response = self.send(req, "session/create").await.map_err(|e| match e {
            // a session bound to a critical check is refused with a 500
            CoordinationError::Status { body, .. } if body.contains("critical") => {
                CoordinationError::Rejected(body)
            }
            other => other,
        })?;
        let created: SessionCreated = response.json().await?;
        debug!("Created session {} ({})", created.id, spec.name);
        Ok(SessionId(created.id))
    }

    async fn session_destroy(&self, id: &SessionId) -> Result<(), CoordinationError> {
        let path = format!("session/destroy/{}", id);
        self.send(self.scoped(Method::PUT, &path), &path).await?;
        Ok(())
    }

    async fn session_renew(&self, id: &SessionId) -> Result<bool, CoordinationError> {
        let path = format!("session/renew/{}", id);
        let response = self.scoped(Method::PUT, &path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::ensure_success(response, &path).await?;
        Ok(true)
    }

    async fn session_list(&self) -> Result<Vec<SessionEntry>, CoordinationError> {
        let response = self.send(self.scoped(Method::GET, "session/list"), "session/list").await?;
        let sessions: Vec<ConsulSession> = response.json().await?;
        Ok(sessions.into_iter().map(Self::entry).collect())
    }

    async fn session_info(&self, id: &SessionId) -> Result<Option<SessionEntry>, CoordinationError> {
        let path = format!("session/info/{}", id);
        let response = self.send(self.scoped(Method::GET, &path), &path).await?;
        let sessions: Option<Vec<ConsulSession>> = response.json().await?;
        Ok(sessions.and_then(|s| s.into_iter().next()).map(Self::entry))
    }

    async fn agent_maintenance(&self, enable: bool, reason: &str) -> Result<(), CoordinationError> {
        let req = self
            .request(Method::PUT, "agent/maintenance")
            .query(&[("enable", if enable { "true" } else { "false" }), ("reason", reason)]);
        self.send(req, "agent/maintenance").await?;
        Ok(())
    }

    async fn agent_checks(&self) -> Result<HashMap<String, AgentCheck>, CoordinationError> {
        let response = self.send(self.request(Method::GET, "agent/checks"), "agent/checks").await?;
        let checks: HashMap<String, ConsulCheck> = response.json().await?;
        Ok(checks
            .into_iter()
            .map(|(id, c)| {
                (
                    id,
                    AgentCheck {
                        check_id: c.check_id,
                        name: c.name,
                        service_name: c.service_name,
                        status: c.status,
                    },
                )
            })
            .collect())
    }

    async fn agent_services(&self) -> Result<HashMap<String, AgentService>, CoordinationError> {
        let response = self
            .send(self.request(Method::GET, "agent/services"), "agent/services")
            .await?;
        let services: HashMap<String, ConsulService> = response.json().await?;
        Ok(services
            .into_iter()
            .map(|(id, s)| {
                (
                    id,
                    AgentService {
                        id: s.id,
                        service: s.service,
                        tags: s.tags.unwrap_or_default(),
                    },
                )
            })
            .collect())
    }

    async fn agent_service_register(&self, name: &str, tags: &[String]) -> Result<(), CoordinationError> {
        let body = ServiceRegisterBody { name, tags };
        let req = self.request(Method::PUT, "agent/service/register").json(&body);
        self.send(req, "agent/service/register").await?;
        Ok(())
    }

    async fn agent_check_register(&self, check: &CheckDefinition) -> Result<(), CoordinationError> {
        let body = CheckRegisterBody::from_definition(check);
        let req = self.request(Method::PUT, "agent/check/register").json(&body);
        self.send(req, "agent/check/register").await?;
        Ok(())
    }

    async fn agent_node_name(&self) -> Result<String, CoordinationError> {
        let response = self.send(self.request(Method::GET, "agent/self"), "agent/self").await?;
        let agent: AgentSelf = response.json().await?;
        Ok(agent.config.node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_value() {
        assert_eq!(ConsulClient::decode_value("Mi4w").unwrap(), "2.0");
        assert!(ConsulClient::decode_value("not base64!").is_err());
    }

    #[test]
    fn test_check_body_wire_format() {
        let check = CheckDefinition {
            name: "svcA-tcp".to_string(),
            service_id: "svcA".to_string(),
            interval: "10s".to_string(),
            timeout: Some("1s".to_string()),
            probe: CheckProbe::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
        };
        let json = serde_json::to_value(CheckRegisterBody::from_definition(&check)).unwrap();
        assert_eq!(json["TCP"], "127.0.0.1:8080");
        assert_eq!(json["ServiceID"], "svcA");
        assert!(json.get("HTTP").is_none());
        assert!(json.get("Args").is_none());
    }

    #[test]
    fn test_agent_self_node_name() {
        let json = r#"{"Config": {"Datacenter": "dc1", "NodeName": "cn-7", "NodeID": "abc"}, "Member": {}}"#;
        let agent: AgentSelf = serde_json::from_str(json).unwrap();
        assert_eq!(agent.config.node_name, "cn-7");
    }

    #[test]
    fn test_session_body_omits_default_checks() {
        let body = SessionCreateBody {
            name: "svcA-upgrade",
            ttl: "3600s".to_string(),
            lock_delay: "0s".to_string(),
            checks: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["TTL"], "3600s");
        assert_eq!(json["LockDelay"], "0s");
        assert!(json.get("Checks").is_none());
    }
}
