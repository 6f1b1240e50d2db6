//! Health-gated leader election for primary services
//!
//! Per cycle: renew or create a session, then try to acquire the leader key.
//! An existing session is renewed instead of recreated. The session is bound
//! to node liveness plus every check of the service, so any of them going
//! critical makes the backend drop the session and with it the leadership.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coordination::{
    service_checks, Coordination, SessionId, SessionSpec, NODE_LIVENESS_CHECK,
};
use crate::error::{AgentResult, CoordinationError};

pub fn leader_key(service: &str) -> String {
    format!("service/{}/leader", service)
}

pub fn leader_session_name(service: &str) -> String {
    format!("{}-leader", service)
}

/// Where a node records its current leader session
pub fn session_record_key(node: &str, service: &str) -> String {
    format!("sessions/{}/{}", node, service)
}

/// Where an election round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderPhase {
    /// No session could be obtained this round
    NoSession,
    LeaderHeld,
    NotLeader,
}

/// Result of one election round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    /// Session to carry into the next cycle
    pub session: Option<SessionId>,
    /// A new session was created this round
    pub created: bool,
    pub phase: LeaderPhase,
}

impl Election {
    pub fn is_leader(&self) -> bool {
        self.phase == LeaderPhase::LeaderHeld
    }
}

pub struct LeaderElector<'a, C: ?Sized> {
    coordination: &'a C,
    service: &'a str,
    node_name: &'a str,
    session_ttl: Duration,
}

impl<'a, C> LeaderElector<'a, C>
where
    C: Coordination + ?Sized,
{
    pub fn new(coordination: &'a C, service: &'a str, node_name: &'a str, session_ttl: Duration) -> Self {
        Self {
            coordination,
            service,
            node_name,
            session_ttl,
        }
    }

    /// Session recorded for this node/service, if the backend still knows it
    pub async fn recorded_session(&self) -> AgentResult<Option<SessionId>> {
        let record = self
            .coordination
            .kv_get(&session_record_key(self.node_name, self.service), None)
            .await?;
        let Some(id) = record.value.filter(|v| !v.is_empty()).map(SessionId) else {
            return Ok(None);
        };
        Ok(self.coordination.session_info(&id).await?.map(|entry| entry.id))
    }

    /// One election round with the session carried over from last cycle
    pub async fn elect(&self, current: Option<SessionId>) -> AgentResult<Election> {
        let (session, created) = match current {
            Some(id) if self.coordination.session_renew(&id).await? => {
                debug!("Renewed leader session {}", id);
                (id, false)
            }
            stale => {
                if let Some(id) = stale {
                    info!("Leader session {} is gone, creating a new one", id);
                }
                match self.create_session().await? {
                    Some(id) => (id, true),
                    None => {
                        return Ok(Election {
                            session: None,
                            created: false,
                            phase: LeaderPhase::NoSession,
                        })
                    }
                }
            }
        };

        let acquired = self
            .coordination
            .kv_put(&leader_key(self.service), self.node_name, Some(&session))
            .await?;
        let phase = if acquired {
            debug!("{} holds leadership of {}", self.node_name, self.service);
            LeaderPhase::LeaderHeld
        } else {
            LeaderPhase::NotLeader
        };

        Ok(Election {
            session: Some(session),
            created,
            phase,
        })
    }

    /// Destroy a session superseded by a new service generation
    pub async fn step_down(&self, session: &SessionId) -> AgentResult<()> {
        info!("Destroying leader session {} for {}", session, self.service);
        self.coordination.session_destroy(session).await?;
        Ok(())
    }

    /// `None` when the backend refuses the session (a bound check is critical)
    async fn create_session(&self) -> AgentResult<Option<SessionId>> {
        let checks = self.coordination.agent_checks().await?;
        let mut bound = vec![NODE_LIVENESS_CHECK.to_string()];
        let mut service_ids: Vec<String> = service_checks(&checks, self.service)
            .map(|c| c.check_id.clone())
            .collect();
        service_ids.sort();
        bound.extend(service_ids);

        let spec = SessionSpec {
            name: leader_session_name(self.service),
            ttl: self.session_ttl,
            lock_delay: Duration::ZERO,
            checks: Some(bound),
        };

        let id = match self.coordination.session_create(&spec).await {
            Ok(id) => id,
            Err(CoordinationError::Rejected(reason)) => {
                warn!("Leader session for {} refused: {}", self.service, reason);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.coordination
            .kv_put(&session_record_key(self.node_name, self.service), id.as_str(), None)
            .await?;
        info!("Created leader session {} for {}", id, self.service);
        Ok(Some(id))
    }
}
