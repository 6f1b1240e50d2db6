//! Fleet-wide serialized upgrades
//!
//! Sequence for one upgrade:
//! 1. Reuse the session of a lease still held from an earlier attempt, or
//!    destroy this node's stale `<service>-upgrade` sessions and create one
//! 2. Spin on `service/<service>/upgrade` until the acquire succeeds
//! 3. Drain: maintenance on, routing status down, optional DNS drain wait
//! 4. Stop the running unit and wait for it to report down
//! 5. Fetch, extract, repoint `current`, run the install hook
//!
//! Steps 1-2 are [`UpgradeCoordinator::lock`] and hand out the
//! [`UpgradeLease`] before anything on the node changes, so a failure in
//! steps 3-5 still leaves the caller holding it. The lease is given back by
//! [`UpgradeCoordinator::release`] only once the node is healthy again.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::coordination::{Coordination, SessionId, SessionSpec};
use crate::error::{AgentError, AgentResult};
use crate::execution::{Platform, RoutingStatus};
use crate::health::HealthWaiter;
use crate::layout::InstallLayout;
use crate::stats::ConvergenceStats;

pub const MAINTENANCE_REASON: &str = "upgrade";

pub fn upgrade_lock_key(service: &str) -> String {
    format!("service/{}/upgrade", service)
}

pub fn upgrade_session_name(service: &str) -> String {
    format!("{}-upgrade", service)
}

/// Proof that this node holds the upgrade lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeLease {
    pub session: SessionId,
    /// Whether the node was taken out of service and must re-enter it
    pub drained: bool,
}

#[derive(Debug, Clone)]
pub struct UpgradeSettings {
    pub session_ttl: Duration,
    pub lock_retry: Duration,
    pub poll_interval: Duration,
    pub dns_name: Option<String>,
}

pub struct UpgradeCoordinator<'a, C: ?Sized> {
    pub coordination: &'a C,
    pub platform: &'a dyn Platform,
    pub artifacts: &'a dyn ArtifactStore,
    pub layout: &'a InstallLayout,
    pub stats: &'a ConvergenceStats,
    pub node_name: &'a str,
    pub host_ip: Ipv4Addr,
    pub settings: UpgradeSettings,
}

impl<'a, C> UpgradeCoordinator<'a, C>
where
    C: Coordination + ?Sized,
{
    /// Take the upgrade lock. A lease from an earlier failed attempt is
    /// reused while its session is alive.
    pub async fn lock(&self, held: Option<UpgradeLease>) -> AgentResult<UpgradeLease> {
        let session = match held {
            Some(lease) if self.coordination.session_renew(&lease.session).await? => {
                debug!("Reusing upgrade session {}", lease.session);
                lease.session
            }
            _ => self.fresh_session().await?,
        };
        self.acquire(&session).await?;
        Ok(UpgradeLease {
            session,
            drained: true,
        })
    }

    /// Drain, stop and install `version`. Needs the lock from [`Self::lock`].
    pub async fn upgrade(&self, version: &str) -> AgentResult<()> {
        let service = self.layout.service();
        info!("Upgrading {} to {}", service, version);

        self.drain().await?;
        self.stop_service().await?;
        self.install(version).await?;

        self.stats.record_upgrade();
        info!("Installed {} {}", service, version);
        Ok(())
    }

    /// Destroy this node's leftover upgrade sessions and create a new one
    pub async fn fresh_session(&self) -> AgentResult<SessionId> {
        let name = upgrade_session_name(self.layout.service());
        for session in self.coordination.session_list().await? {
            if session.node == self.node_name && session.name == name {
                info!("Destroying stale upgrade session {}", session.id);
                self.coordination.session_destroy(&session.id).await?;
            }
        }

        let spec = SessionSpec {
            name,
            ttl: self.settings.session_ttl,
            lock_delay: Duration::ZERO,
            checks: None,
        };
        Ok(self.coordination.session_create(&spec).await?)
    }

    /// Spin until `session` holds the upgrade lock. No backoff, no queue.
    pub async fn acquire(&self, session: &SessionId) -> AgentResult<()> {
        let key = upgrade_lock_key(self.layout.service());
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            if self.coordination.kv_put(&key, self.node_name, Some(session)).await? {
                info!("Acquired {} after {} attempts", key, attempts);
                return Ok(());
            }
            if attempts == 1 {
                info!("{} is held by another node, waiting", key);
            }
            if self.settings.lock_retry.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.settings.lock_retry).await;
            }
        }
    }

    /// Take the node out of traffic
    pub async fn drain(&self) -> AgentResult<()> {
        self.platform
            .set_routing_status(RoutingStatus::Down)
            .await
            .tolerate("routing status down", self.stats);
        self.coordination
            .agent_maintenance(true, MAINTENANCE_REASON)
            .await?;
        self.wait_for_routing_drain().await;
        Ok(())
    }

    /// Best effort: wait until the routing DNS name stops resolving to us.
    /// Without a configured name this returns immediately.
    async fn wait_for_routing_drain(&self) {
        let Some(name) = &self.settings.dns_name else {
            return;
        };
        let me = IpAddr::V4(self.host_ip);
        loop {
            let still_listed = match tokio::net::lookup_host((name.as_str(), 0)).await {
                Ok(mut addrs) => addrs.any(|addr| addr.ip() == me),
                Err(e) => {
                    debug!("Lookup of {} failed: {}", name, e);
                    false
                }
            };
            if !still_listed {
                return;
            }
            debug!("{} still resolves to {}", name, me);
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Disable the unit (if installed) and wait for its checks to go down
    pub async fn stop_service(&self) -> AgentResult<()> {
        let service = self.layout.service();
        if !self.platform.unit_exists(service).await {
            debug!("No {} unit installed yet", service);
            return Ok(());
        }

        self.platform
            .disable_unit(service)
            .await
            .tolerate("disable unit", self.stats);
        HealthWaiter::new(self.coordination, self.settings.poll_interval, None)
            .wait_until_stopped(service)
            .await
    }

    /// Unpack `version` and make it current
    pub async fn install(&self, version: &str) -> AgentResult<()> {
        let service = self.layout.service();
        let archive = self.artifacts.fetch(service, version).await?;

        let service_dir = self.layout.service_dir();
        tokio::fs::create_dir_all(&service_dir)
            .await
            .map_err(|e| AgentError::io(&service_dir, e))?;

        self.platform
            .extract_archive(archive.path(), &service_dir)
            .await
            .tolerate("extract archive", self.stats);
        archive.discard().await;
        self.layout.repoint_current(version).await?;
        self.platform
            .run_hook(&self.layout.definition().install_hook())
            .await
            .tolerate("install hook", self.stats);
        Ok(())
    }

    /// Give the lock back and, if drained, put the node back in service
    pub async fn release(&self, lease: UpgradeLease) -> AgentResult<()> {
        self.coordination.session_destroy(&lease.session).await?;
        info!("Released upgrade lock for {}", self.layout.service());

        if lease.drained {
            self.coordination
                .agent_maintenance(false, MAINTENANCE_REASON)
                .await?;
            self.platform
                .set_routing_status(RoutingStatus::Up)
                .await
                .tolerate("routing status up", self.stats);
        }
        Ok(())
    }

    /// Upgrade session left behind by a previous run of this agent
    pub async fn recover_lease(&self) -> AgentResult<Option<UpgradeLease>> {
        let name = upgrade_session_name(self.layout.service());
        let mut leftovers = self
            .coordination
            .session_list()
            .await?
            .into_iter()
            .filter(|s| s.node == self.node_name && s.name == name);

        let Some(adopted) = leftovers.next() else {
            return Ok(None);
        };
        for extra in leftovers {
            warn!("Destroying duplicate upgrade session {}", extra.id);
            self.coordination.session_destroy(&extra.id).await?;
        }

        info!("Adopting upgrade session {} from a previous run", adopted.id);
        Ok(Some(UpgradeLease {
            session: adopted.id,
            drained: true,
        }))
    }
}
