//! The per-service control loop
//!
//! One cycle walks these phases in order, skipping the ones not needed:
//!
//! ```text
//! Detect → Upgrade → Configure → Publish → AwaitHealth → Release → Elect → Idle
//! ```
//!
//! - `Upgrade` only on version drift; it leaves the upgrade lock held, even
//!   when the install itself fails.
//! - `Configure` after an install, on config drift, or when a lease from an
//!   earlier cycle is still held (the unit may have been stopped by then).
//! - `Publish` re-imports the unit, publishes tags and checks, and drops a
//!   superseded leader session.
//! - `Release` is only reachable through `AwaitHealth`: the lock is given
//!   back once every check of the service passes. A lease that could not
//!   be released (failed install, health timeout, backend error) is kept;
//!   the next cycle re-renders, re-enables the unit and waits again.
//! - `Elect` for primary services.

use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, error, info};

use crate::artifacts::ArtifactStore;
use crate::checks::register_checks;
use crate::config::{AgentConfig, TimingConfig, UnitFlavor};
use crate::converge::ConfigConverger;
use crate::coordination::{Coordination, SessionId};
use crate::discovery::NodeIdentity;
use crate::drift::DriftDetector;
use crate::error::AgentResult;
use crate::execution::Platform;
use crate::health::HealthWaiter;
use crate::layout::InstallLayout;
use crate::leader::{LeaderElector, LeaderPhase};
use crate::stats::ConvergenceStats;
use crate::tags::ServiceTags;
use crate::templates::TemplateEngine;
use crate::upgrade::{UpgradeCoordinator, UpgradeLease, UpgradeSettings};

/// Key naming the service a node manages when none is configured
pub fn services_key(node: &str) -> String {
    format!("{}/services", node)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Detect,
    Upgrade,
    Configure,
    Publish,
    AwaitHealth,
    Release,
    Elect,
    Idle,
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub phases: Vec<CyclePhase>,
    pub installed: bool,
    pub configured: bool,
    pub fingerprint: Option<String>,
    pub released_lock: bool,
    pub registered_checks: usize,
    pub skipped_checks: usize,
    pub leadership: Option<LeaderPhase>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            phases: Vec::new(),
            installed: false,
            configured: false,
            fingerprint: None,
            released_lock: false,
            registered_checks: 0,
            skipped_checks: 0,
            leadership: None,
        }
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!("Cycle phase: {:?}", phase);
        self.phases.push(phase);
    }

    pub fn visited(&self, phase: CyclePhase) -> bool {
        self.phases.contains(&phase)
    }
}

/// External collaborators driven by the loop
pub struct Collaborators {
    pub coordination: Box<dyn Coordination>,
    pub platform: Box<dyn Platform>,
    pub artifacts: Box<dyn ArtifactStore>,
    pub engine: Box<dyn TemplateEngine>,
}

pub struct ControlLoop {
    collaborators: Collaborators,
    identity: NodeIdentity,
    layout: InstallLayout,
    timing: TimingConfig,
    flavor: UnitFlavor,
    dns_name: Option<String>,
    debug_dump: PathBuf,
    primary: bool,
    stats: ConvergenceStats,
    /// Upgrade lock held until the node is healthy again
    pending_lease: Option<UpgradeLease>,
    /// Leader session carried from one election round to the next
    leader_session: Option<SessionId>,
    resumed: bool,
}

impl ControlLoop {
    pub fn new(collaborators: Collaborators, identity: NodeIdentity, service: String, config: &AgentConfig) -> Self {
        Self {
            collaborators,
            layout: InstallLayout::new(config.paths.install_root.clone(), service.clone()),
            debug_dump: config.debug_dump_path(&service),
            identity,
            timing: config.timing.clone(),
            flavor: config.platform.flavor,
            dns_name: config.routing.dns_name.clone(),
            primary: config.service.primary,
            stats: ConvergenceStats::new(),
            pending_lease: None,
            leader_session: None,
            resumed: false,
        }
    }

    pub fn service(&self) -> &str {
        self.layout.service()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn stats(&self) -> &ConvergenceStats {
        &self.stats
    }

    pub fn pending_lease(&self) -> Option<&UpgradeLease> {
        self.pending_lease.as_ref()
    }

    pub fn leader_session(&self) -> Option<&SessionId> {
        self.leader_session.as_ref()
    }

    fn host_ip(&self) -> Ipv4Addr {
        self.identity.host_ip
    }

    fn upgrader(&self) -> UpgradeCoordinator<'_, dyn Coordination> {
        UpgradeCoordinator {
            coordination: &*self.collaborators.coordination,
            platform: &*self.collaborators.platform,
            artifacts: &*self.collaborators.artifacts,
            layout: &self.layout,
            stats: &self.stats,
            node_name: &self.identity.node_name,
            host_ip: self.host_ip(),
            settings: UpgradeSettings {
                session_ttl: self.timing.upgrade_session_ttl(),
                lock_retry: self.timing.lock_retry_interval(),
                poll_interval: self.timing.health_poll_interval(),
                dns_name: self.dns_name.clone(),
            },
        }
    }

    fn elector(&self) -> LeaderElector<'_, dyn Coordination> {
        LeaderElector::new(
            &*self.collaborators.coordination,
            self.layout.service(),
            &self.identity.node_name,
            self.timing.leader_session_ttl(),
        )
    }

    fn converger(&self) -> ConfigConverger<'_> {
        ConfigConverger::new(
            &*self.collaborators.engine,
            &*self.collaborators.platform,
            &self.stats,
            self.debug_dump.clone(),
        )
    }

    fn health_waiter(&self) -> HealthWaiter<'_, dyn Coordination> {
        HealthWaiter::new(
            &*self.collaborators.coordination,
            self.timing.health_poll_interval(),
            self.timing.health_timeout(),
        )
    }

    /// Pick up state left behind by a previous run: an upgrade session of
    /// this node and the recorded leader session. Both are looked up under
    /// the backend's name for this node.
    pub async fn resume(&mut self) -> AgentResult<()> {
        self.identity
            .align_with_backend(&*self.collaborators.coordination)
            .await;
        if self.pending_lease.is_none() {
            let lease = self.upgrader().recover_lease().await?;
            self.pending_lease = lease;
        }
        if self.primary && self.leader_session.is_none() {
            let session = self.elector().recorded_session().await?;
            self.leader_session = session;
        }
        self.resumed = true;
        Ok(())
    }

    /// Run cycles forever, one per poll interval
    pub async fn run(&mut self) {
        info!(
            "Starting control loop for {} on {} (primary: {})",
            self.service(),
            self.identity.node_name,
            self.primary
        );

        loop {
            match self.step().await {
                Ok(report) => {
                    self.stats.record_cycle(true);
                    if report.installed || report.configured || report.released_lock {
                        info!(
                            "Cycle done - installed: {}, configured: {}, released lock: {}, stats: {:?}",
                            report.installed,
                            report.configured,
                            report.released_lock,
                            self.stats.snapshot()
                        );
                    }
                }
                Err(e) => {
                    self.stats.record_cycle(false);
                    error!("Convergence cycle for {} failed: {}", self.service(), e);
                }
            }
            tokio::time::sleep(self.timing.poll_interval()).await;
        }
    }

    /// Resume if not done yet, then run one cycle
    pub async fn step(&mut self) -> AgentResult<CycleReport> {
        if !self.resumed {
            self.resume().await?;
        }
        self.run_cycle().await
    }

    /// One pass through the phase sequence
    pub async fn run_cycle(&mut self) -> AgentResult<CycleReport> {
        let mut report = CycleReport::new();
        let service = self.layout.service().to_string();

        report.enter(CyclePhase::Detect);
        let services = self.collaborators.coordination.agent_services().await?;
        let published = ServiceTags::published(&services, &service);
        let drift = DriftDetector::new(
            &*self.collaborators.coordination,
            &self.layout,
            self.host_ip(),
            self.timing.poll_interval(),
        )
        .detect(&published)
        .await?;

        let interrupted = self.pending_lease.is_some();
        if drift.version_drift {
            report.enter(CyclePhase::Upgrade);
            let lease = self.upgrader().lock(self.pending_lease.clone()).await?;
            self.pending_lease = Some(lease);
            self.upgrader().upgrade(&drift.desired_version).await?;
            report.installed = true;
        }

        let definition = self.layout.definition();
        if report.installed || drift.config_drift || interrupted {
            report.enter(CyclePhase::Configure);
            let converger = self.converger();
            let snapshot = converger
                .snapshot(&definition, &drift.desired_config, self.host_ip())
                .await?;
            converger.apply(&definition, &snapshot).await?;
            report.configured = true;
            report.fingerprint = Some(snapshot.fingerprint);
        }

        if let (true, Some(fingerprint)) = (report.installed || report.configured, report.fingerprint.clone()) {
            report.enter(CyclePhase::Publish);
            let platform = &*self.collaborators.platform;
            let coordination = &*self.collaborators.coordination;

            platform
                .import_unit(&service, &definition.unit_definition(self.flavor))
                .await
                .tolerate("import unit", &self.stats);
            platform.enable_unit(&service).await.tolerate("enable unit", &self.stats);
            platform.clear_unit(&service).await.tolerate("clear unit", &self.stats);

            let tags = ServiceTags::new(drift.desired_version.clone(), fingerprint);
            coordination.agent_service_register(&service, &tags.to_tags()).await?;
            let (registered, skipped) = register_checks(coordination, &definition, &self.stats).await?;
            report.registered_checks = registered;
            report.skipped_checks = skipped;

            if let Some(session) = self.leader_session.clone() {
                self.elector().step_down(&session).await?;
                self.leader_session = None;
            }
        }

        if report.installed || report.configured || self.pending_lease.is_some() {
            report.enter(CyclePhase::AwaitHealth);
            self.health_waiter().wait_until_passing(&service).await?;

            if let Some(lease) = self.pending_lease.clone() {
                report.enter(CyclePhase::Release);
                self.upgrader().release(lease).await?;
                self.pending_lease = None;
                report.released_lock = true;
            }
        }

        if self.primary {
            report.enter(CyclePhase::Elect);
            let election = self.elector().elect(self.leader_session.clone()).await?;
            self.leader_session = election.session.clone();
            report.leadership = Some(election.phase);
        }

        report.enter(CyclePhase::Idle);
        Ok(report)
    }
}
