//! Health convergence waits
//!
//! Both waits poll the local agent's check view with a fixed interval:
//! - `wait_until_passing`: every check of the service is passing (vacuously
//!   true when none are registered). Bounded only by the optional timeout.
//! - `wait_until_stopped`: at least one check is critical, or no check is
//!   registered for the service at all (first install). Never times out.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::coordination::{service_checks, AgentCheck, CheckStatus, Coordination};
use crate::error::{AgentError, AgentResult};

pub fn all_passing(checks: &HashMap<String, AgentCheck>, service: &str) -> bool {
    service_checks(checks, service).all(|c| c.status == CheckStatus::Passing)
}

pub fn service_stopped(checks: &HashMap<String, AgentCheck>, service: &str) -> bool {
    let mut registered = service_checks(checks, service).peekable();
    if registered.peek().is_none() {
        return true;
    }
    registered.any(|c| c.status == CheckStatus::Critical)
}

pub struct HealthWaiter<'a, C: ?Sized> {
    coordination: &'a C,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl<'a, C> HealthWaiter<'a, C>
where
    C: Coordination + ?Sized,
{
    pub fn new(coordination: &'a C, poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            coordination,
            poll_interval,
            timeout,
        }
    }

    pub async fn wait_until_passing(&self, service: &str) -> AgentResult<()> {
        info!("Waiting for {} health checks to go green", service);
        let started = Instant::now();
        loop {
            let checks = self.coordination.agent_checks().await?;
            if all_passing(&checks, service) {
                info!("{} is healthy after {:?}", service, started.elapsed());
                return Ok(());
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    return Err(AgentError::HealthTimeout {
                        service: service.to_string(),
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
            }
            debug!("{} not healthy yet", service);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn wait_until_stopped(&self, service: &str) -> AgentResult<()> {
        info!("Waiting for {} to report down", service);
        loop {
            let checks = self.coordination.agent_checks().await?;
            if service_stopped(&checks, service) {
                return Ok(());
            }
            debug!("{} still reporting up", service);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
