//! Shutdown and start with a bounded wait for the state change.

use crate::hypervisor::{DomainState, Hypervisor};
use crate::utils::{BackupError, Result};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

pub const POWER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll the domain state until it reaches `target` or `timeout` passes.
pub async fn wait_for_state(
    hypervisor: &dyn Hypervisor,
    domain: &str,
    target: DomainState,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        match hypervisor.domain_state(domain).await {
            Ok(state) if state == target => return Ok(()),
            Ok(state) => debug!(domain, %state, %target, "Waiting for state change"),
            Err(e) => debug!(domain, "Cannot read domain state: {}", e),
        }

        if Instant::now() >= deadline {
            return Err(BackupError::PowerTransitionTimeout {
                domain: domain.to_string(),
                target: target.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        sleep(POWER_POLL_INTERVAL).await;
    }
}

pub async fn shutdown_and_wait(hypervisor: &dyn Hypervisor, domain: &str, timeout: Duration) -> Result<()> {
    info!(domain, "Shutting down for offline backup");
    hypervisor.shutdown(domain).await?;
    wait_for_state(hypervisor, domain, DomainState::Shutoff, timeout).await
}

pub async fn start_and_wait(hypervisor: &dyn Hypervisor, domain: &str, timeout: Duration) -> Result<()> {
    info!(domain, "Starting after offline backup");
    hypervisor.start(domain).await?;
    wait_for_state(hypervisor, domain, DomainState::Running, timeout).await
}
