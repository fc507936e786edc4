//! Active block commit, pivot wait, and overlay cleanup.
//!
//! All waits are bounded polling loops against a deadline computed once on
//! entry. Transient hypervisor errors back off longer than a normal poll.

use crate::hypervisor::{BlockJobKind, Hypervisor};
use crate::inventory::Device;
use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// How long the overlay may still be in use before cleanup gives up
pub const CLEANUP_WAIT: Duration = Duration::from_secs(20);
/// Pause between pivot completion and deleting the overlay
pub const CLEANUP_GRACE: Duration = Duration::from_secs(5);

enum Progress {
    Done,
    Waiting,
}

/// Start an active commit of `device` and wait until the domain has pivoted
/// off `overlay`.
pub async fn commit_device(
    hypervisor: &dyn Hypervisor,
    domain: &str,
    device: &str,
    overlay: &Path,
    timeout_minutes: u64,
) -> Result<()> {
    info!(domain, device, "Starting block commit");
    hypervisor.block_commit(domain, device).await?;
    wait_for_pivot(hypervisor, domain, device, overlay, timeout_minutes).await
}

/// Poll until the device no longer runs on `overlay`, requesting the pivot once
/// the commit job is ready.
pub async fn wait_for_pivot(
    hypervisor: &dyn Hypervisor,
    domain: &str,
    device: &str,
    overlay: &Path,
    timeout_minutes: u64,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(timeout_minutes.saturating_mul(60));
    let mut pivot_requested = false;

    loop {
        match poll_commit(hypervisor, domain, device, overlay, &mut pivot_requested).await {
            Ok(Progress::Done) => {
                info!(domain, device, "Block commit pivoted");
                return Ok(());
            }
            Ok(Progress::Waiting) => {
                if Instant::now() >= deadline {
                    return Err(BackupError::CommitTimeout {
                        domain: domain.to_string(),
                        device: device.to_string(),
                        minutes: timeout_minutes,
                    });
                }
                sleep(POLL_INTERVAL).await;
            }
            Err(e @ BackupError::CommitJobDisappeared { .. }) => return Err(e),
            Err(e) => {
                debug!(domain, device, "Waiting for pivot: {}", e);
                if Instant::now() >= deadline {
                    return Err(BackupError::CommitTimeout {
                        domain: domain.to_string(),
                        device: device.to_string(),
                        minutes: timeout_minutes,
                    });
                }
                sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

async fn poll_commit(
    hypervisor: &dyn Hypervisor,
    domain: &str,
    device: &str,
    overlay: &Path,
    pivot_requested: &mut bool,
) -> Result<Progress> {
    let current = hypervisor.current_file(domain, device).await?;
    if current != overlay {
        return Ok(Progress::Done);
    }

    let job = hypervisor.block_job(domain, device).await?;
    match job {
        // the job ends with the pivot; the disk source follows shortly after
        None if *pivot_requested => Ok(Progress::Waiting),
        None => Err(BackupError::CommitJobDisappeared {
            domain: domain.to_string(),
            device: device.to_string(),
        }),
        Some(job) if job.kind != BlockJobKind::ActiveCommit => {
            warn!(domain, device, kind = ?job.kind, "Unexpected block job");
            Err(BackupError::CommitJobDisappeared {
                domain: domain.to_string(),
                device: device.to_string(),
            })
        }
        Some(job) if job.is_ready() && !*pivot_requested => {
            hypervisor.pivot(domain, device).await?;
            *pivot_requested = true;
            debug!(domain, device, "Pivot requested");
            Ok(Progress::Waiting)
        }
        Some(job) => {
            debug!(domain, device, cur = job.cur, end = job.end, "Block commit in progress");
            Ok(Progress::Waiting)
        }
    }
}

/// Wait for the domain to leave `overlay`, then delete it after a grace period.
///
/// Every failure comes back as a [`BackupError::Cleanup`] warning.
pub async fn remove_overlay(
    hypervisor: &dyn Hypervisor,
    domain: &str,
    device: &str,
    overlay: &Path,
) -> Result<()> {
    let deadline = Instant::now() + CLEANUP_WAIT;

    loop {
        match hypervisor.current_file(domain, device).await {
            Ok(current) if current != overlay => break,
            Ok(_) => debug!(domain, device, overlay = %overlay.display(), "Overlay still in use"),
            Err(e) => debug!(domain, device, "Cannot read current file: {}", e),
        }
        if Instant::now() >= deadline {
            return Err(BackupError::Cleanup(format!(
                "Timeout removing temporary snapshot file {}",
                overlay.display()
            )));
        }
        sleep(POLL_INTERVAL).await;
    }

    sleep(CLEANUP_GRACE).await;
    std::fs::remove_file(overlay).map_err(|e| {
        BackupError::Cleanup(format!(
            "Cannot remove temporary snapshot file {}: {}",
            overlay.display(),
            e
        ))
    })?;
    info!(domain, device, overlay = %overlay.display(), "Removed temporary overlay");
    Ok(())
}

/// Commit every device that is not back on its original file.
///
/// Used after a hypervisor error in the middle of a job, so the domain is not
/// left running on overlays. Returns the errors of the commits that failed.
pub async fn recover(
    hypervisor: &dyn Hypervisor,
    domain: &str,
    devices: &[Device],
    overlays: impl Fn(&Device) -> PathBuf,
    timeout_minutes: u64,
) -> Vec<BackupError> {
    let mut errors = Vec::new();

    for device in devices {
        match hypervisor.current_file(domain, &device.name).await {
            Ok(current) if current == device.file => continue,
            Ok(current) => {
                warn!(domain, device = %device.name, current = %current.display(), "Recovering device from overlay");
            }
            Err(e) => {
                warn!(domain, device = %device.name, "Cannot read current file, committing anyway: {}", e);
            }
        }

        let overlay = overlays(device);
        if let Err(e) = commit_device(hypervisor, domain, &device.name, &overlay, timeout_minutes).await {
            warn!(domain, device = %device.name, "Recovery commit failed: {}", e);
            errors.push(e);
        }
    }

    errors
}
