//! Sequential batch over the configured VMs.

use crate::daemon::shutdown::ShutdownSignal;
use crate::executor::{BackupExecutor, JobOutcome};
use tracing::{error, info, warn};

/// Per-VM outcomes of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    /// Never started because the run stopped early
    pub not_attempted: Vec<String>,
    /// Why the run stopped early, if it did
    pub aborted: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_none()
    }
}

/// Back up `vms` one after another.
///
/// A failed VM does not stop the batch unless `abort_on_failure` is set or the
/// error is run-fatal (capacity, connection). A shutdown request is honoured
/// between VMs only.
pub async fn run(executor: &BackupExecutor, vms: &[String], shutdown: &ShutdownSignal) -> RunSummary {
    let abort_on_failure = executor.context().options.abort_on_failure;
    let mut summary = RunSummary::default();

    for (index, vm) in vms.iter().enumerate() {
        if shutdown.is_requested() {
            warn!(remaining = vms.len() - index, "Shutdown requested, skipping remaining VMs");
            summary.aborted = Some("shutdown requested".into());
            summary.not_attempted.extend(vms[index..].iter().cloned());
            break;
        }

        let report = executor.backup_domain(vm).await;
        match report.outcome {
            JobOutcome::Success | JobOutcome::Pending => summary.succeeded.push(vm.clone()),
            JobOutcome::Skipped => summary.skipped.push(vm.clone()),
            JobOutcome::Failed => summary.failed.push(vm.clone()),
        }

        if report.outcome != JobOutcome::Failed {
            continue;
        }

        let stop_reason = if report.is_run_fatal() {
            report.error.as_ref().map(|e| e.to_string())
        } else if abort_on_failure {
            Some(format!("{vm} failed and abort_on_failure is set"))
        } else {
            None
        };

        if let Some(reason) = stop_reason {
            error!(domain = %vm, "Stopping run: {}", reason);
            summary.aborted = Some(reason);
            summary.not_attempted.extend(vms[index + 1..].iter().cloned());
            break;
        }
    }

    info!(
        succeeded = ?summary.succeeded,
        failed = ?summary.failed,
        skipped = ?summary.skipped,
        not_attempted = ?summary.not_attempted,
        "Backup run finished"
    );
    summary
}
