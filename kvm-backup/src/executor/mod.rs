//! Backup job executor - runs the workflow for one VM.
//!
//! The path is picked from the power state: running VMs get an external
//! snapshot, a copy of the frozen images and an active commit back into them;
//! shut-off VMs are copied directly; running VMs may also be power-cycled
//! around an offline copy. Every job ends in [`BackupExecutor::finish`], which
//! cleans up, prunes and sends exactly one notification.

pub mod commit;
pub mod power;
pub mod snapshot;

use crate::capacity::CapacityBudget;
use crate::config::{ActivePolicy, BackupConfig};
use crate::fs::layout::{self, BackupTimestamp};
use crate::fs::retention::{self, RetentionReport};
use crate::hypervisor::{DomainState, Hypervisor, XmlKind};
use crate::inventory::{select_devices, Device, DeviceSelection};
use crate::notify::{self, Notification, Notifier};
use crate::security::SecurityProfile;
use crate::transfer::copy::Copier;
use crate::transfer::progress::{format_bytes, format_duration, format_speed, throughput};
use crate::utils::{BackupError, Result};
use snapshot::SnapshotDescriptor;
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Everything a job needs, built once per run.
pub struct BackupContext {
    pub options: BackupConfig,
    pub budget: CapacityBudget,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub copier: Arc<dyn Copier>,
    pub notifier: Arc<dyn Notifier>,
    pub security: Arc<dyn SecurityProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPath {
    /// Snapshot, copy, commit while the VM keeps running
    Online,
    /// Plain copy of a VM that is shut off
    Offline,
    /// Shut down, offline copy, start again
    PowerCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Success,
    Failed,
    Skipped,
}

/// State of one VM backup while it runs.
#[derive(Debug)]
pub struct BackupJob {
    pub domain: String,
    pub timestamp: BackupTimestamp,
    pub domain_root: PathBuf,
    pub backup_dir: PathBuf,
    pub dry_run: bool,
    pub path: Option<WorkflowPath>,
    pub selection: DeviceSelection,
    pub outcome: JobOutcome,
    started: Instant,
    dir_created: bool,
    bytes_copied: u64,
    /// Per-device copy and commit failures
    device_errors: Vec<BackupError>,
    /// Reported, never fatal
    warnings: Vec<BackupError>,
}

impl BackupJob {
    pub fn new(domain: &str, timestamp: BackupTimestamp, options: &BackupConfig) -> Self {
        let domain_root = layout::domain_root(&options.destination, domain);
        let backup_dir = layout::backup_dir(&domain_root, timestamp);
        Self {
            domain: domain.to_string(),
            timestamp,
            domain_root,
            backup_dir,
            dry_run: options.dry_run,
            path: None,
            selection: DeviceSelection::default(),
            outcome: JobOutcome::Pending,
            started: Instant::now(),
            dir_created: false,
            bytes_copied: 0,
            device_errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn device_failure(&mut self, err: BackupError) {
        error!(domain = %self.domain, "{}", err);
        self.device_errors.push(err);
    }

    fn warning(&mut self, err: BackupError) {
        warn!(domain = %self.domain, "{}", err);
        self.warnings.push(err);
    }

    /// A single failure is surfaced as itself, several as a summary.
    fn take_device_failures(&mut self) -> Option<BackupError> {
        match self.device_errors.len() {
            0 => None,
            1 => self.device_errors.pop(),
            failed => Some(BackupError::DeviceFailures {
                domain: self.domain.clone(),
                failed,
                total: self.selection.selected.len(),
            }),
        }
    }
}

/// Final result of one job.
#[derive(Debug)]
pub struct BackupReport {
    pub domain: String,
    pub timestamp: BackupTimestamp,
    pub backup_dir: PathBuf,
    pub outcome: JobOutcome,
    pub error: Option<BackupError>,
    pub device_errors: Vec<BackupError>,
    pub warnings: Vec<BackupError>,
    pub bytes: u64,
    pub elapsed: Duration,
    pub retention: Option<RetentionReport>,
}

impl BackupReport {
    /// True when the run must not continue with the next VM.
    pub fn is_run_fatal(&self) -> bool {
        self.error.as_ref().is_some_and(BackupError::is_run_fatal)
    }

    pub fn notification(&self) -> Notification {
        let mut body = String::new();
        let subject = match self.outcome {
            JobOutcome::Success | JobOutcome::Pending => {
                let _ = writeln!(
                    body,
                    "backup completed for {} in backup directory:{}",
                    self.domain,
                    self.backup_dir.display()
                );
                let _ = writeln!(body, "size: {}", format_bytes(self.bytes));
                let _ = writeln!(body, "elapsed: {}", format_duration(self.elapsed));
                let _ = writeln!(
                    body,
                    "throughput: {}",
                    format_speed(throughput(self.bytes, self.elapsed))
                );
                if let Some(retention) = &self.retention {
                    let _ = writeln!(body, "retention: {}", retention.summary());
                }
                format!("Backup completed for {} {}", self.domain, self.timestamp)
            }
            JobOutcome::Failed => {
                let _ = writeln!(
                    body,
                    "backup failed for {} in backup directory:{}",
                    self.domain,
                    self.backup_dir.display()
                );
                if let Some(err) = &self.error {
                    let _ = writeln!(body, "cause: {}", err);
                }
                for err in &self.device_errors {
                    let _ = writeln!(body, "device error: {}", err);
                }
                format!("Backup failed for {} {}", self.domain, self.timestamp)
            }
            JobOutcome::Skipped => {
                let _ = writeln!(
                    body,
                    "{} is active and active backups are disabled, nothing was copied",
                    self.domain
                );
                format!("Backup skipped for {} {}", self.domain, self.timestamp)
            }
        };

        for warning in &self.warnings {
            let _ = writeln!(body, "warning: {}", warning);
        }

        Notification::new(subject, body.trim_end())
    }
}

/// Runs jobs against one [`BackupContext`].
pub struct BackupExecutor {
    ctx: BackupContext,
}

impl BackupExecutor {
    pub fn new(ctx: BackupContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BackupContext {
        &self.ctx
    }

    /// Back up one VM. Never returns early: the outcome is in the report and
    /// the notification has been sent.
    pub async fn backup_domain(&self, domain: &str) -> BackupReport {
        let mut job = BackupJob::new(domain, BackupTimestamp::now(), &self.ctx.options);
        info!(domain, timestamp = %job.timestamp, dry_run = job.dry_run, "Starting backup");

        let result = self.run_job(&mut job).await;
        self.finish(job, result).await
    }

    async fn run_job(&self, job: &mut BackupJob) -> Result<JobOutcome> {
        let hv = self.ctx.hypervisor.as_ref();
        let options = &self.ctx.options;

        let state = hv.domain_state(&job.domain).await?;
        let path = match state {
            _ if state.is_active() => match options.active_policy() {
                ActivePolicy::Live => WorkflowPath::Online,
                ActivePolicy::PowerCycle => WorkflowPath::PowerCycle,
                ActivePolicy::Skip => {
                    info!(domain = %job.domain, %state, "Skipping active VM");
                    return Ok(JobOutcome::Skipped);
                }
            },
            DomainState::Shutoff => WorkflowPath::Offline,
            other => {
                return Err(BackupError::Hypervisor(format!(
                    "{} is {}, cannot back up",
                    job.domain, other
                )))
            }
        };
        job.path = Some(path);

        let persistent_xml = hv.domain_xml(&job.domain, XmlKind::Persistent).await?;
        job.selection = select_devices(hv, &job.domain, &persistent_xml, options).await?;
        info!(
            domain = %job.domain,
            ?path,
            devices = job.selection.selected.len(),
            excluded = job.selection.excluded.len(),
            size = %format_bytes(job.selection.total_allocation),
            "Devices selected"
        );

        self.ctx.budget.check(job.selection.total_allocation)?;

        layout::prepare_domain_root(&job.domain_root, job.dry_run)?;
        if !job.dry_run && !job.domain_root.is_dir() {
            return Err(BackupError::DestinationUnavailable {
                path: job.domain_root.clone(),
                reason: "VM backup root does not exist".into(),
            });
        }

        match path {
            WorkflowPath::Online => self.online(job, &persistent_xml).await?,
            WorkflowPath::Offline => self.offline(job, &persistent_xml).await?,
            WorkflowPath::PowerCycle => self.power_cycle(job, &persistent_xml).await?,
        }

        match job.take_device_failures() {
            Some(err) => Err(err),
            None => Ok(JobOutcome::Success),
        }
    }

    /// Security profile off, snapshot/copy/commit, profile back on.
    async fn online(&self, job: &mut BackupJob, persistent_xml: &str) -> Result<()> {
        let label = job.selection.security_label.clone();
        let mut disabled = false;

        if let Some(label) = &label {
            if job.dry_run {
                println!("** will disable security profile {label}");
            } else {
                match self.ctx.security.disable(label).await {
                    Ok(()) => disabled = true,
                    Err(e) => job.warning(e),
                }
            }
        }

        let result = self.snapshot_copy_commit(job, persistent_xml).await;

        if let (true, Some(label)) = (disabled, &label) {
            if let Err(e) = self.ctx.security.enable(label).await {
                job.warning(e);
            }
        }

        result
    }

    async fn snapshot_copy_commit(&self, job: &mut BackupJob, persistent_xml: &str) -> Result<()> {
        let hv = self.ctx.hypervisor.as_ref();
        let timeout = self.ctx.options.commit_timeout_minutes;
        let selected = job.selection.selected.clone();

        self.export_definition(job, persistent_xml)?;

        if selected.is_empty() {
            info!(domain = %job.domain, "No devices selected, skipping snapshot");
            return Ok(());
        }

        let snapshot = SnapshotDescriptor::new(job.timestamp, &selected, &job.selection.excluded);

        if job.dry_run {
            let names: Vec<_> = selected.iter().map(|d| d.file_base.as_str()).collect();
            println!("** starting snapshot(s) for {} {}", job.domain, names.join(" "));
            print!("{}", snapshot.to_xml());
            for device in &selected {
                println!("** run {}", self.ctx.copier.describe(&device.file, &job.backup_dir));
            }
            for device in &selected {
                println!("** will blockcommit {} {}", job.domain, device.name);
            }
            return Ok(());
        }

        info!(domain = %job.domain, snapshot = %snapshot.name, "Creating external snapshot");
        if let Err(e) = hv.create_snapshot(&job.domain, &snapshot).await {
            // the request may have failed after the hypervisor applied it
            let recovery =
                commit::recover(hv, &job.domain, &selected, |d| d.overlay_path(job.timestamp), timeout).await;
            job.device_errors.extend(recovery);
            return Err(BackupError::Snapshot {
                domain: job.domain.clone(),
                reason: e.to_string(),
            });
        }

        let mut on_overlay = Vec::with_capacity(selected.len());
        for device in &selected {
            let current = match hv.current_file(&job.domain, &device.name).await {
                Ok(current) => current,
                Err(e) => {
                    error!(domain = %job.domain, device = %device.name, "Hypervisor error after snapshot: {}", e);
                    for err in commit::recover(hv, &job.domain, &selected, |d| d.overlay_path(job.timestamp), timeout).await {
                        job.device_errors.push(err);
                    }
                    return Err(e);
                }
            };

            if current == device.file {
                job.device_failure(BackupError::Copy {
                    source_file: device.file.clone(),
                    reason: "device is still running on its original file".into(),
                });
                continue;
            }
            on_overlay.push(device);
            self.copy_device(job, device).await;
        }

        // a device that never moved has nothing to commit
        for device in on_overlay {
            let overlay = device.overlay_path(job.timestamp);
            match commit::commit_device(hv, &job.domain, &device.name, &overlay, timeout).await {
                Ok(()) => {
                    if self.ctx.options.remove_tmp_file {
                        if let Err(e) = commit::remove_overlay(hv, &job.domain, &device.name, &overlay).await {
                            job.warning(e);
                        }
                    }
                }
                Err(e) => job.device_failure(e),
            }
        }

        Ok(())
    }

    async fn offline(&self, job: &mut BackupJob, persistent_xml: &str) -> Result<()> {
        self.export_definition(job, persistent_xml)?;

        let selected = job.selection.selected.clone();
        for device in &selected {
            if job.dry_run {
                println!("** run {}", self.ctx.copier.describe(&device.file, &job.backup_dir));
                continue;
            }
            self.copy_device(job, device).await;
        }
        Ok(())
    }

    /// The VM is started again even when the copy failed.
    async fn power_cycle(&self, job: &mut BackupJob, persistent_xml: &str) -> Result<()> {
        if job.dry_run {
            println!("** will shut down {}, copy it offline and start it again", job.domain);
            return self.offline(job, persistent_xml).await;
        }

        let hv = self.ctx.hypervisor.as_ref();
        let timeout = Duration::from_secs(self.ctx.options.power_timeout_secs);

        power::shutdown_and_wait(hv, &job.domain, timeout).await?;
        let copied = self.offline(job, persistent_xml).await;
        let started = power::start_and_wait(hv, &job.domain, timeout).await;

        copied?;
        started
    }

    async fn copy_device(&self, job: &mut BackupJob, device: &Device) {
        info!(
            domain = %job.domain,
            device = %device.name,
            file = %device.file.display(),
            size = %format_bytes(device.allocation),
            "Copying image"
        );
        match self.ctx.copier.copy(&device.file, &job.backup_dir).await {
            Ok(()) => job.bytes_copied += device.allocation,
            Err(e) => job.device_failure(e),
        }
    }

    /// Create the backup directory and store the persistent definition in it.
    fn export_definition(&self, job: &mut BackupJob, persistent_xml: &str) -> Result<()> {
        let xml_path = layout::config_export_path(&job.backup_dir, &job.domain);

        if job.dry_run {
            println!("** will create {}", job.backup_dir.display());
            println!("** save xml to {}", xml_path.display());
            return Ok(());
        }

        std::fs::create_dir(&job.backup_dir).map_err(|e| BackupError::DestinationUnavailable {
            path: job.backup_dir.clone(),
            reason: format!("cannot create backup directory: {e}"),
        })?;
        job.dir_created = true;

        std::fs::write(&xml_path, persistent_xml)?;
        Ok(())
    }

    /// Cleanup, retention and the notification. Runs for every job.
    async fn finish(&self, mut job: BackupJob, result: Result<JobOutcome>) -> BackupReport {
        let elapsed = job.started.elapsed();
        let error = match result {
            Ok(outcome) => {
                job.outcome = outcome;
                None
            }
            Err(e) => {
                job.outcome = JobOutcome::Failed;
                error!(domain = %job.domain, "Backup failed: {}", e);
                Some(e)
            }
        };

        if job.outcome == JobOutcome::Failed && job.dir_created {
            if let Err(e) = std::fs::remove_dir_all(&job.backup_dir) {
                warn!(dir = %job.backup_dir.display(), "Cannot remove failed backup: {}", e);
            }
        }

        let mut retention = None;
        // a dry run against a VM root that does not exist yet has nothing to prune
        if job.outcome == JobOutcome::Success && (!job.dry_run || job.domain_root.is_dir()) {
            match retention::prune(&job.domain_root, self.ctx.options.keep, job.dry_run) {
                Ok(report) => {
                    for (path, reason) in &report.failed {
                        job.warnings.push(BackupError::Retention(format!(
                            "Cannot remove backup folder {}: {}",
                            path.display(),
                            reason
                        )));
                    }
                    retention = Some(report);
                }
                Err(e) => job.warning(e),
            }
        }

        let report = BackupReport {
            domain: job.domain,
            timestamp: job.timestamp,
            backup_dir: job.backup_dir,
            outcome: job.outcome,
            error,
            device_errors: job.device_errors,
            warnings: job.warnings,
            bytes: job.bytes_copied,
            elapsed,
            retention,
        };

        info!(
            domain = %report.domain,
            outcome = ?report.outcome,
            size = %format_bytes(report.bytes),
            elapsed = %format_duration(report.elapsed),
            "Backup finished"
        );

        notify::deliver(self.ctx.notifier.as_ref(), &report.notification()).await;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SPACE_MARGIN;
    use crate::hypervisor::mock::{Call, CommitBehavior, MockHypervisor};
    use crate::notify::RecordingNotifier;
    use crate::security::RecordingProfile;
    use crate::transfer::copy::RecordingCopier;
    use std::path::Path;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct Harness {
        temp: TempDir,
        options: BackupConfig,
        budget: CapacityBudget,
        hv: Arc<MockHypervisor>,
        copier: Arc<RecordingCopier>,
        notifier: Arc<RecordingNotifier>,
        security: Arc<RecordingProfile>,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            std::fs::create_dir(temp.path().join("images")).unwrap();
            std::fs::create_dir(temp.path().join("backups")).unwrap();
            let options = BackupConfig {
                destination: temp.path().join("backups"),
                ..Default::default()
            };

            Self {
                temp,
                options,
                budget: CapacityBudget::new(100 * GIB, DEFAULT_SPACE_MARGIN),
                hv: Arc::new(MockHypervisor::new()),
                copier: Arc::new(RecordingCopier::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                security: Arc::new(RecordingProfile::new()),
            }
        }

        fn image(&self, name: &str) -> PathBuf {
            let path = self.temp.path().join("images").join(name);
            std::fs::write(&path, format!("contents of {name}")).unwrap();
            path
        }

        /// `web` with two disks and an AppArmor label.
        fn web(&self, state: DomainState) {
            let vda = self.image("web.qcow2");
            let vdb = self.image("web-data.qcow2");
            self.hv
                .add_domain("web", state)
                .disk("vda", vda, 2 * GIB)
                .disk("vdb", vdb, 3 * GIB)
                .label("libvirt-web");
        }

        fn root(&self) -> PathBuf {
            self.options.destination.join("web")
        }

        fn executor(&self) -> BackupExecutor {
            BackupExecutor::new(BackupContext {
                options: self.options.clone(),
                budget: self.budget,
                hypervisor: self.hv.clone(),
                copier: self.copier.clone(),
                notifier: self.notifier.clone(),
                security: self.security.clone(),
            })
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn commits(hv: &MockHypervisor) -> Vec<String> {
        hv.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BlockCommit(dev) => Some(dev),
                _ => None,
            })
            .collect()
    }

    fn snapshots(hv: &MockHypervisor) -> usize {
        hv.calls()
            .iter()
            .filter(|c| matches!(c, Call::CreateSnapshot(_)))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_backup() {
        let h = Harness::new();
        h.web(DomainState::Running);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success, "{:?}", report.error);
        assert_eq!(
            entries(&report.backup_dir),
            vec!["web-data.qcow2", "web.qcow2", "web.xml"]
        );
        assert_eq!(
            std::fs::read_to_string(report.backup_dir.join("web.qcow2")).unwrap(),
            "contents of web.qcow2"
        );
        assert_eq!(report.bytes, 5 * GIB);

        let calls = h.hv.calls();
        assert_eq!(calls[0], Call::CreateSnapshot(report.timestamp.to_string()));
        assert_eq!(
            calls[1..].to_vec(),
            vec![
                Call::BlockCommit("vda".into()),
                Call::Pivot("vda".into()),
                Call::BlockCommit("vdb".into()),
                Call::Pivot("vdb".into()),
            ]
        );
        assert_eq!(h.hv.current("web", "vda"), Some(h.temp.path().join("images/web.qcow2")));
        assert_eq!(h.hv.current("web", "vdb"), Some(h.temp.path().join("images/web-data.qcow2")));

        assert_eq!(h.security.events(), vec!["disable:libvirt-web", "enable:libvirt-web"]);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, format!("Backup completed for web {}", report.timestamp));
        assert!(sent[0].body.contains("size: 5.0 GiB"));
        assert!(sent[0].body.contains("throughput:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlays_kept_unless_requested() {
        let h = Harness::new();
        h.web(DomainState::Running);

        let report = h.executor().backup_domain("web").await;

        let overlay = h
            .temp
            .path()
            .join("images")
            .join(format!("{}_web.qcow2", report.timestamp));
        assert!(overlay.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_tmp_file_deletes_overlays() {
        let mut h = Harness::new();
        h.options.remove_tmp_file = true;
        h.web(DomainState::Running);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success);
        assert!(report.warnings.is_empty());
        assert_eq!(entries(&h.temp.path().join("images")), vec!["web-data.qcow2", "web.qcow2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_failure_issues_no_snapshot() {
        let mut h = Harness::new();
        h.budget = CapacityBudget::new(12 * GIB, DEFAULT_SPACE_MARGIN);
        h.web(DomainState::Running);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Failed);
        assert!(matches!(report.error, Some(BackupError::Capacity { .. })));
        assert!(report.is_run_fatal());
        assert!(h.hv.calls().is_empty());
        assert!(h.security.events().is_empty());
        assert!(!h.root().exists());

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.starts_with("Backup failed for web"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_failure_still_commits_every_device() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.copier.fail_for(h.temp.path().join("images/web-data.qcow2"));

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Failed);
        assert!(matches!(report.error, Some(BackupError::Copy { .. })));
        assert!(!report.is_run_fatal());
        assert_eq!(commits(&h.hv), vec!["vda", "vdb"]);
        assert_eq!(h.hv.current("web", "vdb"), Some(h.temp.path().join("images/web-data.qcow2")));
        assert!(!report.backup_dir.exists());
        assert_eq!(h.security.events(), vec!["disable:libvirt-web", "enable:libvirt-web"]);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains(&report.backup_dir.display().to_string()));
        assert!(sent[0].body.contains("No space left on device"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_timeout_fails_the_job() {
        let mut h = Harness::new();
        h.options.commit_timeout_minutes = 1;
        let vda = h.image("db.qcow2");
        h.hv.add_domain("db", DomainState::Running).disk("vda", vda, GIB);
        h.hv.set_commit_behavior(CommitBehavior::NeverReady);

        let start = Instant::now();
        let report = h.executor().backup_domain("db").await;
        let elapsed = start.elapsed();

        match &report.error {
            Some(BackupError::CommitTimeout { domain, device, minutes }) => {
                assert_eq!(domain, "db");
                assert_eq!(device, "vda");
                assert_eq!(*minutes, 1);
            }
            other => panic!("expected commit timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(66));
        assert!(h.notifier.sent()[0]
            .body
            .contains("Timeout in blockcommit for db vda (minutes 1)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_several_device_failures_are_summarised() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.hv.set_commit_behavior(CommitBehavior::Vanish);

        let report = h.executor().backup_domain("web").await;

        match report.error {
            Some(BackupError::DeviceFailures { failed, total, .. }) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 2);
            }
            other => panic!("expected device failures, got {other:?}"),
        }
        assert_eq!(report.device_errors.len(), 2);
        assert!(report
            .device_errors
            .iter()
            .all(|e| matches!(e, BackupError::CommitJobDisappeared { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hypervisor_error_after_snapshot_recovers() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.hv.fail_next_live_xml(1);

        let report = h.executor().backup_domain("web").await;

        assert!(matches!(report.error, Some(BackupError::Hypervisor(_))));
        assert_eq!(commits(&h.hv), vec!["vda", "vdb"]);
        assert_eq!(h.hv.current("web", "vda"), Some(h.temp.path().join("images/web.qcow2")));
        assert_eq!(h.hv.current("web", "vdb"), Some(h.temp.path().join("images/web-data.qcow2")));
        assert!(h.copier.copies().is_empty());
        assert!(!report.backup_dir.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_snapshot_restores_profile() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.hv.reject_snapshot();

        let report = h.executor().backup_domain("web").await;

        assert!(matches!(report.error, Some(BackupError::Snapshot { .. })));
        assert!(commits(&h.hv).is_empty());
        assert_eq!(h.security.events(), vec!["disable:libvirt-web", "enable:libvirt-web"]);
        assert!(!report.backup_dir.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_error_after_apply_commits_overlays() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.hv.lose_snapshot_reply();

        let report = h.executor().backup_domain("web").await;

        assert!(matches!(report.error, Some(BackupError::Snapshot { .. })));
        assert_eq!(commits(&h.hv), vec!["vda", "vdb"]);
        assert_eq!(h.hv.current("web", "vda"), Some(h.temp.path().join("images/web.qcow2")));
        assert_eq!(h.hv.current("web", "vdb"), Some(h.temp.path().join("images/web-data.qcow2")));
        assert!(report.device_errors.is_empty());
        assert!(h.copier.copies().is_empty());
        assert_eq!(h.security.events(), vec!["disable:libvirt-web", "enable:libvirt-web"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_left_on_base_is_not_committed() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.hv.ignore_snapshot_for("vdb");

        let report = h.executor().backup_domain("web").await;

        assert!(matches!(report.error, Some(BackupError::Copy { .. })));
        assert!(report.device_errors.is_empty());
        assert_eq!(commits(&h.hv), vec!["vda"]);
        assert_eq!(h.copier.copies().len(), 1);
        assert_eq!(h.hv.current("web", "vda"), Some(h.temp.path().join("images/web.qcow2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_disable_failure_is_a_warning() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.security.fail_disable();

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(report.warnings.len(), 1);
        assert!(matches!(report.warnings[0], BackupError::Security(_)));
        assert!(h.security.events().is_empty());
        assert!(h.notifier.sent()[0].body.contains("warning:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_backup_copies_directly() {
        let h = Harness::new();
        h.web(DomainState::Shutoff);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(snapshots(&h.hv), 0);
        assert!(commits(&h.hv).is_empty());
        assert_eq!(h.copier.copies().len(), 2);
        assert!(h.security.events().is_empty());
        assert_eq!(
            entries(&report.backup_dir),
            vec!["web-data.qcow2", "web.qcow2", "web.xml"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_active_skips_running_vm() {
        let mut h = Harness::new();
        h.options.no_active = true;
        h.web(DomainState::Running);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Skipped);
        assert!(report.error.is_none());
        assert!(h.hv.calls().is_empty());
        assert!(h.copier.copies().is_empty());
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.starts_with("Backup skipped for web"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_cycle() {
        let mut h = Harness::new();
        h.options.force_no_active = true;
        h.web(DomainState::Running);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success, "{:?}", report.error);
        assert_eq!(h.hv.calls(), vec![Call::Shutdown, Call::Start]);
        assert_eq!(h.copier.copies().len(), 2);
        assert_eq!(h.hv.state_of("web"), Some(DomainState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_cycle_restarts_after_copy_failure() {
        let mut h = Harness::new();
        h.options.force_no_active = true;
        h.web(DomainState::Running);
        h.copier.fail_for(h.temp.path().join("images/web.qcow2"));

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Failed);
        assert!(matches!(report.error, Some(BackupError::Copy { .. })));
        assert_eq!(h.hv.state_of("web"), Some(DomainState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_cycle_timeout() {
        let mut h = Harness::new();
        h.options.force_no_active = true;
        h.web(DomainState::Running);
        h.hv.ignore_power_requests();

        let report = h.executor().backup_domain("web").await;

        assert!(matches!(
            report.error,
            Some(BackupError::PowerTransitionTimeout { seconds: 30, .. })
        ));
        assert!(h.copier.copies().is_empty());
        assert!(report.elapsed >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_state_fails() {
        let h = Harness::new();
        h.web(DomainState::Crashed);

        let report = h.executor().backup_domain("web").await;

        assert!(matches!(report.error, Some(BackupError::Hypervisor(_))));
        assert!(h.hv.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_domain_fails() {
        let h = Harness::new();

        let report = h.executor().backup_domain("ghost").await;

        assert_eq!(report.outcome, JobOutcome::Failed);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    fn seed_backups(root: &Path, names: &[&str]) {
        for name in names {
            std::fs::create_dir_all(root.join(name)).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_after_success() {
        let h = Harness::new();
        h.web(DomainState::Running);
        seed_backups(&h.root(), &["2020-01-01T000000", "2020-01-02T000000", "2020-01-03T000000"]);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success);
        let expected = vec!["2020-01-03T000000".to_string(), report.timestamp.to_string()];
        assert_eq!(entries(&h.root()), expected);
        assert_eq!(report.retention.map(|r| r.removed.len()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retention_after_failure() {
        let h = Harness::new();
        h.web(DomainState::Running);
        h.hv.reject_snapshot();
        seed_backups(&h.root(), &["2020-01-01T000000", "2020-01-02T000000", "2020-01-03T000000"]);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Failed);
        assert!(report.retention.is_none());
        assert_eq!(entries(&h.root()).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_mutates_nothing() {
        let mut h = Harness::new();
        h.options.dry_run = true;
        h.web(DomainState::Running);
        seed_backups(&h.root(), &["2020-01-01T000000", "2020-01-02T000000", "2020-01-03T000000"]);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success);
        assert!(h.hv.calls().is_empty());
        assert!(h.copier.copies().is_empty());
        assert!(h.security.events().is_empty());
        assert!(!report.backup_dir.exists());
        assert_eq!(entries(&h.root()).len(), 3);
        assert_eq!(report.retention.map(|r| r.removed.len()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_does_not_create_domain_root() {
        let mut h = Harness::new();
        h.options.dry_run = true;
        h.web(DomainState::Shutoff);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success);
        assert!(!h.root().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_list_excludes_from_snapshot() {
        let mut h = Harness::new();
        h.options.disks = vec!["vdb".into()];
        h.web(DomainState::Running);

        let report = h.executor().backup_domain("web").await;

        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(commits(&h.hv), vec!["vdb"]);
        assert_eq!(entries(&report.backup_dir), vec!["web-data.qcow2", "web.xml"]);
        assert_eq!(h.hv.current("web", "vda"), Some(h.temp.path().join("images/web.qcow2")));
    }
}
