//! kvm-backup - Main entry point
//!
//! Backs up the given VMs one after another and exits non-zero if any failed.

use anyhow::Result;
use clap::Parser;
use kvm_backup::capacity::CapacityBudget;
use kvm_backup::daemon::shutdown::ShutdownCoordinator;
use kvm_backup::executor::{BackupContext, BackupExecutor};
use kvm_backup::hypervisor::VirshHypervisor;
use kvm_backup::notify::{self, Notification, Notifier};
use kvm_backup::transfer::copy::CommandCopier;
use kvm_backup::{runner, security, utils, Config};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backup destination folder
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// Number of backups to keep
    #[arg(short, long)]
    keep: Option<usize>,

    /// Number of minutes to wait for blockcommit to finish
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Do not perform the backup, only print what would be done
    #[arg(short = 'n', long)]
    dryrun: bool,

    /// Back up only these disks (target names); may be repeated
    #[arg(short = 'D', long = "disk", value_name = "DISK")]
    disks: Vec<String>,

    /// Copy bandwidth limit in KiB/s (0 = unlimited)
    #[arg(long, value_name = "KIB_PER_SEC")]
    bwlimit: Option<u64>,

    /// Remove the temporary overlay after the commit
    #[arg(long)]
    remove_tmp_file: bool,

    /// Skip VMs that are running
    #[arg(long, conflicts_with = "force_no_active")]
    no_active: bool,

    /// Shut running VMs down for the copy and start them again
    #[arg(long)]
    force_no_active: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Virtual machines to back up
    #[arg(value_name = "VM")]
    vms: Vec<String>,
}

impl Args {
    /// Command line flags override the file and the environment.
    fn apply(&self, config: &mut Config) {
        let backup = &mut config.backup;
        if let Some(dest) = &self.dest {
            backup.destination = dest.clone();
        }
        if let Some(keep) = self.keep {
            backup.keep = keep;
        }
        if let Some(timeout) = self.timeout {
            backup.commit_timeout_minutes = timeout;
        }
        if let Some(limit) = self.bwlimit {
            backup.bandwidth_limit = limit;
        }
        if !self.disks.is_empty() {
            backup.disks = self.disks.clone();
        }
        if !self.vms.is_empty() {
            backup.vms = self.vms.clone();
        }
        backup.dry_run |= self.dryrun;
        backup.remove_tmp_file |= self.remove_tmp_file;
        backup.no_active |= self.no_active;
        backup.force_no_active |= self.force_no_active;
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    // Initialize logging
    utils::logger::init(&config.log.level)?;
    config.validate()?;

    tracing::info!(
        "Starting kvm-backup v{} ({} VM(s), destination {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.vms.len(),
        config.backup.destination.display()
    );

    let notifier: Arc<dyn Notifier> = Arc::from(notify::from_config(&config.notify));
    let run_subject = format!("KVM backup {}", config.backup.vms.join(" "));

    // Free space is sampled once for the whole run
    let budget = match CapacityBudget::sample(&config.backup.destination, config.backup.space_margin) {
        Ok(budget) => budget,
        Err(e) => {
            tracing::error!("{}", e);
            let body = format!(
                "Backup destination insufficient resources: {}\n{}",
                config.backup.destination.display(),
                e
            );
            notify::deliver(notifier.as_ref(), &Notification::new(&run_subject, body)).await;
            std::process::exit(1);
        }
    };

    let hypervisor = match VirshHypervisor::connect(&config.hypervisor.virsh, &config.hypervisor.uri).await {
        Ok(hv) => hv,
        Err(e) => {
            tracing::error!("{}", e);
            notify::deliver(notifier.as_ref(), &Notification::new(&run_subject, e.to_string())).await;
            std::process::exit(1);
        }
    };

    // Signals only stop the queue; the VM in progress always completes
    let shutdown_coordinator = ShutdownCoordinator::new();
    let shutdown = shutdown_coordinator.subscribe();
    tokio::spawn(async move {
        shutdown_coordinator.wait_for_signal().await;
    });

    let executor = BackupExecutor::new(BackupContext {
        options: config.backup.clone(),
        budget,
        hypervisor: Arc::new(hypervisor),
        copier: Arc::new(CommandCopier::new(config.backup.bandwidth_limit)),
        notifier,
        security: Arc::from(security::from_config(&config.security)),
    });

    let summary = runner::run(&executor, &config.backup.vms, &shutdown).await;

    if !summary.is_success() {
        tracing::error!(
            failed = ?summary.failed,
            not_attempted = ?summary.not_attempted,
            "Backup run failed"
        );
        std::process::exit(1);
    }

    Ok(())
}
