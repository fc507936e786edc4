//! libvirt access through the `virsh` command line client.

use super::{BlockInfo, BlockJob, BlockJobKind, DomainState, Hypervisor, XmlKind};
use crate::executor::snapshot::SnapshotDescriptor;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Hypervisor adapter running `virsh -c <uri> ...` for every request.
pub struct VirshHypervisor {
    program: PathBuf,
    uri: String,
}

impl VirshHypervisor {
    /// Verify the connection URI once and return the adapter.
    pub async fn connect(program: impl Into<PathBuf>, uri: &str) -> Result<Self> {
        let hv = Self {
            program: program.into(),
            uri: uri.to_string(),
        };

        let canonical = hv.run(&["uri"]).await.map_err(|e| BackupError::Connection {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        info!(uri = %canonical.trim(), "Connected to hypervisor");

        Ok(hv)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_with_input(args, None).await
    }

    async fn run_with_input(&self, args: &[&str], input: Option<&str>) -> Result<String> {
        debug!(args = ?args, "Running virsh");

        let mut child = Command::new(&self.program)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackupError::Hypervisor(format!("cannot run {}: {}", self.program.display(), e))
            })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| BackupError::Hypervisor(format!("cannot write to virsh: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::Hypervisor(format!("virsh did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Hypervisor(format!(
                "virsh {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn domain_state(&self, domain: &str) -> Result<DomainState> {
        let out = self.run(&["domstate", domain]).await?;
        Ok(parse_domstate(&out))
    }

    async fn domain_xml(&self, domain: &str, kind: XmlKind) -> Result<String> {
        match kind {
            XmlKind::Live => self.run(&["dumpxml", domain]).await,
            XmlKind::Persistent => {
                self.run(&["dumpxml", "--inactive", "--security-info", domain])
                    .await
            }
        }
    }

    async fn block_info(&self, domain: &str, device: &str) -> Result<BlockInfo> {
        let out = self.run(&["domblkinfo", domain, device]).await?;
        parse_blkinfo(&out)
    }

    async fn create_snapshot(&self, domain: &str, snapshot: &SnapshotDescriptor) -> Result<()> {
        let xml = snapshot.to_xml();
        self.run_with_input(
            &[
                "snapshot-create",
                domain,
                "--xmlfile",
                "/dev/stdin",
                "--disk-only",
                "--quiesce",
                "--no-metadata",
                "--atomic",
            ],
            Some(&xml),
        )
        .await?;
        Ok(())
    }

    async fn block_commit(&self, domain: &str, device: &str) -> Result<()> {
        self.run(&["blockcommit", domain, device, "--active"]).await?;
        Ok(())
    }

    async fn block_job(&self, domain: &str, device: &str) -> Result<Option<BlockJob>> {
        let out = self
            .run(&["blockjob", domain, device, "--info", "--raw"])
            .await?;
        Ok(parse_blockjob(&out))
    }

    async fn pivot(&self, domain: &str, device: &str) -> Result<()> {
        self.run(&["blockjob", domain, device, "--pivot", "--async"])
            .await?;
        Ok(())
    }

    async fn shutdown(&self, domain: &str) -> Result<()> {
        self.run(&["shutdown", domain]).await?;
        Ok(())
    }

    async fn start(&self, domain: &str) -> Result<()> {
        self.run(&["start", domain]).await?;
        Ok(())
    }
}

/// Parse `virsh domstate` output.
pub fn parse_domstate(output: &str) -> DomainState {
    match output.trim() {
        "running" | "idle" | "blocked" => DomainState::Running,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::ShuttingDown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::Suspended,
        _ => DomainState::Unknown,
    }
}

/// Parse `virsh domblkinfo` output.
pub fn parse_blkinfo(output: &str) -> Result<BlockInfo> {
    let mut info = BlockInfo::default();
    let mut seen_allocation = false;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key.trim() {
            "Capacity" => info.capacity = value,
            "Allocation" => {
                info.allocation = value;
                seen_allocation = true;
            }
            "Physical" => info.physical = value,
            _ => {}
        }
    }

    if !seen_allocation {
        return Err(BackupError::Hypervisor(format!(
            "unexpected domblkinfo output: {}",
            output.trim()
        )));
    }
    Ok(info)
}

/// Parse `virsh blockjob --info --raw` output; empty output means no job.
pub fn parse_blockjob(output: &str) -> Option<BlockJob> {
    let mut kind = None;
    let mut cur = 0;
    let mut end = 0;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "type" => kind = Some(parse_job_kind(value.trim())),
            "cur" => cur = value.trim().parse().unwrap_or(0),
            "end" => end = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }

    kind.map(|kind| BlockJob { kind, cur, end })
}

fn parse_job_kind(value: &str) -> BlockJobKind {
    match value {
        "Active Block Commit" | "5" => BlockJobKind::ActiveCommit,
        "Block Commit" | "3" => BlockJobKind::Commit,
        "Block Copy" | "2" => BlockJobKind::Copy,
        "Block Pull" | "1" => BlockJobKind::Pull,
        "Backup" | "6" => BlockJobKind::Backup,
        _ => BlockJobKind::Unknown,
    }
}
