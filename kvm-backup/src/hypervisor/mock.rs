//! In-memory hypervisor used by the workflow tests.
//!
//! Disks follow the real life cycle closely enough for the engine: a snapshot
//! moves each disk onto its overlay, a commit starts an active-commit job, a
//! pivot on a ready job moves the disk back onto its base image.

use super::{BlockInfo, BlockJob, BlockJobKind, DomainState, Hypervisor, XmlKind};
use crate::executor::snapshot::SnapshotDescriptor;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// A request the engine made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSnapshot(String),
    BlockCommit(String),
    Pivot(String),
    Shutdown,
    Start,
}

/// How active-commit jobs behave once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitBehavior {
    /// Ready after this many `block_job` polls
    ReadyAfter(u32),
    /// Mirrors forever, never pivotable
    NeverReady,
    /// The job is gone on the first poll
    Vanish,
}

#[derive(Debug)]
struct MockDisk {
    target: String,
    base: PathBuf,
    current: PathBuf,
    allocation: u64,
    job_polls: Option<u32>,
}

#[derive(Debug)]
struct MockDomain {
    state: DomainState,
    disks: Vec<MockDisk>,
    label: Option<String>,
}

#[derive(Debug)]
struct State {
    domains: HashMap<String, MockDomain>,
    calls: Vec<Call>,
    failing_block_info: HashSet<String>,
    snapshot_ignored: HashSet<String>,
    reject_snapshot: bool,
    lose_snapshot_reply: bool,
    commit_behavior: CommitBehavior,
    live_xml_failures: u32,
    ignore_power: bool,
}

pub struct MockHypervisor {
    state: Mutex<State>,
}

/// Fluent setup for one domain.
pub struct DomainBuilder<'a> {
    hv: &'a MockHypervisor,
    name: String,
}

impl DomainBuilder<'_> {
    pub fn disk(self, target: &str, file: impl AsRef<Path>, allocation: u64) -> Self {
        {
            let mut state = self.hv.lock();
            if let Some(domain) = state.domains.get_mut(&self.name) {
                domain.disks.push(MockDisk {
                    target: target.to_string(),
                    base: file.as_ref().to_path_buf(),
                    current: file.as_ref().to_path_buf(),
                    allocation,
                    job_polls: None,
                });
            }
        }
        self
    }

    pub fn label(self, label: &str) -> Self {
        {
            let mut state = self.hv.lock();
            if let Some(domain) = state.domains.get_mut(&self.name) {
                domain.label = Some(label.to_string());
            }
        }
        self
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                domains: HashMap::new(),
                calls: Vec::new(),
                failing_block_info: HashSet::new(),
                snapshot_ignored: HashSet::new(),
                reject_snapshot: false,
                lose_snapshot_reply: false,
                commit_behavior: CommitBehavior::ReadyAfter(2),
                live_xml_failures: 0,
                ignore_power: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_domain(&self, name: &str, state: DomainState) -> DomainBuilder<'_> {
        self.lock().domains.insert(
            name.to_string(),
            MockDomain {
                state,
                disks: Vec::new(),
                label: None,
            },
        );
        DomainBuilder {
            hv: self,
            name: name.to_string(),
        }
    }

    pub fn fail_block_info(&self, device: &str) {
        self.lock().failing_block_info.insert(device.to_string());
    }

    /// Snapshots succeed but leave `device` on its original file.
    pub fn ignore_snapshot_for(&self, device: &str) {
        self.lock().snapshot_ignored.insert(device.to_string());
    }

    pub fn reject_snapshot(&self) {
        self.lock().reject_snapshot = true;
    }

    /// The snapshot is applied but the request still reports an error.
    pub fn lose_snapshot_reply(&self) {
        self.lock().lose_snapshot_reply = true;
    }

    pub fn set_commit_behavior(&self, behavior: CommitBehavior) {
        self.lock().commit_behavior = behavior;
    }

    /// The next `n` live XML queries fail.
    pub fn fail_next_live_xml(&self, n: u32) {
        self.lock().live_xml_failures = n;
    }

    /// Shutdown and start requests are accepted but never take effect.
    pub fn ignore_power_requests(&self) {
        self.lock().ignore_power = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn state_of(&self, domain: &str) -> Option<DomainState> {
        self.lock().domains.get(domain).map(|d| d.state)
    }

    pub fn current(&self, domain: &str, device: &str) -> Option<PathBuf> {
        self.lock()
            .domains
            .get(domain)
            .and_then(|d| d.disks.iter().find(|disk| disk.target == device))
            .map(|disk| disk.current.clone())
    }

    pub fn persistent_xml(&self, domain: &str) -> String {
        self.render(domain, true).unwrap_or_default()
    }

    fn render(&self, domain: &str, persistent: bool) -> Result<String> {
        let state = self.lock();
        let dom = state
            .domains
            .get(domain)
            .ok_or_else(|| BackupError::Hypervisor(format!("domain not found: {domain}")))?;

        let mut xml = format!("<domain type='kvm'>\n  <name>{domain}</name>\n  <devices>\n");
        for disk in &dom.disks {
            let file = if persistent { &disk.base } else { &disk.current };
            xml.push_str(&format!(
                "    <disk type='file' device='disk'>\n      <source file='{}'/>\n      <target dev='{}' bus='virtio'/>\n    </disk>\n",
                file.display(),
                disk.target
            ));
        }
        xml.push_str("  </devices>\n");
        if let Some(label) = &dom.label {
            xml.push_str(&format!(
                "  <seclabel type='dynamic' model='apparmor' relabel='yes'>\n    <label>{label}</label>\n  </seclabel>\n"
            ));
        }
        xml.push_str("</domain>\n");
        Ok(xml)
    }

    fn with_disk<T>(
        &self,
        domain: &str,
        device: &str,
        f: impl FnOnce(&mut MockDisk, CommitBehavior) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let behavior = state.commit_behavior;
        let disk = state
            .domains
            .get_mut(domain)
            .and_then(|d| d.disks.iter_mut().find(|disk| disk.target == device))
            .ok_or_else(|| BackupError::Hypervisor(format!("no disk {device} on {domain}")))?;
        f(disk, behavior)
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn domain_state(&self, domain: &str) -> Result<DomainState> {
        self.state_of(domain)
            .ok_or_else(|| BackupError::Hypervisor(format!("domain not found: {domain}")))
    }

    async fn domain_xml(&self, domain: &str, kind: XmlKind) -> Result<String> {
        if kind == XmlKind::Live {
            let mut state = self.lock();
            if state.live_xml_failures > 0 {
                state.live_xml_failures -= 1;
                return Err(BackupError::Hypervisor("connection reset".into()));
            }
        }
        self.render(domain, kind == XmlKind::Persistent)
    }

    async fn block_info(&self, domain: &str, device: &str) -> Result<BlockInfo> {
        if self.lock().failing_block_info.contains(device) {
            return Err(BackupError::Hypervisor(format!("cannot stat {device}")));
        }
        self.with_disk(domain, device, |disk, _| {
            Ok(BlockInfo {
                capacity: disk.allocation * 2,
                allocation: disk.allocation,
                physical: disk.allocation,
            })
        })
    }

    async fn create_snapshot(&self, domain: &str, snapshot: &SnapshotDescriptor) -> Result<()> {
        self.record(Call::CreateSnapshot(snapshot.name.clone()));
        if self.lock().reject_snapshot {
            return Err(BackupError::Hypervisor("snapshot rejected".into()));
        }

        for target in &snapshot.overlays {
            if self.lock().snapshot_ignored.contains(&target.device) {
                continue;
            }
            self.with_disk(domain, &target.device, |disk, _| {
                disk.current = target.overlay.clone();
                Ok(())
            })?;
            if target.overlay.parent().is_some_and(Path::is_dir) {
                let _ = std::fs::write(&target.overlay, b"overlay");
            }
        }
        if self.lock().lose_snapshot_reply {
            return Err(BackupError::Hypervisor("connection reset by peer".into()));
        }
        Ok(())
    }

    async fn block_commit(&self, domain: &str, device: &str) -> Result<()> {
        self.record(Call::BlockCommit(device.to_string()));
        self.with_disk(domain, device, |disk, _| {
            if disk.current == disk.base {
                return Err(BackupError::Hypervisor(format!("{device} has no overlay to commit")));
            }
            disk.job_polls = Some(0);
            Ok(())
        })
    }

    async fn block_job(&self, domain: &str, device: &str) -> Result<Option<BlockJob>> {
        self.with_disk(domain, device, |disk, behavior| {
            let Some(polls) = disk.job_polls else {
                return Ok(None);
            };
            let polls = polls + 1;
            disk.job_polls = Some(polls);
            let cur = match behavior {
                CommitBehavior::ReadyAfter(n) if polls >= n => 100,
                CommitBehavior::ReadyAfter(_) | CommitBehavior::NeverReady => 50,
                CommitBehavior::Vanish => {
                    disk.job_polls = None;
                    return Ok(None);
                }
            };
            Ok(Some(BlockJob {
                kind: BlockJobKind::ActiveCommit,
                cur,
                end: 100,
            }))
        })
    }

    async fn pivot(&self, domain: &str, device: &str) -> Result<()> {
        self.record(Call::Pivot(device.to_string()));
        self.with_disk(domain, device, |disk, behavior| {
            let ready = match (disk.job_polls, behavior) {
                (Some(polls), CommitBehavior::ReadyAfter(n)) => polls >= n,
                _ => false,
            };
            if !ready {
                return Err(BackupError::Hypervisor("block job not ready for pivot".into()));
            }
            disk.current = disk.base.clone();
            disk.job_polls = None;
            Ok(())
        })
    }

    async fn shutdown(&self, domain: &str) -> Result<()> {
        self.record(Call::Shutdown);
        let mut state = self.lock();
        let ignore = state.ignore_power;
        if let Some(dom) = state.domains.get_mut(domain) {
            if !ignore {
                dom.state = DomainState::Shutoff;
            }
        }
        Ok(())
    }

    async fn start(&self, domain: &str) -> Result<()> {
        self.record(Call::Start);
        let mut state = self.lock();
        let ignore = state.ignore_power;
        if let Some(dom) = state.domains.get_mut(domain) {
            if !ignore {
                dom.state = DomainState::Running;
            }
        }
        Ok(())
    }
}
