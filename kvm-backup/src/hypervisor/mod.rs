//! The narrow slice of the hypervisor control plane the backup workflow needs.
//!
//! [`VirshHypervisor`] is the production adapter; tests drive the workflow
//! through the in-memory fake in [`mock`].

#[cfg(test)]
pub mod mock;
pub mod virsh;
pub mod xml;

use crate::executor::snapshot::SnapshotDescriptor;
use crate::utils::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;

pub use virsh::VirshHypervisor;

/// Power state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    /// Running guests need the snapshot/commit path; their disks are live.
    pub fn is_active(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Paused)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DomainState::Running => "running",
            DomainState::Paused => "paused",
            DomainState::ShuttingDown => "in shutdown",
            DomainState::Shutoff => "shut off",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "pmsuspended",
            DomainState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Which domain XML to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlKind {
    /// The running definition; disk sources follow snapshots and pivots
    Live,
    /// The persistent definition including security labels
    Persistent,
}

/// Sizes reported for one block device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    pub capacity: u64,
    /// Host storage actually occupied by the image
    pub allocation: u64,
    pub physical: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockJobKind {
    Pull,
    Copy,
    Commit,
    ActiveCommit,
    Backup,
    Unknown,
}

/// A running block job on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockJob {
    pub kind: BlockJobKind,
    pub cur: u64,
    pub end: u64,
}

impl BlockJob {
    /// An active commit is pivotable once it has mirrored everything.
    pub fn is_ready(&self) -> bool {
        self.end > 0 && self.cur == self.end
    }
}

/// Hypervisor operations used by the backup workflow.
///
/// Every method is a single control-plane request; waiting and retrying are the
/// caller's business.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn domain_state(&self, domain: &str) -> Result<DomainState>;

    async fn domain_xml(&self, domain: &str, kind: XmlKind) -> Result<String>;

    async fn block_info(&self, domain: &str, device: &str) -> Result<BlockInfo>;

    /// Atomic, disk-only, quiesced external snapshot without libvirt metadata.
    async fn create_snapshot(&self, domain: &str, snapshot: &SnapshotDescriptor) -> Result<()>;

    /// Start an active-layer block commit of the whole chain into its base.
    async fn block_commit(&self, domain: &str, device: &str) -> Result<()>;

    /// The current block job on `device`, if any.
    async fn block_job(&self, domain: &str, device: &str) -> Result<Option<BlockJob>>;

    /// Asynchronously abort the block job with pivot.
    async fn pivot(&self, domain: &str, device: &str) -> Result<()>;

    async fn shutdown(&self, domain: &str) -> Result<()>;

    async fn start(&self, domain: &str) -> Result<()>;

    /// The file the live domain currently uses for `device`.
    async fn current_file(&self, domain: &str, device: &str) -> Result<PathBuf> {
        let live = self.domain_xml(domain, XmlKind::Live).await?;
        xml::current_file(&live, device)
    }
}
