//! Free-space gate for the destination.
//!
//! Free space is sampled once when the run starts and never decremented, so
//! each VM is checked against the original figure.

use crate::transfer::progress::format_bytes;
use crate::utils::{BackupError, Result};
use nix::sys::statvfs::statvfs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityBudget {
    /// Bytes available to unprivileged writers on the destination
    pub free_bytes: u64,
    /// Bytes that must stay free after the backup
    pub margin: u64,
}

impl CapacityBudget {
    pub fn new(free_bytes: u64, margin: u64) -> Self {
        Self { free_bytes, margin }
    }

    /// Sample the free space of the filesystem holding `destination`.
    pub fn sample(destination: &Path, margin: u64) -> Result<Self> {
        let stat = statvfs(destination).map_err(|errno| BackupError::DestinationUnavailable {
            path: destination.to_path_buf(),
            reason: std::io::Error::from(errno).to_string(),
        })?;

        let free_bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
        tracing::info!(
            destination = %destination.display(),
            free = %format_bytes(free_bytes),
            margin = %format_bytes(margin),
            "Sampled destination free space"
        );
        Ok(Self::new(free_bytes, margin))
    }

    /// Passes iff `allocation + margin <= free`.
    pub fn check(&self, allocation: u64) -> Result<()> {
        let required = allocation.saturating_add(self.margin);
        if required > self.free_bytes {
            return Err(BackupError::Capacity {
                required,
                available: self.free_bytes,
            });
        }
        Ok(())
    }
}
