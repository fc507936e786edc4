//! Error taxonomy for the backup workflow.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup destination free space too small: need {required} bytes, {available} available")]
    Capacity { required: u64, available: u64 },

    #[error("Failed to open connection to the hypervisor {uri}: {reason}")]
    Connection { uri: String, reason: String },

    #[error("backup destination unavailable ({}): {reason}", path.display())]
    DestinationUnavailable { path: PathBuf, reason: String },

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Snapshot failed for {domain}: {reason}")]
    Snapshot { domain: String, reason: String },

    #[error("Copy of {} failed: {reason}", source_file.display())]
    Copy { source_file: PathBuf, reason: String },

    #[error("Timeout in blockcommit for {domain} {device} (minutes {minutes})")]
    CommitTimeout {
        domain: String,
        device: String,
        minutes: u64,
    },

    #[error("Block commit job for {domain} {device} disappeared before pivot")]
    CommitJobDisappeared { domain: String, device: String },

    #[error("Cleanup warning: {0}")]
    Cleanup(String),

    #[error("Retention error: {0}")]
    Retention(String),

    #[error("Timeout waiting for {domain} to reach state {target} ({seconds}s)")]
    PowerTransitionTimeout {
        domain: String,
        target: String,
        seconds: u64,
    },

    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    #[error("Security profile error: {0}")]
    Security(String),

    #[error("{failed} of {total} device(s) failed for {domain}")]
    DeviceFailures {
        domain: String,
        failed: usize,
        total: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Errors that end the whole run instead of only the current VM.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, BackupError::Capacity { .. } | BackupError::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
