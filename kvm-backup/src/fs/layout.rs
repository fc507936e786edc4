//! Backup destination layout.
//!
//! ```text
//! <destination>/<vm>/<timestamp>/<vm>.xml
//!                               /<disk basename>...
//! ```
//!
//! A backup record is any subdirectory of the VM root whose name parses as a
//! [`BackupTimestamp`]. Everything else in the VM root is ignored.

use crate::utils::{BackupError, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory name format. Filesystem safe and sorts chronologically.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S";

/// Second-resolution local time naming one backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupTimestamp(NaiveDateTime);

impl BackupTimestamp {
    pub fn now() -> Self {
        Self::from_naive(Local::now().naive_local())
    }

    pub fn from_naive(time: NaiveDateTime) -> Self {
        Self(time.with_nanosecond(0).unwrap_or(time))
    }

    /// Returns None for anything that is not a backup directory name.
    pub fn parse(name: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(name, TIMESTAMP_FORMAT)
            .ok()
            .map(Self)
    }
}

impl fmt::Display for BackupTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

/// One retained backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub timestamp: BackupTimestamp,
    pub path: PathBuf,
}

/// `<destination>/<domain>`
pub fn domain_root(destination: &Path, domain: &str) -> PathBuf {
    destination.join(domain)
}

/// `<domain root>/<timestamp>`
pub fn backup_dir(domain_root: &Path, timestamp: BackupTimestamp) -> PathBuf {
    domain_root.join(timestamp.to_string())
}

/// `<backup dir>/<domain>.xml`
pub fn config_export_path(backup_dir: &Path, domain: &str) -> PathBuf {
    backup_dir.join(format!("{domain}.xml"))
}

/// Create the VM root if needed and list its records.
///
/// This is the step that proves the destination is usable before anything is
/// snapshotted. In dry-run mode nothing is created and a missing root lists as
/// empty.
pub fn prepare_domain_root(domain_root: &Path, dry_run: bool) -> Result<Vec<BackupRecord>> {
    if dry_run {
        if !domain_root.exists() {
            println!("** will create {}", domain_root.display());
            return Ok(Vec::new());
        }
    } else {
        std::fs::create_dir_all(domain_root).map_err(|e| BackupError::DestinationUnavailable {
            path: domain_root.to_path_buf(),
            reason: e.to_string(),
        })?;
    }

    list_backups(domain_root).map_err(|e| BackupError::DestinationUnavailable {
        path: domain_root.to_path_buf(),
        reason: e.to_string(),
    })
}

/// List backup records under a VM root, newest first.
pub fn list_backups(domain_root: &Path) -> std::io::Result<Vec<BackupRecord>> {
    let mut records = Vec::new();

    for entry in WalkDir::new(domain_root).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        match BackupTimestamp::parse(&name) {
            Some(timestamp) => records.push(BackupRecord {
                timestamp,
                path: entry.path().to_path_buf(),
            }),
            None => tracing::debug!(entry = %name, "Ignoring non-backup entry"),
        }
    }

    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    tracing::debug!(root = %domain_root.display(), count = records.len(), "Listed existing backups");
    Ok(records)
}
