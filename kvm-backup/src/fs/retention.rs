//! Retention pruning of old backup directories.

use super::layout::{list_backups, BackupRecord};
use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of one pruning pass.
#[derive(Debug, Default)]
pub struct RetentionReport {
    /// Records left in place, newest first
    pub kept: Vec<BackupRecord>,
    /// Directories removed (or, in dry-run mode, that would be removed), oldest first
    pub removed: Vec<PathBuf>,
    /// Directories that could not be removed
    pub failed: Vec<(PathBuf, String)>,
    pub dry_run: bool,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// One-line description for notifications.
    pub fn summary(&self) -> String {
        let verb = if self.dry_run { "would remove" } else { "removed" };
        let mut line = format!("kept {}, {} {}", self.kept.len(), verb, self.removed.len());
        if !self.is_clean() {
            line.push_str(&format!(", {} could not be removed", self.failed.len()));
        }
        line
    }
}

/// Split newest-first records into (kept, expired). Expired comes back oldest first.
pub fn split_expired(records: Vec<BackupRecord>, keep: usize) -> (Vec<BackupRecord>, Vec<BackupRecord>) {
    let mut records = records;
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    if records.len() <= keep {
        return (records, Vec::new());
    }

    let mut expired = records.split_off(keep);
    expired.reverse();
    (records, expired)
}

/// Keep the `keep` newest backups under `domain_root`, remove the rest.
///
/// Only a listing failure is returned as an error; individual removal failures
/// land in [`RetentionReport::failed`].
pub fn prune(domain_root: &Path, keep: usize, dry_run: bool) -> Result<RetentionReport> {
    let records = list_backups(domain_root).map_err(|e| {
        BackupError::Retention(format!("cannot list {}: {}", domain_root.display(), e))
    })?;

    info!(
        root = %domain_root.display(),
        existing = records.len(),
        keep,
        "Applying retention"
    );

    let (kept, expired) = split_expired(records, keep);
    let mut report = RetentionReport {
        kept,
        dry_run,
        ..Default::default()
    };

    for record in expired {
        if dry_run {
            println!("** will remove:{}", record.path.display());
            report.removed.push(record.path);
            continue;
        }

        match std::fs::remove_dir_all(&record.path) {
            Ok(()) => {
                info!(path = %record.path.display(), "Deleted old backup");
                report.removed.push(record.path);
            }
            Err(e) => {
                warn!(path = %record.path.display(), "Cannot remove backup folder: {}", e);
                report.failed.push((record.path, e.to_string()));
            }
        }
    }

    Ok(report)
}
