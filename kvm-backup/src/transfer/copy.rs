//! Disk image copy into the backup directory.
//!
//! Images are copied with an external tool so holes stay holes: `cp
//! --sparse=always` when unlimited, `rsync --sparse --bwlimit` when a bandwidth
//! limit is configured.

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait Copier: Send + Sync {
    /// Copy `source` into `dest_dir` under its own file name.
    async fn copy(&self, source: &Path, dest_dir: &Path) -> Result<()>;

    /// The command that `copy` runs, for dry-run output.
    fn describe(&self, source: &Path, dest_dir: &Path) -> String;
}

/// Copier shelling out to `cp` or `rsync`.
#[derive(Debug, Clone)]
pub struct CommandCopier {
    /// KiB/s, 0 = unlimited
    bandwidth_limit: u64,
}

impl CommandCopier {
    pub fn new(bandwidth_limit: u64) -> Self {
        Self { bandwidth_limit }
    }

    /// Program and arguments for one copy.
    pub fn command_line(&self, source: &Path, dest_dir: &Path) -> Vec<OsString> {
        let mut dest = dest_dir.as_os_str().to_os_string();
        dest.push("/");

        let mut argv: Vec<OsString> = if self.bandwidth_limit == 0 {
            vec!["cp".into(), "--sparse=always".into()]
        } else {
            vec![
                "rsync".into(),
                "--sparse".into(),
                format!("--bwlimit={}", self.bandwidth_limit).into(),
            ]
        };
        argv.push(source.as_os_str().to_os_string());
        argv.push(dest);
        argv
    }
}

#[async_trait]
impl Copier for CommandCopier {
    async fn copy(&self, source: &Path, dest_dir: &Path) -> Result<()> {
        let argv = self.command_line(source, dest_dir);
        let (program, args) = argv.split_first().ok_or_else(|| BackupError::Copy {
            source_file: source.to_path_buf(),
            reason: "empty copy command".into(),
        })?;

        debug!(command = %self.describe(source, dest_dir), "Copying image");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::Copy {
                source_file: source.to_path_buf(),
                reason: format!("cannot run {}: {}", program.to_string_lossy(), e),
            })?;

        if !output.status.success() {
            return Err(BackupError::Copy {
                source_file: source.to_path_buf(),
                reason: format!(
                    "{} exited with {}: {}",
                    program.to_string_lossy(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        info!(source = %source.display(), dest = %dest_dir.display(), "Copied image");
        Ok(())
    }

    fn describe(&self, source: &Path, dest_dir: &Path) -> String {
        self.command_line(source, dest_dir)
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Test copier: records every request, copies with `std::fs::copy`, and fails
/// for configured sources.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingCopier {
    copies: std::sync::Mutex<Vec<(std::path::PathBuf, std::path::PathBuf)>>,
    failing: std::sync::Mutex<Vec<std::path::PathBuf>>,
}

#[cfg(test)]
impl RecordingCopier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, source: impl AsRef<Path>) {
        self.failing.lock().unwrap().push(source.as_ref().to_path_buf());
    }

    pub fn copies(&self) -> Vec<(std::path::PathBuf, std::path::PathBuf)> {
        self.copies.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Copier for RecordingCopier {
    async fn copy(&self, source: &Path, dest_dir: &Path) -> Result<()> {
        self.copies
            .lock()
            .unwrap()
            .push((source.to_path_buf(), dest_dir.to_path_buf()));

        if self.failing.lock().unwrap().iter().any(|f| f == source) {
            return Err(BackupError::Copy {
                source_file: source.to_path_buf(),
                reason: "No space left on device".into(),
            });
        }

        let name = source.file_name().unwrap_or_default();
        if source.exists() {
            std::fs::copy(source, dest_dir.join(name))?;
        } else {
            std::fs::write(dest_dir.join(name), b"image")?;
        }
        Ok(())
    }

    fn describe(&self, source: &Path, dest_dir: &Path) -> String {
        format!("copy {} {}", source.display(), dest_dir.display())
    }
}
