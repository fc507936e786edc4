//! Configuration management for kvm-backup.
//!
//! Loads configuration from an optional TOML file layered with
//! `KVM_BACKUP__<SECTION>__<KEY>` environment overrides. Command line flags are
//! applied on top by the binary.

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default safety margin kept free on the destination (10 GiB).
pub const DEFAULT_SPACE_MARGIN: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Backup destination root; one subdirectory per VM
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Number of backups to keep per VM
    #[serde(default = "default_keep")]
    pub keep: usize,

    /// Minutes to wait for a block commit to become pivotable
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_minutes: u64,

    /// Copy bandwidth limit in KiB/s (0 = unlimited)
    #[serde(default)]
    pub bandwidth_limit: u64,

    /// Only print what would be done
    #[serde(default)]
    pub dry_run: bool,

    /// Delete the temporary overlay once the pivot completed
    #[serde(default)]
    pub remove_tmp_file: bool,

    /// Device allow-list (target names); empty means every disk
    #[serde(default)]
    pub disks: Vec<String>,

    /// Skip VMs that are running
    #[serde(default)]
    pub no_active: bool,

    /// Shut running VMs down, copy offline, start them again
    #[serde(default)]
    pub force_no_active: bool,

    /// Seconds to wait for a shutdown or start to take effect
    #[serde(default = "default_power_timeout")]
    pub power_timeout_secs: u64,

    /// Free space that must remain after the backup, in bytes
    #[serde(default = "default_space_margin")]
    pub space_margin: u64,

    /// Stop processing the remaining VMs after the first failed one
    #[serde(default)]
    pub abort_on_failure: bool,

    /// Virtual machines to back up, in order
    #[serde(default)]
    pub vms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// libvirt connection URI
    #[serde(default = "default_uri")]
    pub uri: String,

    /// virsh executable
    #[serde(default = "default_virsh")]
    pub virsh: PathBuf,
}

/// Where backup outcome messages go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum NotifyConfig {
    /// Messages only end up in the log
    #[default]
    Log,

    /// Piped into a local sendmail-compatible MTA
    Sendmail {
        #[serde(default = "default_mail_from")]
        from: String,
        to: Vec<String>,
        #[serde(default = "default_sendmail")]
        program: PathBuf,
    },

    /// POSTed as JSON
    Webhook { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Toggle the VM's AppArmor profile around the snapshot window
    #[serde(default = "default_true")]
    pub apparmor: bool,

    /// Directory holding the per-VM libvirt profiles
    #[serde(default = "default_profile_dir")]
    pub profile_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// What to do with a VM that is running when its turn comes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePolicy {
    /// External snapshot + block commit while it keeps running
    Live,
    /// Leave it alone
    Skip,
    /// Shut down, copy offline, start again
    PowerCycle,
}

// Default values
fn default_destination() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_keep() -> usize {
    2
}

fn default_commit_timeout() -> u64 {
    60
}

fn default_power_timeout() -> u64 {
    30
}

fn default_space_margin() -> u64 {
    DEFAULT_SPACE_MARGIN
}

fn default_uri() -> String {
    "qemu:///system".to_string()
}

fn default_virsh() -> PathBuf {
    PathBuf::from("virsh")
}

fn default_mail_from() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("KVM backup <root@{host}>")
}

fn default_sendmail() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

fn default_true() -> bool {
    true
}

fn default_profile_dir() -> PathBuf {
    PathBuf::from("/etc/apparmor.d/libvirt")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            keep: default_keep(),
            commit_timeout_minutes: default_commit_timeout(),
            bandwidth_limit: 0,
            dry_run: false,
            remove_tmp_file: false,
            disks: Vec::new(),
            no_active: false,
            force_no_active: false,
            power_timeout_secs: default_power_timeout(),
            space_margin: default_space_margin(),
            abort_on_failure: false,
            vms: Vec::new(),
        }
    }
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            virsh: default_virsh(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            apparmor: default_true(),
            profile_dir: default_profile_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackupConfig {
    pub fn active_policy(&self) -> ActivePolicy {
        if self.force_no_active {
            ActivePolicy::PowerCycle
        } else if self.no_active {
            ActivePolicy::Skip
        } else {
            ActivePolicy::Live
        }
    }

    /// True when `device` passes the allow-list.
    pub fn wants_disk(&self, device: &str) -> bool {
        self.disks.is_empty() || self.disks.iter().any(|d| d == device)
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path.to_path_buf()).format(::config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("KVM_BACKUP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Reject option combinations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.backup.vms.is_empty() {
            return Err(BackupError::Config("no virtual machines to back up".into()));
        }
        if self.backup.no_active && self.backup.force_no_active {
            return Err(BackupError::Config(
                "no_active and force_no_active are mutually exclusive".into(),
            ));
        }
        if self.backup.keep == 0 {
            return Err(BackupError::Config("keep must be at least one backup".into()));
        }
        if self.backup.commit_timeout_minutes == 0 {
            return Err(BackupError::Config("commit timeout must be at least one minute".into()));
        }
        if let NotifyConfig::Sendmail { to, .. } = &self.notify {
            if to.is_empty() {
                return Err(BackupError::Config("sendmail notification needs a recipient".into()));
            }
        }
        Ok(())
    }
}
