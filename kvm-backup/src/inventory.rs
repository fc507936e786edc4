//! Disk discovery and selection for one domain.

use crate::config::BackupConfig;
use crate::fs::layout::BackupTimestamp;
use crate::hypervisor::{xml, Hypervisor};
use crate::transfer::progress::format_bytes;
use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file-backed disk of a domain, as found when the job started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Target device name, e.g. `vda`
    pub name: String,
    /// Backing file before any snapshot
    pub file: PathBuf,
    pub file_dir: PathBuf,
    pub file_base: String,
    /// Host bytes occupied by the image (0 for excluded devices)
    pub allocation: u64,
}

impl Device {
    pub fn new(name: impl Into<String>, file: impl Into<PathBuf>, allocation: u64) -> Self {
        let file = file.into();
        let file_dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
        let file_base = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            name: name.into(),
            file,
            file_dir,
            file_base,
            allocation,
        }
    }

    /// Temporary overlay created next to the image: `<dir>/<timestamp>_<basename>`.
    pub fn overlay_path(&self, timestamp: BackupTimestamp) -> PathBuf {
        self.file_dir.join(format!("{}_{}", timestamp, self.file_base))
    }
}

/// The partition of a domain's disks for one job.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelection {
    /// Disks to back up, in definition order
    pub selected: Vec<Device>,
    /// Disks left out by the allow-list; they must be marked as not snapshotted
    pub excluded: Vec<Device>,
    pub total_allocation: u64,
    /// AppArmor profile label from the persistent definition
    pub security_label: Option<String>,
}

/// Partition the disks of `persistent_xml` according to the allow-list and
/// accumulate the allocation of the selected ones.
///
/// A device whose allocation cannot be queried is logged and excluded like an
/// allow-list miss, so the snapshot leaves it on its own file. It is never fatal.
pub async fn select_devices(
    hypervisor: &dyn Hypervisor,
    domain: &str,
    persistent_xml: &str,
    options: &BackupConfig,
) -> Result<DeviceSelection> {
    let mut selection = DeviceSelection {
        security_label: xml::security_label(persistent_xml)?,
        ..Default::default()
    };

    for disk in xml::file_disks(persistent_xml)? {
        if !options.wants_disk(&disk.target) {
            debug!(domain, device = %disk.target, "Excluded by disk allow-list");
            selection.excluded.push(Device::new(disk.target, disk.source, 0));
            continue;
        }

        let info = match hypervisor.block_info(domain, &disk.target).await {
            Ok(info) => info,
            Err(e) => {
                let err = BackupError::Inventory(format!("{} {}: {}", domain, disk.target, e));
                warn!(domain, device = %disk.target, "Skipping device: {}", err);
                selection.excluded.push(Device::new(disk.target, disk.source, 0));
                continue;
            }
        };

        selection.total_allocation += info.allocation;
        debug!(
            domain,
            device = %disk.target,
            file = %disk.source.display(),
            allocation = %format_bytes(info.allocation),
            total = %format_bytes(selection.total_allocation),
            "Found device"
        );
        selection
            .selected
            .push(Device::new(disk.target, disk.source, info.allocation));
    }

    Ok(selection)
}
