//! External snapshot request for one backup job.

use crate::fs::layout::BackupTimestamp;
use crate::inventory::Device;
use std::fmt::Write;
use std::path::PathBuf;

/// Overlay target for one snapshotted disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayTarget {
    pub device: String,
    pub overlay: PathBuf,
}

/// Everything the hypervisor needs to redirect the selected disks at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    /// Sortable job name, identical to the backup directory name
    pub name: String,
    pub overlays: Vec<OverlayTarget>,
    /// Disks that must explicitly stay out of the snapshot
    pub excluded: Vec<String>,
}

impl SnapshotDescriptor {
    pub fn new(timestamp: BackupTimestamp, selected: &[Device], excluded: &[Device]) -> Self {
        Self {
            name: timestamp.to_string(),
            overlays: selected
                .iter()
                .map(|d| OverlayTarget {
                    device: d.name.clone(),
                    overlay: d.overlay_path(timestamp),
                })
                .collect(),
            excluded: excluded.iter().map(|d| d.name.clone()).collect(),
        }
    }

    /// `<domainsnapshot>` document for `snapshot-create`.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<domainsnapshot>\n");
        let _ = writeln!(xml, "  <name>{}</name>", escape(&self.name));
        xml.push_str("  <description>external snapshot for backup</description>\n");
        xml.push_str("  <memory snapshot='no'/>\n");
        xml.push_str("  <disks>\n");
        for target in &self.overlays {
            let _ = writeln!(xml, "    <disk name='{}' snapshot='external'>", escape(&target.device));
            let _ = writeln!(
                xml,
                "      <source file='{}'/>",
                escape(&target.overlay.to_string_lossy())
            );
            xml.push_str("      <driver type='qcow2'/>\n");
            xml.push_str("    </disk>\n");
        }
        for device in &self.excluded {
            let _ = writeln!(xml, "    <disk name='{}' snapshot='no'/>", escape(device));
        }
        xml.push_str("  </disks>\n");
        xml.push_str("</domainsnapshot>\n");
        xml
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
