//! Reading the bits of libvirt domain XML the backup cares about.

use crate::utils::{BackupError, Result};
use roxmltree::{Document, Node};
use std::path::PathBuf;
use tracing::debug;

/// A file-backed disk (`<disk type='file' device='disk'>`) of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    /// Target device name, e.g. `vda`
    pub target: String,
    /// Backing file of the top of the chain
    pub source: PathBuf,
}

fn parse(xml: &str) -> Result<Document<'_>> {
    Document::parse(xml).map_err(|e| BackupError::Hypervisor(format!("invalid domain XML: {e}")))
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn file_disk_nodes<'a, 'input>(doc: &'a Document<'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    child(doc.root_element(), "devices")
        .into_iter()
        .flat_map(|devices| devices.children())
        .filter(|n| {
            n.has_tag_name("disk")
                && n.attribute("device") == Some("disk")
                && n.attribute("type") == Some("file")
        })
}

/// File-backed disks in document order. Disks without a target name or a file
/// source are not images that can be copied and are skipped.
pub fn file_disks(xml: &str) -> Result<Vec<DiskEntry>> {
    let doc = parse(xml)?;
    let mut disks = Vec::new();

    for disk in file_disk_nodes(&doc) {
        let target = child(disk, "target").and_then(|t| t.attribute("dev"));
        let source = child(disk, "source").and_then(|s| s.attribute("file"));

        match (target, source) {
            (Some(target), Some(source)) => disks.push(DiskEntry {
                target: target.to_string(),
                source: PathBuf::from(source),
            }),
            _ => debug!(?target, ?source, "Skipping disk without target or file source"),
        }
    }

    Ok(disks)
}

/// The file currently backing `device`.
pub fn current_file(xml: &str, device: &str) -> Result<PathBuf> {
    file_disks(xml)?
        .into_iter()
        .find(|d| d.target == device)
        .map(|d| d.source)
        .ok_or_else(|| BackupError::Hypervisor(format!("cannot find device name {device}")))
}

/// The AppArmor profile label of the domain, if it carries one.
pub fn security_label(xml: &str) -> Result<Option<String>> {
    let doc = parse(xml)?;
    let label = doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("seclabel") && n.attribute("model") == Some("apparmor"))
        .find_map(|n| child(n, "label").and_then(|l| l.text()))
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    Ok(label)
}
