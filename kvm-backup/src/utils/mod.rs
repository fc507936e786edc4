//! Utility modules for kvm-backup.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
