//! KVM backup library
//!
//! Consistent backups of running libvirt/KVM guests: an external disk-only
//! snapshot freezes the images, they are copied, and an active block commit
//! folds the overlays back in. Old backups are pruned under a retention policy.

pub mod capacity;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod hypervisor;
pub mod inventory;
pub mod notify;
pub mod runner;
pub mod security;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub use utils::Result;
