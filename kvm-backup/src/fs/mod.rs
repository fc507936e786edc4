//! Backup destination layout and retention.

pub mod layout;
pub mod retention;
