//! Image copy and transfer statistics.

pub mod copy;
pub mod progress;
