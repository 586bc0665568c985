/// Source filesystem access
pub mod btrfs;
pub mod common;

pub use common::BlockDevice;
