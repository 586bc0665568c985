/// Shared device access
pub mod types;

pub use types::BlockDevice;
