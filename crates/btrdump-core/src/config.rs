/// Run configuration for the dump and restore engines
use serde::Serialize;

use crate::error::{MetadumpError, Result};
pub use crate::fixup::FixupStrategy;

pub const MAX_THREADS: usize = 32;
pub const MAX_COMPRESS_LEVEL: u32 = 9;

/// Dump engine configuration
#[derive(Debug, Clone, Serialize)]
pub struct DumpConfig {
    /// Worker threads; `None` picks one per CPU when compressing, else none
    pub threads: Option<usize>,
    /// zlib level, 0 stores items uncompressed
    pub compress_level: u32,
    /// Find metadata by walking the trees instead of the extent tree
    pub walk_trees: bool,
    /// Also capture the data extents backing the free space cache
    pub capture_space_cache: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            threads: None,
            compress_level: 0,
            walk_trees: false,
            capture_space_cache: true,
        }
    }
}

impl DumpConfig {
    pub fn validate(&self) -> Result<()> {
        validate_threads(self.threads)?;
        if self.compress_level > MAX_COMPRESS_LEVEL {
            return Err(MetadumpError::InvalidConfig(format!(
                "compression level {} is outside 0-{}",
                self.compress_level, MAX_COMPRESS_LEVEL
            )));
        }
        Ok(())
    }

    /// Number of worker threads to spawn
    pub fn worker_threads(&self) -> usize {
        match self.threads {
            Some(n) => n,
            None if self.compress_level > 0 => available_threads(),
            None => 0,
        }
    }
}

/// Restore engine configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreConfig {
    /// Worker threads; `None` picks one per CPU
    pub threads: Option<usize>,
    pub fixup: FixupStrategy,
}

impl RestoreConfig {
    pub fn validate(&self) -> Result<()> {
        validate_threads(self.threads)
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(available_threads)
    }
}

fn validate_threads(threads: Option<usize>) -> Result<()> {
    match threads {
        Some(n) if n == 0 || n > MAX_THREADS => Err(MetadumpError::InvalidConfig(format!(
            "thread count {} is outside 1-{}",
            n, MAX_THREADS
        ))),
        _ => Ok(()),
    }
}

fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(MAX_THREADS))
        .unwrap_or(1)
}
