/// Progress notifications and end-of-run summaries
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::container::Compression;
use crate::fixup::FixupStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Superblock,
    ExtentTree,
    TreeWalk,
    LogTrees,
    SpaceCache,
    Restoring,
    Complete,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub stage: Stage,
    pub clusters: u64,
    pub items: u64,
    /// Logical bytes captured or written so far
    pub bytes: u64,
    pub current_operation: String,
}

pub type ProgressCallback = Box<dyn Fn(Progress) + Send + Sync>;

/// Summary of a finished dump
#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fsid: Uuid,
    pub generation: u64,
    pub nodesize: u32,
    /// Filesystem size and usage as recorded in the source superblock
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub compression: Compression,
    pub compress_level: u32,
    pub threads: usize,
    pub walk_trees: bool,
    pub tree_blocks: u64,
    pub data_extents: u64,
    pub data_bytes: u64,
    pub items: u64,
    /// Includes the end-of-stream cluster
    pub clusters: u64,
    pub container_bytes: u64,
}

/// Summary of a finished restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fsid: Option<Uuid>,
    pub devid: Option<u64>,
    pub device_uuid: Option<Uuid>,
    pub fixup: FixupStrategy,
    pub threads: usize,
    pub clusters: u64,
    pub items: u64,
    pub bytes_written: u64,
    pub chunk_leaves_rewritten: u64,
    pub backup_supers: u64,
    pub end_marker_seen: bool,
}
