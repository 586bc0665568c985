/// Metadump capture
///
/// Enumerates metadata blocks (from the extent tree, or by walking the trees
/// themselves), coalesces contiguous blocks into pending ranges, sanitizes
/// them, and streams them through the worker pool into ordered clusters.
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use flate2::write::ZlibEncoder;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DumpConfig;
use crate::container::{ClusterWriter, Compression, ITEMS_PER_CLUSTER};
use crate::error::{MetadumpError, Result};
use crate::fs::btrfs::image::{check_level, root_item_bytenr, BtrfsImage};
use crate::fs::btrfs::tree::*;
use crate::fs::btrfs::{BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE};
use crate::pipeline::{Job, WorkItem, WorkQueue, WorkerPool};
use crate::report::{DumpReport, Progress, ProgressCallback, Stage};
use crate::sanitize::sanitize_tree_block;

/// Upper bound on the bytes coalesced into one work item
pub const MAX_PENDING_SIZE: u64 = 256 * 1024;

/// What a pending range holds, which decides how it is read at flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Superblock,
    Metadata,
    Data,
}

/// Contiguous source bytes not yet turned into a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRange {
    pub start: u64,
    pub size: u64,
    pub kind: RangeKind,
}

impl PendingRange {
    pub fn new(start: u64, size: u64, kind: RangeKind) -> Self {
        Self { start, size, kind }
    }

    /// Grow by `size` bytes at `start` if they continue this range.
    ///
    /// Returns false when the caller must flush first.
    pub fn try_extend(&mut self, start: u64, size: u64, kind: RangeKind) -> bool {
        if kind != self.kind
            || kind == RangeKind::Superblock
            || self.start + self.size != start
            || self.size + size > MAX_PENDING_SIZE
        {
            return false;
        }
        self.size += size;
        true
    }
}

#[derive(Debug, Default)]
struct DumpStats {
    tree_blocks: u64,
    data_extents: u64,
    data_bytes: u64,
    items: u64,
}

/// Captures one btrfs image into a container stream
pub struct DumpEngine<W: Write> {
    image: Arc<BtrfsImage>,
    config: DumpConfig,
    compression: Compression,
    writer: ClusterWriter<W>,
    queue: Arc<WorkQueue>,
    pool: WorkerPool,
    pending: Option<PendingRange>,
    visited: HashSet<u64>,
    stats: DumpStats,
    stage: Stage,
    progress_callback: Option<ProgressCallback>,
}

impl<W: Write> DumpEngine<W> {
    pub fn new(image: BtrfsImage, config: DumpConfig, out: W) -> Result<Self> {
        config.validate()?;

        let compression = if config.compress_level > 0 {
            Compression::Deflate
        } else {
            Compression::None
        };
        let level = config.compress_level;
        let job: Job = Arc::new(move |item: &mut WorkItem| compress_item(item, level));
        let queue = Arc::new(WorkQueue::new());
        let pool = WorkerPool::new(config.worker_threads(), Arc::clone(&queue), job)?;

        Ok(Self {
            image: Arc::new(image),
            config,
            compression,
            writer: ClusterWriter::new(out),
            queue,
            pool,
            pending: None,
            visited: HashSet::new(),
            stats: DumpStats::default(),
            stage: Stage::Superblock,
            progress_callback: None,
        })
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Run the whole capture and hand back the container sink
    pub fn run(mut self) -> Result<(DumpReport, W)> {
        let started_at = Utc::now();
        let image = Arc::clone(&self.image);
        let sb = image.superblock().clone();

        tracing::info!(
            "Dumping filesystem {} (generation {}, {} workers, level {})",
            Uuid::from_bytes(sb.fsid),
            sb.generation,
            self.pool.threads(),
            self.config.compress_level
        );

        self.enter_stage(Stage::Superblock, "Capturing superblock");
        self.add_extent(BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE as u64, RangeKind::Superblock)?;

        if self.config.walk_trees {
            self.enter_stage(Stage::TreeWalk, "Walking chunk and root trees");
            self.walk_tree(&image, sb.chunk_root, None, false)?;
            self.walk_tree(&image, sb.root, None, true)?;
        } else {
            self.enter_stage(Stage::ExtentTree, "Scanning extent tree");
            self.copy_from_extent_tree(&image)?;
        }

        if sb.log_root != 0 {
            self.enter_stage(Stage::LogTrees, "Capturing log trees");
            self.walk_tree(&image, sb.log_root, None, true)?;
        }

        if self.config.capture_space_cache {
            self.enter_stage(Stage::SpaceCache, "Capturing free space cache");
            self.copy_space_cache(&image)?;
        }

        self.flush_pending()?;
        self.write_cluster()?;
        // an empty cluster marks a complete stream
        self.writer.write_cluster(self.compression, &[])?;
        self.writer.flush()?;
        self.enter_stage(Stage::Complete, "Dump complete");

        let report = DumpReport {
            started_at,
            finished_at: Utc::now(),
            fsid: Uuid::from_bytes(sb.fsid),
            generation: sb.generation,
            nodesize: sb.nodesize,
            total_bytes: sb.total_bytes,
            bytes_used: sb.bytes_used,
            compression: self.compression,
            compress_level: self.config.compress_level,
            threads: self.pool.threads(),
            walk_trees: self.config.walk_trees,
            tree_blocks: self.stats.tree_blocks,
            data_extents: self.stats.data_extents,
            data_bytes: self.stats.data_bytes,
            items: self.stats.items,
            clusters: self.writer.clusters_written(),
            container_bytes: self.writer.offset(),
        };
        tracing::info!(
            "Dump finished: {} tree blocks, {} data bytes, {} clusters, {} bytes",
            report.tree_blocks,
            report.data_bytes,
            report.clusters,
            report.container_bytes
        );

        let DumpEngine { writer, pool, .. } = self;
        drop(pool);
        Ok((report, writer.into_inner()))
    }

    /// Queue `size` bytes at `start`, flushing whenever the range breaks
    fn add_extent(&mut self, start: u64, size: u64, kind: RangeKind) -> Result<()> {
        if kind == RangeKind::Data && size > MAX_PENDING_SIZE {
            let end = start + size;
            let mut at = start;
            while at < end {
                let len = (end - at).min(MAX_PENDING_SIZE);
                self.add_extent(at, len, kind)?;
                at += len;
            }
            return Ok(());
        }

        let extended = match self.pending.as_mut() {
            Some(pending) => pending.try_extend(start, size, kind),
            None => false,
        };
        if !extended {
            self.flush_pending()?;
            self.pending = Some(PendingRange::new(start, size, kind));
        }
        if kind == RangeKind::Superblock {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// Turn the pending range into a work item
    fn flush_pending(&mut self) -> Result<()> {
        let range = match self.pending.take() {
            Some(range) if range.size > 0 => range,
            _ => return Ok(()),
        };

        let buffer = match range.kind {
            RangeKind::Superblock => self.image.superblock_bytes()?.to_vec(),
            RangeKind::Data => {
                let mut buffer = alloc_buffer(range.size)?;
                self.image.read_data_into(range.start, range.size, &mut buffer)?;
                self.stats.data_extents += 1;
                self.stats.data_bytes += range.size;
                buffer
            }
            RangeKind::Metadata => self.read_sanitized(range)?,
        };

        self.stats.items += 1;
        let item = WorkItem::raw(range.start, buffer);
        if self.compression == Compression::None {
            self.pool.submit_ready(item);
        } else {
            self.pool.submit(item);
        }

        if self.queue.len() >= ITEMS_PER_CLUSTER {
            self.write_cluster()?;
        }
        Ok(())
    }

    fn read_sanitized(&mut self, range: PendingRange) -> Result<Vec<u8>> {
        let nodesize = self.image.nodesize() as u64;
        if range.size % nodesize != 0 {
            return Err(MetadumpError::BadFormat(format!(
                "metadata range {}+{} is not a whole number of {}-byte nodes",
                range.start, range.size, nodesize
            )));
        }

        let mut buffer = alloc_buffer(range.size)?;
        let mut bytenr = range.start;
        while bytenr < range.start + range.size {
            let at = buffer.len();
            buffer.extend_from_slice(self.image.read_tree_block(bytenr)?);
            sanitize_tree_block(&mut buffer[at..], bytenr)?;
            self.stats.tree_blocks += 1;
            bytenr += nodesize;
        }
        Ok(buffer)
    }

    /// Wait for the current batch and write it as one cluster
    fn write_cluster(&mut self) -> Result<()> {
        let items = self.queue.drain_ordered()?;
        if items.is_empty() {
            return Ok(());
        }

        let entries: Vec<(u64, &[u8])> = items
            .iter()
            .map(|item| (item.start, item.buffer.as_slice()))
            .collect();
        self.writer.write_cluster(self.compression, &entries)?;

        self.emit_progress("Wrote cluster");
        Ok(())
    }

    /// Every extent-tree item flagged as a tree block, above the superblock
    fn copy_from_extent_tree(&mut self, image: &BtrfsImage) -> Result<()> {
        let extent_root = image.find_root(BTRFS_EXTENT_TREE_OBJECTID)?.ok_or_else(|| {
            MetadumpError::BadFormat("root tree has no extent tree root item".to_string())
        })?;
        let nodesize = image.nodesize() as u64;
        let first = BTRFS_SUPER_INFO_OFFSET + BTRFS_SUPER_INFO_SIZE as u64;

        image.iterate_tree(extent_root, |node, item| {
            let key = item.key;
            if key.objectid < first {
                return Ok(true);
            }
            let num_bytes = match key.item_type {
                BTRFS_EXTENT_ITEM_KEY => key.offset,
                BTRFS_METADATA_ITEM_KEY => nodesize,
                _ => return Ok(true),
            };

            let data = node
                .get_item_data(item)
                .filter(|data| data.len() >= BTRFS_EXTENT_ITEM_SIZE)
                .ok_or_else(|| {
                    MetadumpError::BadFormat(format!(
                        "extent item {} is too small for extent flags (v0 extent tree?)",
                        key.objectid
                    ))
                })?;
            let flags = LittleEndian::read_u64(&data[16..24]);
            if flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0 {
                self.add_extent(key.objectid, num_bytes, RangeKind::Metadata)?;
            }
            Ok(true)
        })
    }

    /// Capture every block reachable from `bytenr`; root trees also pull in
    /// the trees their root items point at.
    fn walk_tree(&mut self, image: &BtrfsImage, bytenr: u64, expected_level: Option<u8>, root_tree: bool) -> Result<()> {
        if !self.visited.insert(bytenr) {
            return Ok(());
        }
        let node = image.read_node(bytenr)?;
        check_level(&node, expected_level)?;
        self.add_extent(bytenr, image.nodesize() as u64, RangeKind::Metadata)?;

        if !node.is_leaf() {
            for ptr in &node.key_ptrs {
                self.walk_tree(image, ptr.blockptr, Some(node.header.level - 1), root_tree)?;
            }
            return Ok(());
        }

        if root_tree {
            for item in &node.items {
                if item.key.item_type != BTRFS_ROOT_ITEM_KEY {
                    continue;
                }
                match node.get_item_data(item).and_then(root_item_bytenr) {
                    Some(root) => self.walk_tree(image, root, None, false)?,
                    None => tracing::warn!("Root item {} in block {} is truncated", item.key.objectid, bytenr),
                }
            }
        }
        Ok(())
    }

    /// Data extents of the free space cache inodes in the root tree
    fn copy_space_cache(&mut self, image: &BtrfsImage) -> Result<()> {
        let root = image.superblock().root;
        image.iterate_tree(root, |node, item| {
            if item.key.item_type != BTRFS_EXTENT_DATA_KEY {
                return Ok(true);
            }
            let data = match node.get_item_data(item) {
                Some(data) if data.len() >= FILE_EXTENT_DISK_NUM_BYTES_OFFSET + 8 => data,
                _ => return Ok(true),
            };
            if data[FILE_EXTENT_TYPE_OFFSET] != BTRFS_FILE_EXTENT_REG {
                return Ok(true);
            }
            let disk_bytenr = LittleEndian::read_u64(&data[FILE_EXTENT_DISK_BYTENR_OFFSET..]);
            let disk_num_bytes = LittleEndian::read_u64(&data[FILE_EXTENT_DISK_NUM_BYTES_OFFSET..]);
            if disk_bytenr != 0 && disk_num_bytes != 0 {
                self.add_extent(disk_bytenr, disk_num_bytes, RangeKind::Data)?;
            }
            Ok(true)
        })
    }

    fn enter_stage(&mut self, stage: Stage, operation: &str) {
        self.stage = stage;
        self.emit_progress(operation);
    }

    fn emit_progress(&self, operation: &str) {
        if let Some(ref callback) = self.progress_callback {
            callback(Progress {
                stage: self.stage,
                clusters: self.writer.clusters_written(),
                items: self.stats.items,
                bytes: self.stats.tree_blocks * self.image.nodesize() as u64 + self.stats.data_bytes,
                current_operation: operation.to_string(),
            });
        }
    }
}

fn alloc_buffer(size: u64) -> Result<Vec<u8>> {
    let size = size as usize;
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| MetadumpError::OutOfMemory { bytes: size })?;
    Ok(buffer)
}

/// zlib-compress an item's buffer in place
pub fn compress_item(item: &mut WorkItem, level: u32) -> Result<()> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(item.buffer.len() / 2),
        flate2::Compression::new(level),
    );
    let compressed = encoder
        .write_all(&item.buffer)
        .and_then(|_| encoder.finish())
        .map_err(|e| MetadumpError::Compression {
            start: item.start,
            reason: e.to_string(),
        })?;

    item.buffer = compressed;
    item.compression = Compression::Deflate;
    Ok(())
}
