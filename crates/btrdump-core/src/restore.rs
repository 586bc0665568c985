/// Metadump restore
///
/// Reads clusters in order, hands every item to the worker pool for
/// decompression, device fixups and a positional write to the target, and
/// waits for each cluster to finish before reading the next one. Items are
/// dropped by the worker that writes them.
use chrono::Utc;
use flate2::read::ZlibDecoder;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::RestoreConfig;
use crate::container::{ClusterReader, Compression};
use crate::error::{IoContext, MetadumpError, Result};
use crate::fixup::{
    fixup_chunk_tree_blocks, fixup_superblock, write_backup_supers, DeviceIdentity, FixupStrategy,
};
use crate::fs::btrfs::BTRFS_SUPER_INFO_OFFSET;
use crate::fs::common::types::write_all_at;
use crate::pipeline::{Job, WorkItem, WorkQueue, WorkerPool};
use crate::report::{Progress, ProgressCallback, RestoreReport, Stage};

#[derive(Debug, Default)]
struct RestoreStats {
    bytes_written: AtomicU64,
    chunk_leaves: AtomicU64,
    backup_supers: AtomicU64,
}

/// State shared by every worker running the restore job
struct RestoreJob {
    target: File,
    strategy: FixupStrategy,
    identity: Arc<OnceLock<DeviceIdentity>>,
    stats: Arc<RestoreStats>,
}

impl RestoreJob {
    fn run(&self, item: &mut WorkItem) -> Result<()> {
        if item.compression == Compression::Deflate {
            item.buffer = inflate(item.start, &item.buffer)?;
            item.compression = Compression::None;
        }
        item.size = Some(item.buffer.len() as u64);

        let is_super = item.start == BTRFS_SUPER_INFO_OFFSET;
        if is_super {
            fixup_superblock(&mut item.buffer, self.strategy)?;
        } else if self.strategy == FixupStrategy::Current {
            if let Some(identity) = self.identity.get() {
                let rewritten = fixup_chunk_tree_blocks(&mut item.buffer, item.start, identity)?;
                self.stats.chunk_leaves.fetch_add(rewritten as u64, Ordering::Relaxed);
            }
        }

        write_all_at(&self.target, &item.buffer, item.start)
            .context_io(|| format!("writing {} bytes at {}", item.buffer.len(), item.start))?;
        self.stats.bytes_written.fetch_add(item.buffer.len() as u64, Ordering::Relaxed);

        if is_super && self.strategy != FixupStrategy::Verbatim {
            let copies = write_backup_supers(&self.target, &item.buffer)?;
            self.stats.backup_supers.fetch_add(copies as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}

fn inflate(start: u64, stored: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(stored.len() * 2);
    ZlibDecoder::new(stored)
        .read_to_end(&mut out)
        .map_err(|e| MetadumpError::Decompression {
            start,
            reason: e.to_string(),
        })?;
    Ok(out)
}

/// Restores a container stream onto a target file or device
pub struct RestoreEngine<R: Read> {
    reader: ClusterReader<R>,
    config: RestoreConfig,
    queue: Arc<WorkQueue>,
    pool: WorkerPool,
    identity: Arc<OnceLock<DeviceIdentity>>,
    stats: Arc<RestoreStats>,
    progress_callback: Option<ProgressCallback>,
}

impl<R: Read> RestoreEngine<R> {
    /// Open (creating if needed) `target` and prepare to restore `input` onto it
    pub fn new<P: AsRef<Path>>(input: R, target: P, config: RestoreConfig) -> Result<Self> {
        let target = target.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)
            .context_io(|| format!("opening restore target {}", target.display()))?;
        Self::with_target(input, file, config)
    }

    pub fn with_target(input: R, target: File, config: RestoreConfig) -> Result<Self> {
        config.validate()?;

        let identity = Arc::new(OnceLock::new());
        let stats = Arc::new(RestoreStats::default());
        let job = Arc::new(RestoreJob {
            target,
            strategy: config.fixup,
            identity: Arc::clone(&identity),
            stats: Arc::clone(&stats),
        });
        let job: Job = Arc::new(move |item: &mut WorkItem| job.run(item));

        let queue = Arc::new(WorkQueue::new());
        let pool = WorkerPool::new(config.worker_threads(), Arc::clone(&queue), job)?;

        Ok(Self {
            reader: ClusterReader::new(input),
            config,
            queue,
            pool,
            identity,
            stats,
            progress_callback: None,
        })
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn run(mut self) -> Result<RestoreReport> {
        let started_at = Utc::now();
        let mut clusters = 0u64;
        let mut items = 0u64;
        let mut end_marker_seen = false;

        tracing::info!(
            "Restoring with {} workers, fixup strategy {:?}",
            self.pool.threads(),
            self.config.fixup
        );

        while let Some(cluster) = self.reader.read_cluster()? {
            end_marker_seen = cluster.entries.is_empty();
            let compression = cluster.header.compression;

            for entry in &cluster.entries {
                let payload = self.reader.read_item_payload(entry)?;
                let item = WorkItem::stored(entry.start, payload, compression);
                if item.start == BTRFS_SUPER_INFO_OFFSET && self.config.fixup != FixupStrategy::Verbatim {
                    self.latch_identity(&item)?;
                }
                self.pool.submit_detached(item);
            }

            // a failed cluster stops the run before anything further is read
            self.queue.wait_idle()?;
            items += cluster.entries.len() as u64;
            clusters += 1;
            tracing::debug!(
                "Restored cluster at {} ({} items)",
                cluster.header.offset,
                cluster.entries.len()
            );
            self.emit_progress(Stage::Restoring, clusters, items);
        }

        if !end_marker_seen {
            tracing::warn!(
                "Container ended at {} without an end-of-stream cluster; it may be truncated",
                self.reader.offset()
            );
        }
        self.emit_progress(Stage::Complete, clusters, items);

        let identity = self.identity.get().copied();
        let report = RestoreReport {
            started_at,
            finished_at: Utc::now(),
            fsid: identity.map(|id| id.fsid_uuid()),
            devid: identity.map(|id| id.devid),
            device_uuid: identity.map(|id| id.device_uuid()),
            fixup: self.config.fixup,
            threads: self.pool.threads(),
            clusters,
            items,
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            chunk_leaves_rewritten: self.stats.chunk_leaves.load(Ordering::Relaxed),
            backup_supers: self.stats.backup_supers.load(Ordering::Relaxed),
            end_marker_seen,
        };
        tracing::info!(
            "Restore finished: {} clusters, {} items, {} bytes, {} chunk leaves rewritten",
            report.clusters,
            report.items,
            report.bytes_written,
            report.chunk_leaves_rewritten
        );
        Ok(report)
    }

    /// Learn the target identity from the superblock before any worker
    /// could need it
    fn latch_identity(&self, item: &WorkItem) -> Result<()> {
        if self.identity.get().is_some() {
            return Ok(());
        }
        let identity = match item.compression {
            Compression::Deflate => DeviceIdentity::from_superblock(&inflate(item.start, &item.buffer)?)?,
            Compression::None => DeviceIdentity::from_superblock(&item.buffer)?,
        };
        tracing::debug!(
            "Target identity: fsid {}, devid {}, leaf size {}",
            identity.fsid_uuid(),
            identity.devid,
            identity.leafsize
        );
        // only the collector thread sets it
        let _ = self.identity.set(identity);
        Ok(())
    }

    fn emit_progress(&self, stage: Stage, clusters: u64, items: u64) {
        if let Some(ref callback) = self.progress_callback {
            callback(Progress {
                stage,
                clusters,
                items,
                bytes: self.stats.bytes_written.load(Ordering::Relaxed),
                current_operation: format!("Restored {} clusters", clusters),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ClusterWriter;
    use std::io::Cursor;
    use std::os::unix::fs::FileExt;

    fn verbatim() -> RestoreConfig {
        RestoreConfig {
            threads: Some(2),
            fixup: FixupStrategy::Verbatim,
        }
    }

    #[test]
    fn test_items_land_at_their_offsets() {
        let a = vec![0x11u8; 3000];
        let b = vec![0x22u8; 512];
        let mut writer = ClusterWriter::new(Vec::new());
        writer
            .write_cluster(Compression::None, &[(8192, &a[..]), (1024, &b[..])])
            .unwrap();
        writer.write_cluster(Compression::None, &[]).unwrap();
        let container = writer.into_inner();

        let target = tempfile::NamedTempFile::new().unwrap();
        let engine = RestoreEngine::new(Cursor::new(container), target.path(), verbatim()).unwrap();
        let report = engine.run().unwrap();
        assert_eq!(report.clusters, 2);
        assert_eq!(report.items, 2);
        assert_eq!(report.bytes_written, 3512);
        assert!(report.end_marker_seen);
        assert!(report.fsid.is_none());

        let file = File::open(target.path()).unwrap();
        let mut buf = vec![0u8; 512];
        file.read_exact_at(&mut buf, 1024).unwrap();
        assert_eq!(buf, b);
        let mut buf = vec![0u8; 3000];
        file.read_exact_at(&mut buf, 8192).unwrap();
        assert_eq!(buf, a);
    }

    #[test]
    fn test_bad_deflate_payload_fails() {
        let garbage = vec![0xFFu8; 64];
        let mut writer = ClusterWriter::new(Vec::new());
        writer.write_cluster(Compression::Deflate, &[(0, &garbage[..])]).unwrap();
        let container = writer.into_inner();

        let target = tempfile::NamedTempFile::new().unwrap();
        let engine = RestoreEngine::new(Cursor::new(container), target.path(), verbatim()).unwrap();
        let err = engine.run().unwrap_err();
        assert!(matches!(err, MetadumpError::Decompression { start: 0, .. }));
    }

    #[test]
    fn test_verbatim_restore_does_not_parse_superblock_item() {
        let not_a_superblock = vec![0x77u8; 4096];
        let mut writer = ClusterWriter::new(Vec::new());
        writer
            .write_cluster(Compression::None, &[(BTRFS_SUPER_INFO_OFFSET, &not_a_superblock[..])])
            .unwrap();
        writer.write_cluster(Compression::None, &[]).unwrap();
        let container = writer.into_inner();

        let target = tempfile::NamedTempFile::new().unwrap();
        let report = RestoreEngine::new(Cursor::new(container.clone()), target.path(), verbatim())
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(report.items, 1);
        assert!(report.fsid.is_none());
        let file = File::open(target.path()).unwrap();
        let mut buf = vec![0u8; 4096];
        file.read_exact_at(&mut buf, BTRFS_SUPER_INFO_OFFSET).unwrap();
        assert_eq!(buf, not_a_superblock);

        // fixups need the identity, so the same item is rejected there
        let config = RestoreConfig {
            threads: Some(2),
            fixup: FixupStrategy::Current,
        };
        let err = RestoreEngine::new(Cursor::new(container), target.path(), config)
            .unwrap()
            .run()
            .unwrap_err();
        assert!(matches!(err, MetadumpError::BadFormat(_)));
    }

    #[test]
    fn test_missing_end_marker_is_tolerated() {
        let a = vec![0x33u8; 100];
        let mut writer = ClusterWriter::new(Vec::new());
        writer.write_cluster(Compression::None, &[(0, &a[..])]).unwrap();
        let container = writer.into_inner();

        let target = tempfile::NamedTempFile::new().unwrap();
        let report = RestoreEngine::new(Cursor::new(container), target.path(), verbatim())
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(report.clusters, 1);
        assert!(!report.end_marker_seen);
    }
}
