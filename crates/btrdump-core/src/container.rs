/// Metadump container format
///
/// A container is a sequence of clusters. Each cluster starts on a 1024-byte
/// block boundary with a header block holding the magic, the cluster's own
/// byte offset, the item count, the compression method and an index of
/// `(start, stored_size)` entries. The items' stored bytes follow the header
/// block back to back and are zero padded to the next block boundary.
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

use crate::error::{IoContext, MetadumpError, Result};

pub const CLUSTER_MAGIC: u64 = 0xbd5c_25e2_7295_668b;
pub const BLOCK_SIZE: usize = 1024;
const BLOCK_MASK: u64 = BLOCK_SIZE as u64 - 1;

/// magic + offset + item count + compression
pub const HEADER_SIZE: usize = 8 + 8 + 4 + 1;
/// start + stored size
pub const INDEX_ENTRY_SIZE: usize = 8 + 4;
pub const ITEMS_PER_CLUSTER: usize = (BLOCK_SIZE - HEADER_SIZE) / INDEX_ENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Compression {
    None,
    Deflate,
}

impl Compression {
    pub fn to_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Deflate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHeader {
    pub offset: u64,
    pub item_count: u32,
    pub compression: Compression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub start: u64,
    pub stored_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub header: ClusterHeader,
    pub entries: Vec<IndexEntry>,
}

impl Cluster {
    /// Encode the header block. More than `ITEMS_PER_CLUSTER` entries is a
    /// producer bug.
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        assert!(
            self.entries.len() <= ITEMS_PER_CLUSTER,
            "cluster holds {} items, capacity is {}",
            self.entries.len(),
            ITEMS_PER_CLUSTER
        );
        let mut block = [0u8; BLOCK_SIZE];
        LittleEndian::write_u64(&mut block[0..8], CLUSTER_MAGIC);
        LittleEndian::write_u64(&mut block[8..16], self.header.offset);
        LittleEndian::write_u32(&mut block[16..20], self.entries.len() as u32);
        block[20] = self.header.compression.to_u8();

        for (i, entry) in self.entries.iter().enumerate() {
            let at = HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            LittleEndian::write_u64(&mut block[at..at + 8], entry.start);
            LittleEndian::write_u32(&mut block[at + 8..at + 12], entry.stored_size);
        }
        block
    }

    /// Decode and validate a header block read at `expected_offset`
    pub fn decode(block: &[u8; BLOCK_SIZE], expected_offset: u64) -> Result<Self> {
        let magic = LittleEndian::read_u64(&block[0..8]);
        if magic != CLUSTER_MAGIC {
            return Err(MetadumpError::corrupt(
                expected_offset,
                format!("bad cluster magic {:#018x}", magic),
            ));
        }
        let offset = LittleEndian::read_u64(&block[8..16]);
        if offset != expected_offset {
            return Err(MetadumpError::corrupt(
                expected_offset,
                format!("cluster records offset {}", offset),
            ));
        }
        let item_count = LittleEndian::read_u32(&block[16..20]);
        if item_count as usize > ITEMS_PER_CLUSTER {
            return Err(MetadumpError::corrupt(
                expected_offset,
                format!("{} items exceed cluster capacity {}", item_count, ITEMS_PER_CLUSTER),
            ));
        }
        let compression = Compression::from_u8(block[20]).ok_or_else(|| {
            MetadumpError::corrupt(expected_offset, format!("unknown compression {}", block[20]))
        })?;

        let entries = (0..item_count as usize)
            .map(|i| {
                let at = HEADER_SIZE + i * INDEX_ENTRY_SIZE;
                IndexEntry {
                    start: LittleEndian::read_u64(&block[at..at + 8]),
                    stored_size: LittleEndian::read_u32(&block[at + 8..at + 12]),
                }
            })
            .collect();

        Ok(Cluster {
            header: ClusterHeader {
                offset,
                item_count,
                compression,
            },
            entries,
        })
    }
}

fn padding_for(offset: u64) -> usize {
    match offset & BLOCK_MASK {
        0 => 0,
        used => BLOCK_SIZE - used as usize,
    }
}

/// Appends clusters to a container stream, tracking the running offset
pub struct ClusterWriter<W: Write> {
    out: W,
    offset: u64,
    clusters: u64,
}

impl<W: Write> ClusterWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            clusters: 0,
        }
    }

    /// Offset the next cluster will be written at
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn clusters_written(&self) -> u64 {
        self.clusters
    }

    /// Write one cluster: header block, payloads in index order, zero padding
    pub fn write_cluster(&mut self, compression: Compression, items: &[(u64, &[u8])]) -> Result<u64> {
        let cluster_offset = self.offset;
        let entries = items
            .iter()
            .map(|(start, payload)| {
                let stored_size = u32::try_from(payload.len()).map_err(|_| {
                    MetadumpError::BadFormat(format!(
                        "item at {} stores {} bytes, more than an index entry can describe",
                        start,
                        payload.len()
                    ))
                })?;
                Ok(IndexEntry {
                    start: *start,
                    stored_size,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let cluster = Cluster {
            header: ClusterHeader {
                offset: cluster_offset,
                item_count: entries.len() as u32,
                compression,
            },
            entries,
        };

        self.out
            .write_all(&cluster.encode())
            .context_io(|| format!("writing cluster header at {}", cluster_offset))?;
        self.offset += BLOCK_SIZE as u64;

        for (start, payload) in items {
            self.out
                .write_all(payload)
                .context_io(|| format!("writing item {} of cluster at {}", start, cluster_offset))?;
            self.offset += payload.len() as u64;
        }

        let pad = padding_for(self.offset);
        if pad > 0 {
            self.out
                .write_all(&[0u8; BLOCK_SIZE][..pad])
                .context_io(|| format!("padding cluster at {}", cluster_offset))?;
            self.offset += pad as u64;
        }

        self.clusters += 1;
        tracing::debug!(
            "Wrote cluster at {} with {} items, next at {}",
            cluster_offset,
            items.len(),
            self.offset
        );
        Ok(self.offset)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context_io(|| "flushing container".to_string())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads clusters back, verifying each one sits where it says it does
pub struct ClusterReader<R: Read> {
    input: R,
    offset: u64,
}

impl<R: Read> ClusterReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, offset: 0 }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next cluster header, or `None` at a clean end of stream.
    ///
    /// Any padding left over from the previous cluster is skipped first.
    pub fn read_cluster(&mut self) -> Result<Option<Cluster>> {
        let pad = padding_for(self.offset);
        if pad > 0 {
            let mut skip = [0u8; BLOCK_SIZE];
            self.input
                .read_exact(&mut skip[..pad])
                .context_io(|| format!("reading cluster padding at {}", self.offset))?;
            self.offset += pad as u64;
        }

        let cluster_offset = self.offset;
        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.input.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(MetadumpError::io(
                        format!("reading cluster header at {}", cluster_offset),
                        e,
                    ))
                }
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < BLOCK_SIZE {
            return Err(MetadumpError::corrupt(
                cluster_offset,
                format!("truncated cluster header ({} of {} bytes)", filled, BLOCK_SIZE),
            ));
        }
        self.offset += BLOCK_SIZE as u64;

        Cluster::decode(&block, cluster_offset).map(Some)
    }

    /// Read exactly the stored bytes of `entry`
    pub fn read_item_payload(&mut self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let size = entry.stored_size as usize;
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(size)
            .map_err(|_| MetadumpError::OutOfMemory { bytes: size })?;
        payload.resize(size, 0);

        self.input
            .read_exact(&mut payload)
            .context_io(|| format!("reading item {} at container offset {}", entry.start, self.offset))?;
        self.offset += size as u64;
        Ok(payload)
    }
}
