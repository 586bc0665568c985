//! Synthetic single-device btrfs images for the dump/restore tests
#![allow(dead_code)]

use btrdump_core::container::{Cluster, ClusterReader};
use btrdump_core::fs::btrfs::chunk::{
    BtrfsChunk, BtrfsStripe, BTRFS_BLOCK_GROUP_DATA, BTRFS_BLOCK_GROUP_DUP, BTRFS_BLOCK_GROUP_SYSTEM,
};
use btrdump_core::fs::btrfs::csum::recompute_checksum;
use btrdump_core::fs::btrfs::tree::*;
use btrdump_core::fs::btrfs::*;
use btrdump_core::sanitize::sanitize_tree_block;
use btrdump_core::{
    create_metadump, restore_metadump, DumpConfig, DumpReport, FixupStrategy, RestoreConfig, RestoreReport,
};
use byteorder::{ByteOrder, LittleEndian};
use std::io::{Cursor, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const NODESIZE: usize = 16 * 1024;
pub const SECTORSIZE: u32 = 4096;
pub const GENERATION: u64 = 7;
pub const FSID: [u8; 16] = [0x4a; 16];
pub const DEVID: u64 = 1;
pub const DEV_UUID: [u8; 16] = [0xd3; 16];

/// System chunk, mapped 1:1
pub const SYS_CHUNK: u64 = 0x10_0000;
pub const SYS_CHUNK_LEN: u64 = 0x40_0000;
/// DUP data chunk; first stripe mapped 1:1
pub const DATA_CHUNK: u64 = 0x50_0000;
pub const DATA_CHUNK_LEN: u64 = 0x10_0000;
/// With a split data area: two single-stripe chunks of this length, the
/// second stored after the first's DUP mirror region
pub const SPLIT_CHUNK_LEN: u64 = DATA_CHUNK_LEN / 2;
pub const SPLIT_SECOND_PHYSICAL: u64 = DATA_CHUNK + DATA_CHUNK_LEN;
pub const IMAGE_SIZE: u64 = 0x70_0000;

pub const CHUNK_TREE: u64 = SYS_CHUNK;
pub const ROOT_TREE: u64 = SYS_CHUNK + NODESIZE as u64;
pub const EXTENT_TREE: u64 = SYS_CHUNK + 2 * NODESIZE as u64;
pub const FS_TREE: u64 = SYS_CHUNK + 3 * NODESIZE as u64;
pub const TREE_BLOCKS: [u64; 4] = [CHUNK_TREE, ROOT_TREE, EXTENT_TREE, FS_TREE];

/// Tree log blocks; referenced from the superblock only, never from the extent tree
pub const LOG_ROOT_TREE: u64 = SYS_CHUNK + 4 * NODESIZE as u64;
pub const LOG_TREE: u64 = SYS_CHUNK + 5 * NODESIZE as u64;
pub const BTRFS_TREE_LOG_OBJECTID: u64 = -6i64 as u64;

/// Spacing and size of the free space cache extents
pub const CACHE_EXTENT_STRIDE: u64 = 8192;
pub const CACHE_EXTENT_LEN: u64 = 4096;

const INODE_ITEM_KEY: u8 = 1;
const DEV_ITEM_KEY: u8 = 216;
const ROOT_ITEM_SIZE: usize = 439;
const FILE_EXTENT_REG_SIZE: usize = 53;

/// What goes into a synthetic image beyond the four base trees
#[derive(Debug, Clone, Default)]
pub struct Layout {
    /// (disk_bytenr, len) of the free space cache extents, all in the data area
    pub cache_extents: Vec<(u64, u64)>,
    /// Two adjacent single-stripe data chunks instead of one DUP chunk
    pub split_data_chunk: bool,
    /// A log root tree holding one log tree
    pub log_tree: bool,
}

impl Layout {
    /// `count` cache extents spaced through the data chunk
    pub fn with_cache_extents(count: usize) -> Self {
        Layout {
            cache_extents: (0..count as u64)
                .map(|i| (DATA_CHUNK + i * CACHE_EXTENT_STRIDE, CACHE_EXTENT_LEN))
                .collect(),
            ..Layout::default()
        }
    }

    /// (logical, chunk) of every data chunk, in logical order
    fn data_chunks(&self) -> Vec<(u64, BtrfsChunk)> {
        if self.split_data_chunk {
            vec![
                (DATA_CHUNK, single_data_chunk(DATA_CHUNK)),
                (DATA_CHUNK + SPLIT_CHUNK_LEN, single_data_chunk(SPLIT_SECOND_PHYSICAL)),
            ]
        } else {
            vec![(DATA_CHUNK, data_chunk())]
        }
    }

    /// Where the byte at logical `at` in the data area is stored
    fn physical(&self, at: u64) -> u64 {
        let (logical, chunk) = self
            .data_chunks()
            .into_iter()
            .rev()
            .find(|(logical, _)| *logical <= at)
            .unwrap();
        chunk.stripes[0].offset + (at - logical)
    }
}

pub struct TestImage {
    pub file: NamedTempFile,
    pub bytes: Vec<u8>,
    pub layout: Layout,
    /// (disk_bytenr, len) of every free space cache extent
    pub cache_extents: Vec<(u64, u64)>,
}

impl TestImage {
    /// Build an image whose root tree references `cache_extents` space
    /// cache extents in the data chunk.
    pub fn build(cache_extents: usize) -> Self {
        Self::with_layout(Layout::with_cache_extents(cache_extents))
    }

    pub fn with_layout(layout: Layout) -> Self {
        let mut bytes = vec![0u8; IMAGE_SIZE as usize];

        let extents = layout.cache_extents.clone();
        assert!(extents
            .iter()
            .all(|(start, len)| *start >= DATA_CHUNK && start + len <= DATA_CHUNK + DATA_CHUNK_LEN));
        for (i, (start, len)) in extents.iter().enumerate() {
            for at in *start..start + len {
                bytes[layout.physical(at) as usize] = i as u8 ^ 0x5a;
            }
        }

        place(&mut bytes, CHUNK_TREE, &chunk_tree_leaf(&layout));
        place(&mut bytes, ROOT_TREE, &root_tree_leaf(&extents));
        place(&mut bytes, EXTENT_TREE, &extent_tree_leaf());
        place(&mut bytes, FS_TREE, &fs_tree_leaf());
        if layout.log_tree {
            place(&mut bytes, LOG_ROOT_TREE, &log_root_leaf());
            place(&mut bytes, LOG_TREE, &log_tree_leaf());
        }
        place(&mut bytes, BTRFS_SUPER_INFO_OFFSET, &superblock(&layout));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        TestImage {
            file,
            bytes,
            layout,
            cache_extents: extents,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn range(&self, start: u64, len: usize) -> &[u8] {
        &self.bytes[start as usize..start as usize + len]
    }

    /// `len` bytes at logical `start` in the data area, following the chunk map
    pub fn data_range(&self, start: u64, len: usize) -> Vec<u8> {
        (start..start + len as u64)
            .map(|at| self.bytes[self.layout.physical(at) as usize])
            .collect()
    }

    pub fn superblock(&self) -> &[u8] {
        self.range(BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE)
    }

    /// What a dump is expected to carry for the tree block at `bytenr`
    pub fn sanitized_block(&self, bytenr: u64) -> Vec<u8> {
        let mut block = self.range(bytenr, NODESIZE).to_vec();
        sanitize_tree_block(&mut block, bytenr).unwrap();
        block
    }
}

fn place(bytes: &mut [u8], at: u64, data: &[u8]) {
    bytes[at as usize..at as usize + data.len()].copy_from_slice(data);
}

fn key(objectid: u64, item_type: u8, offset: u64) -> BtrfsKey {
    BtrfsKey {
        objectid,
        item_type,
        offset,
    }
}

/// A leaf of this filesystem with the given items, checksummed
pub fn leaf(bytenr: u64, owner: u64, items: &[(BtrfsKey, Vec<u8>)]) -> Vec<u8> {
    let mut block = vec![0u8; NODESIZE];
    block[HEADER_FSID_OFFSET..HEADER_FSID_OFFSET + 16].copy_from_slice(&FSID);
    LittleEndian::write_u64(&mut block[HEADER_BYTENR_OFFSET..], bytenr);
    LittleEndian::write_u64(&mut block[80..88], GENERATION);
    LittleEndian::write_u64(&mut block[HEADER_OWNER_OFFSET..], owner);
    LittleEndian::write_u32(&mut block[HEADER_NRITEMS_OFFSET..], items.len() as u32);

    let mut data_end = (NODESIZE - BtrfsHeader::SIZE) as u32;
    for (slot, (key, data)) in items.iter().enumerate() {
        data_end -= data.len() as u32;
        key.write(&mut block[item_nr_offset(slot)..]);
        set_item_offset(&mut block, slot, data_end);
        set_item_size(&mut block, slot, data.len() as u32);
        let at = BtrfsHeader::SIZE + data_end as usize;
        block[at..at + data.len()].copy_from_slice(data);
    }
    recompute_checksum(&mut block);
    block
}

pub fn system_chunk() -> BtrfsChunk {
    BtrfsChunk {
        length: SYS_CHUNK_LEN,
        owner: BTRFS_EXTENT_TREE_OBJECTID,
        stripe_len: 64 * 1024,
        chunk_type: BTRFS_BLOCK_GROUP_SYSTEM,
        io_align: SECTORSIZE,
        io_width: SECTORSIZE,
        sector_size: SECTORSIZE,
        num_stripes: 1,
        sub_stripes: 0,
        stripes: vec![BtrfsStripe {
            devid: DEVID,
            offset: SYS_CHUNK,
            dev_uuid: DEV_UUID,
        }],
    }
}

pub fn data_chunk() -> BtrfsChunk {
    BtrfsChunk {
        length: DATA_CHUNK_LEN,
        chunk_type: BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_DUP,
        num_stripes: 2,
        stripes: vec![
            BtrfsStripe {
                devid: DEVID,
                offset: DATA_CHUNK,
                dev_uuid: DEV_UUID,
            },
            BtrfsStripe {
                devid: DEVID,
                offset: DATA_CHUNK + DATA_CHUNK_LEN,
                dev_uuid: DEV_UUID,
            },
        ],
        ..system_chunk()
    }
}

fn single_data_chunk(physical: u64) -> BtrfsChunk {
    BtrfsChunk {
        length: SPLIT_CHUNK_LEN,
        chunk_type: BTRFS_BLOCK_GROUP_DATA,
        stripes: vec![BtrfsStripe {
            devid: DEVID,
            offset: physical,
            dev_uuid: DEV_UUID,
        }],
        ..system_chunk()
    }
}

fn encode_chunk(chunk: &BtrfsChunk) -> Vec<u8> {
    let mut data = vec![0u8; BtrfsChunk::item_size(chunk.num_stripes)];
    chunk.write(&mut data);
    data
}

fn chunk_tree_leaf(layout: &Layout) -> Vec<u8> {
    let mut items = vec![
        (key(1, DEV_ITEM_KEY, DEVID), vec![0x11; 98]),
        (key(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, SYS_CHUNK), encode_chunk(&system_chunk())),
    ];
    for (logical, chunk) in layout.data_chunks() {
        items.push((key(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, logical), encode_chunk(&chunk)));
    }
    leaf(CHUNK_TREE, BTRFS_CHUNK_TREE_OBJECTID, &items)
}

fn root_item(bytenr: u64) -> Vec<u8> {
    let mut data = vec![0u8; ROOT_ITEM_SIZE];
    LittleEndian::write_u64(&mut data[ROOT_ITEM_BYTENR_OFFSET..], bytenr);
    data
}

fn regular_extent(disk_bytenr: u64, len: u64) -> Vec<u8> {
    let mut data = vec![0u8; FILE_EXTENT_REG_SIZE];
    LittleEndian::write_u64(&mut data[0..8], GENERATION);
    LittleEndian::write_u64(&mut data[8..16], len);
    data[FILE_EXTENT_TYPE_OFFSET] = BTRFS_FILE_EXTENT_REG;
    LittleEndian::write_u64(&mut data[FILE_EXTENT_DISK_BYTENR_OFFSET..], disk_bytenr);
    LittleEndian::write_u64(&mut data[FILE_EXTENT_DISK_NUM_BYTES_OFFSET..], len);
    LittleEndian::write_u64(&mut data[45..53], len);
    data
}

fn root_tree_leaf(cache_extents: &[(u64, u64)]) -> Vec<u8> {
    let mut items = vec![
        (key(BTRFS_EXTENT_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0), root_item(EXTENT_TREE)),
        (key(BTRFS_FS_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0), root_item(FS_TREE)),
    ];
    for (i, (start, len)) in cache_extents.iter().enumerate() {
        items.push((key(257 + i as u64, BTRFS_EXTENT_DATA_KEY, 0), regular_extent(*start, *len)));
    }
    leaf(ROOT_TREE, BTRFS_ROOT_TREE_OBJECTID, &items)
}

fn extent_item(flags: u64) -> Vec<u8> {
    let mut data = vec![0u8; BTRFS_EXTENT_ITEM_SIZE + 9];
    LittleEndian::write_u64(&mut data[0..8], 1);
    LittleEndian::write_u64(&mut data[8..16], GENERATION);
    LittleEndian::write_u64(&mut data[16..24], flags);
    data
}

fn extent_tree_leaf() -> Vec<u8> {
    let mut items: Vec<_> = TREE_BLOCKS
        .iter()
        .map(|&bytenr| (key(bytenr, BTRFS_METADATA_ITEM_KEY, 0), extent_item(BTRFS_EXTENT_FLAG_TREE_BLOCK)))
        .collect();
    // a data extent, which the dump must not treat as a tree block
    items.push((key(DATA_CHUNK, BTRFS_EXTENT_ITEM_KEY, 8192), extent_item(1)));
    leaf(EXTENT_TREE, BTRFS_EXTENT_TREE_OBJECTID, &items)
}

pub const INLINE_SECRET: &[u8] = b"inline file contents that must not leak";

fn fs_tree_leaf() -> Vec<u8> {
    let mut inline = vec![0u8; FILE_EXTENT_INLINE_DATA_OFFSET];
    inline[FILE_EXTENT_TYPE_OFFSET] = BTRFS_FILE_EXTENT_INLINE;
    inline.extend_from_slice(INLINE_SECRET);

    leaf(
        FS_TREE,
        BTRFS_FS_TREE_OBJECTID,
        &[
            (key(257, INODE_ITEM_KEY, 0), vec![0xab; 160]),
            (key(257, BTRFS_EXTENT_DATA_KEY, 0), inline),
            (key(257, BTRFS_EXTENT_CSUM_KEY, 0), vec![0xcd; 32]),
        ],
    )
}

fn log_root_leaf() -> Vec<u8> {
    leaf(
        LOG_ROOT_TREE,
        BTRFS_TREE_LOG_OBJECTID,
        &[(key(BTRFS_TREE_LOG_OBJECTID, BTRFS_ROOT_ITEM_KEY, BTRFS_FS_TREE_OBJECTID), root_item(LOG_TREE))],
    )
}

fn log_tree_leaf() -> Vec<u8> {
    leaf(
        LOG_TREE,
        BTRFS_TREE_LOG_OBJECTID,
        &[
            (key(258, INODE_ITEM_KEY, 0), vec![0x6c; 160]),
            (key(258, BTRFS_EXTENT_CSUM_KEY, 0), vec![0xce; 32]),
        ],
    )
}

fn superblock(layout: &Layout) -> Vec<u8> {
    let mut sb = vec![0u8; BTRFS_SUPER_INFO_SIZE];
    sb[SUPER_FSID_OFFSET..SUPER_FSID_OFFSET + 16].copy_from_slice(&FSID);
    LittleEndian::write_u64(&mut sb[SUPER_BYTENR_OFFSET..], BTRFS_SUPER_INFO_OFFSET);
    sb[SUPER_MAGIC_OFFSET..SUPER_MAGIC_OFFSET + 8].copy_from_slice(BTRFS_MAGIC);
    // generation, root, chunk_root, log_root
    LittleEndian::write_u64(&mut sb[0x48..], GENERATION);
    LittleEndian::write_u64(&mut sb[0x50..], ROOT_TREE);
    LittleEndian::write_u64(&mut sb[0x58..], CHUNK_TREE);
    LittleEndian::write_u64(&mut sb[0x60..], if layout.log_tree { LOG_ROOT_TREE } else { 0 });
    // total_bytes, num_devices
    LittleEndian::write_u64(&mut sb[0x70..], IMAGE_SIZE);
    LittleEndian::write_u64(&mut sb[0x88..], 1);
    LittleEndian::write_u32(&mut sb[SUPER_SECTORSIZE_OFFSET..], SECTORSIZE);
    LittleEndian::write_u32(&mut sb[SUPER_NODESIZE_OFFSET..], NODESIZE as u32);
    LittleEndian::write_u32(&mut sb[SUPER_NODESIZE_OFFSET + 4..], NODESIZE as u32);
    LittleEndian::write_u32(&mut sb[SUPER_NODESIZE_OFFSET + 8..], SECTORSIZE);

    let dev = SUPER_DEV_ITEM_OFFSET;
    LittleEndian::write_u64(&mut sb[dev + DEV_ITEM_DEVID_OFFSET..], DEVID);
    sb[dev + DEV_ITEM_UUID_OFFSET..dev + DEV_ITEM_UUID_OFFSET + 16].copy_from_slice(&DEV_UUID);
    sb[dev + DEV_ITEM_FSID_OFFSET..dev + DEV_ITEM_FSID_OFFSET + 16].copy_from_slice(&FSID);

    let array = SUPER_SYS_CHUNK_ARRAY_OFFSET;
    key(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, SYS_CHUNK).write(&mut sb[array..]);
    system_chunk().write(&mut sb[array + BtrfsKey::SIZE..]);
    LittleEndian::write_u32(
        &mut sb[SUPER_SYS_ARRAY_SIZE_OFFSET..],
        (BtrfsKey::SIZE + BtrfsChunk::item_size(1)) as u32,
    );

    recompute_checksum(&mut sb);
    sb
}

pub fn dump(image: &TestImage, config: DumpConfig) -> (DumpReport, Vec<u8>) {
    create_metadump(image.path(), Vec::new(), config).unwrap()
}

pub fn restore(container: &[u8], target: &Path, fixup: FixupStrategy, threads: usize) -> RestoreReport {
    let config = RestoreConfig {
        threads: Some(threads),
        fixup,
    };
    restore_metadump(Cursor::new(container), target, config).unwrap()
}

/// Every cluster header in a container, in order
pub fn clusters(container: &[u8]) -> Vec<Cluster> {
    let mut reader = ClusterReader::new(Cursor::new(container));
    let mut clusters = Vec::new();
    while let Some(cluster) = reader.read_cluster().unwrap() {
        for entry in &cluster.entries {
            reader.read_item_payload(entry).unwrap();
        }
        clusters.push(cluster);
    }
    clusters
}

pub fn uncompressed(threads: usize) -> DumpConfig {
    DumpConfig {
        threads: Some(threads),
        compress_level: 0,
        ..Default::default()
    }
}

pub fn deflated(threads: usize) -> DumpConfig {
    DumpConfig {
        threads: Some(threads),
        compress_level: 6,
        ..Default::default()
    }
}
