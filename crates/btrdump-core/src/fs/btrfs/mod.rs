/// Btrfs on-disk structures needed to capture and restore a metadump
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

pub mod chunk;
pub mod csum;
pub mod image;
pub mod tree;

use crate::error::{MetadumpError, Result};

/// Btrfs magic number
pub const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";

/// Primary superblock location and size
pub const BTRFS_SUPER_INFO_OFFSET: u64 = 64 * 1024;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;
pub const BTRFS_SUPER_MIRROR_MAX: u32 = 3;

pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_CSUM_SIZE: usize = 32;

/// Superblock flag marking an image restored from a metadump
pub const BTRFS_SUPER_FLAG_METADUMP: u64 = 1 << 33;

// Superblock field offsets
pub const SUPER_FSID_OFFSET: usize = 0x20;
pub const SUPER_BYTENR_OFFSET: usize = 0x30;
pub const SUPER_FLAGS_OFFSET: usize = 0x38;
pub const SUPER_MAGIC_OFFSET: usize = 0x40;
pub const SUPER_SECTORSIZE_OFFSET: usize = 0x90;
pub const SUPER_NODESIZE_OFFSET: usize = 0x94;
pub const SUPER_SYS_ARRAY_SIZE_OFFSET: usize = 0xa0;
pub const SUPER_CSUM_TYPE_OFFSET: usize = 0xc4;
pub const SUPER_DEV_ITEM_OFFSET: usize = 0xc9;
pub const SUPER_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32b;
pub const SUPER_SYS_CHUNK_ARRAY_MAX: usize = 2048;

/// Offsets inside `btrfs_dev_item`
pub const DEV_ITEM_DEVID_OFFSET: usize = 0;
pub const DEV_ITEM_UUID_OFFSET: usize = 66;
pub const DEV_ITEM_FSID_OFFSET: usize = 82;

/// Location of superblock copy `mirror` (0 is the primary)
pub fn super_mirror_offset(mirror: u32) -> u64 {
    const SUPER_MIRROR_SHIFT: u32 = 12;
    if mirror == 0 {
        BTRFS_SUPER_INFO_OFFSET
    } else {
        (16 * 1024u64) << (SUPER_MIRROR_SHIFT * mirror)
    }
}

/// The device this superblock was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtrfsDevItem {
    pub devid: u64,
    pub uuid: [u8; BTRFS_UUID_SIZE],
}

/// Btrfs superblock (the fields a metadump cares about)
#[derive(Debug, Clone)]
pub struct BtrfsSuperblock {
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub bytenr: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub nodesize: u32,
    pub leafsize: u32,
    pub csum_type: u16,
    pub dev_item: BtrfsDevItem,
    pub sys_chunk_array: Vec<u8>,
}

impl BtrfsSuperblock {
    /// Parse a superblock from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(MetadumpError::BadFormat(format!(
                "superblock needs {} bytes, got {}",
                BTRFS_SUPER_INFO_SIZE,
                data.len()
            )));
        }
        if !is_btrfs_superblock(data) {
            return Err(MetadumpError::BadFormat("invalid btrfs magic".to_string()));
        }
        Self::parse_fields(data).map_err(|e| MetadumpError::BadFormat(e.to_string()))
    }

    fn parse_fields(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);
        cursor.set_position(SUPER_FSID_OFFSET as u64);

        let mut fsid = [0u8; BTRFS_FSID_SIZE];
        cursor.read_exact(&mut fsid)?;
        let bytenr = cursor.read_u64::<LittleEndian>()?;

        // Skip flags and magic (already checked)
        cursor.set_position(cursor.position() + 16);

        let generation = cursor.read_u64::<LittleEndian>()?;
        let root = cursor.read_u64::<LittleEndian>()?;
        let chunk_root = cursor.read_u64::<LittleEndian>()?;
        let log_root = cursor.read_u64::<LittleEndian>()?;

        // Skip log_root_transid
        cursor.set_position(cursor.position() + 8);

        let total_bytes = cursor.read_u64::<LittleEndian>()?;
        let bytes_used = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(SUPER_NODESIZE_OFFSET as u64);
        let nodesize = cursor.read_u32::<LittleEndian>()?;
        let leafsize = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(SUPER_SYS_ARRAY_SIZE_OFFSET as u64);
        let sys_chunk_array_size = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(SUPER_CSUM_TYPE_OFFSET as u64);
        let csum_type = cursor.read_u16::<LittleEndian>()?;

        let dev = &data[SUPER_DEV_ITEM_OFFSET..];
        let mut uuid = [0u8; BTRFS_UUID_SIZE];
        uuid.copy_from_slice(&dev[DEV_ITEM_UUID_OFFSET..DEV_ITEM_UUID_OFFSET + BTRFS_UUID_SIZE]);
        let dev_item = BtrfsDevItem {
            devid: LittleEndian::read_u64(&dev[DEV_ITEM_DEVID_OFFSET..]),
            uuid,
        };

        let array_len = (sys_chunk_array_size as usize).min(SUPER_SYS_CHUNK_ARRAY_MAX);
        let sys_chunk_array = data
            [SUPER_SYS_CHUNK_ARRAY_OFFSET..SUPER_SYS_CHUNK_ARRAY_OFFSET + array_len]
            .to_vec();

        Ok(BtrfsSuperblock {
            fsid,
            bytenr,
            generation,
            root,
            chunk_root,
            log_root,
            total_bytes,
            bytes_used,
            nodesize,
            leafsize,
            csum_type,
            dev_item,
            sys_chunk_array,
        })
    }
}

/// Check if data contains Btrfs superblock signature
pub fn is_btrfs_superblock(data: &[u8]) -> bool {
    if data.len() < SUPER_MAGIC_OFFSET + 8 {
        return false;
    }

    &data[SUPER_MAGIC_OFFSET..SUPER_MAGIC_OFFSET + 8] == BTRFS_MAGIC
}
