/// Btrfs B-tree block layout
///
/// Every tree block starts with a 101-byte header. Leaves follow it with an
/// array of item headers growing forward and item data growing backward from
/// the end of the block; internal nodes follow it with key pointers.
use byteorder::{ByteOrder, LittleEndian};

use crate::error::{MetadumpError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Btrfs item types
pub const BTRFS_EXTENT_DATA_KEY: u8 = 108;
pub const BTRFS_EXTENT_CSUM_KEY: u8 = 128;
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
pub const BTRFS_EXTENT_ITEM_KEY: u8 = 168;
pub const BTRFS_METADATA_ITEM_KEY: u8 = 169;
pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;

/// Well-known object IDs
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/// Extent item flag for tree blocks
pub const BTRFS_EXTENT_FLAG_TREE_BLOCK: u64 = 2;
/// refs + generation + flags
pub const BTRFS_EXTENT_ITEM_SIZE: usize = 24;

/// File extent types
pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
/// Offset of `type` inside `btrfs_file_extent_item`
pub const FILE_EXTENT_TYPE_OFFSET: usize = 20;
/// Inline data starts where `disk_bytenr` would be
pub const FILE_EXTENT_INLINE_DATA_OFFSET: usize = 21;
pub const FILE_EXTENT_DISK_BYTENR_OFFSET: usize = 21;
pub const FILE_EXTENT_DISK_NUM_BYTES_OFFSET: usize = 29;

/// Offsets inside `btrfs_root_item`
pub const ROOT_ITEM_BYTENR_OFFSET: usize = 176;
pub const ROOT_ITEM_LEVEL_OFFSET: usize = 238;

// Header field offsets
pub const HEADER_FSID_OFFSET: usize = 32;
pub const HEADER_BYTENR_OFFSET: usize = 48;
pub const HEADER_OWNER_OFFSET: usize = 88;
pub const HEADER_NRITEMS_OFFSET: usize = 96;
pub const HEADER_LEVEL_OFFSET: usize = 100;

// ============================================================================
// Structures
// ============================================================================

/// Btrfs tree key - identifies an item in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl BtrfsKey {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(MetadumpError::BadFormat("insufficient data for key".to_string()));
        }
        Ok(Self {
            objectid: LittleEndian::read_u64(&data[0..8]),
            item_type: data[8],
            offset: LittleEndian::read_u64(&data[9..17]),
        })
    }

    pub fn write(&self, data: &mut [u8]) {
        LittleEndian::write_u64(&mut data[0..8], self.objectid);
        data[8] = self.item_type;
        LittleEndian::write_u64(&mut data[9..17], self.offset);
    }

    /// Size of a key in bytes
    pub const SIZE: usize = 17;
}

/// Btrfs node header - present at the start of every tree node
#[derive(Debug, Clone)]
pub struct BtrfsHeader {
    pub bytenr: u64, // Logical address of this node
    pub nritems: u32,
    pub level: u8, // 0 for leaf
}

impl BtrfsHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(MetadumpError::BadFormat(
                "insufficient data for tree block header".to_string(),
            ));
        }

        Ok(Self {
            bytenr: header_bytenr(data),
            nritems: header_nritems(data),
            level: data[HEADER_LEVEL_OFFSET],
        })
    }

    /// Size of header in bytes
    pub const SIZE: usize = 101;
}

/// Key pointer for internal (non-leaf) nodes
#[derive(Debug, Clone)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsKey,
    pub blockptr: u64, // Logical address of child node
}

impl BtrfsKeyPtr {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(MetadumpError::BadFormat("insufficient data for key pointer".to_string()));
        }
        Ok(Self {
            key: BtrfsKey::parse(&data[0..17])?,
            blockptr: LittleEndian::read_u64(&data[17..25]),
        })
    }

    pub const SIZE: usize = 33;
}

/// Item header for leaf nodes
#[derive(Debug, Clone)]
pub struct BtrfsItem {
    pub key: BtrfsKey,
    pub offset: u32, // Offset from end of header to item data
    pub size: u32,
}

impl BtrfsItem {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(MetadumpError::BadFormat("insufficient data for item".to_string()));
        }
        Ok(Self {
            key: BtrfsKey::parse(&data[0..17])?,
            offset: LittleEndian::read_u32(&data[17..21]),
            size: LittleEndian::read_u32(&data[21..25]),
        })
    }

    pub const SIZE: usize = 25;
}

/// A parsed tree node (internal or leaf)
#[derive(Debug)]
pub struct BtrfsNode {
    pub header: BtrfsHeader,
    pub key_ptrs: Vec<BtrfsKeyPtr>, // For internal nodes
    pub items: Vec<BtrfsItem>,      // For leaf nodes
    pub raw_data: Vec<u8>,
}

impl BtrfsNode {
    /// Parse a node from raw bytes
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let header = BtrfsHeader::parse(&data)?;

        let mut key_ptrs = Vec::new();
        let mut items = Vec::new();

        let mut offset = BtrfsHeader::SIZE;
        for _ in 0..header.nritems {
            if header.level == 0 {
                if offset + BtrfsItem::SIZE > data.len() {
                    break;
                }
                items.push(BtrfsItem::parse(&data[offset..])?);
                offset += BtrfsItem::SIZE;
            } else {
                if offset + BtrfsKeyPtr::SIZE > data.len() {
                    break;
                }
                key_ptrs.push(BtrfsKeyPtr::parse(&data[offset..])?);
                offset += BtrfsKeyPtr::SIZE;
            }
        }

        Ok(BtrfsNode {
            header,
            key_ptrs,
            items,
            raw_data: data,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.header.level == 0
    }

    /// Get the data for a specific item in a leaf node
    pub fn get_item_data(&self, item: &BtrfsItem) -> Option<&[u8]> {
        if !self.is_leaf() {
            return None;
        }

        let data_start = BtrfsHeader::SIZE + item.offset as usize;
        let data_end = data_start + item.size as usize;

        if data_end <= self.raw_data.len() {
            Some(&self.raw_data[data_start..data_end])
        } else {
            None
        }
    }
}

// ============================================================================
// In-place accessors over raw leaf buffers
// ============================================================================

pub fn header_nritems(block: &[u8]) -> u32 {
    LittleEndian::read_u32(&block[HEADER_NRITEMS_OFFSET..])
}

pub fn header_level(block: &[u8]) -> u8 {
    block[HEADER_LEVEL_OFFSET]
}

pub fn header_bytenr(block: &[u8]) -> u64 {
    LittleEndian::read_u64(&block[HEADER_BYTENR_OFFSET..])
}

pub fn header_owner(block: &[u8]) -> u64 {
    LittleEndian::read_u64(&block[HEADER_OWNER_OFFSET..])
}

pub fn header_fsid(block: &[u8]) -> &[u8] {
    &block[HEADER_FSID_OFFSET..HEADER_FSID_OFFSET + 16]
}

/// Byte offset of item header `slot` within a leaf
pub fn item_nr_offset(slot: usize) -> usize {
    BtrfsHeader::SIZE + slot * BtrfsItem::SIZE
}

pub fn item_key(block: &[u8], slot: usize) -> Result<BtrfsKey> {
    BtrfsKey::parse(&block[item_nr_offset(slot)..])
}

pub fn item_offset(block: &[u8], slot: usize) -> u32 {
    LittleEndian::read_u32(&block[item_nr_offset(slot) + 17..])
}

pub fn item_size(block: &[u8], slot: usize) -> u32 {
    LittleEndian::read_u32(&block[item_nr_offset(slot) + 21..])
}

pub fn set_item_offset(block: &mut [u8], slot: usize, offset: u32) {
    LittleEndian::write_u32(&mut block[item_nr_offset(slot) + 17..], offset);
}

pub fn set_item_size(block: &mut [u8], slot: usize, size: u32) {
    LittleEndian::write_u32(&mut block[item_nr_offset(slot) + 21..], size);
}

/// Absolute byte offset of item `slot`'s data within the leaf
pub fn item_data_start(block: &[u8], slot: usize) -> usize {
    BtrfsHeader::SIZE + item_offset(block, slot) as usize
}

/// Shrink item `slot` to `new_size` bytes, keeping its leading bytes.
///
/// Data of this and every later item moves toward the end of the leaf by the
/// size difference and the item offsets are adjusted to match.
pub fn truncate_item(block: &mut [u8], slot: usize, new_size: u32) -> Result<()> {
    let nritems = header_nritems(block) as usize;
    if slot >= nritems || item_nr_offset(nritems) > block.len() {
        return Err(MetadumpError::BadFormat(format!(
            "item slot {} out of range ({} items)",
            slot, nritems
        )));
    }
    let old_size = item_size(block, slot);
    if new_size >= old_size {
        return Ok(());
    }

    let size_diff = old_size - new_size;
    let data_end = item_offset(block, nritems - 1) as usize;
    let old_data_start = item_offset(block, slot) as usize;
    let moved_end = old_data_start + new_size as usize;
    if data_end > moved_end || BtrfsHeader::SIZE + old_data_start + old_size as usize > block.len() {
        return Err(MetadumpError::BadFormat(format!(
            "leaf item {} data out of order or out of bounds",
            slot
        )));
    }

    for i in slot..nritems {
        let ioff = item_offset(block, i);
        set_item_offset(block, i, ioff + size_diff);
    }

    let src = BtrfsHeader::SIZE + data_end;
    let len = moved_end - data_end;
    block.copy_within(src..src + len, src + size_diff as usize);
    set_item_size(block, slot, new_size);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
