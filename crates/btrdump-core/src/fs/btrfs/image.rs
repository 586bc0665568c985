/// A single-device btrfs image opened for metadump capture
///
/// Resolves logical addresses through the chunk map (system chunk array
/// first, then the chunk tree) and reads tree blocks and raw data ranges.
use std::path::Path;

use super::chunk::{parse_sys_chunk_array, BtrfsChunk, ChunkMap};
use super::csum::verify_checksum;
use super::tree::*;
use super::{BtrfsSuperblock, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE};
use crate::error::{MetadumpError, Result};
use crate::fs::BlockDevice;

/// Maximum btrfs tree height
const BTRFS_MAX_LEVEL: u8 = 8;

pub struct BtrfsImage {
    device: BlockDevice,
    superblock: BtrfsSuperblock,
    chunks: ChunkMap,
}

impl BtrfsImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let device = BlockDevice::open(path)?;
        let sb_data = device.read_bytes(BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE)?;
        let superblock = BtrfsSuperblock::parse(sb_data)?;

        if superblock.bytenr != BTRFS_SUPER_INFO_OFFSET {
            return Err(MetadumpError::BadFormat(format!(
                "primary superblock records bytenr {}",
                superblock.bytenr
            )));
        }
        if superblock.csum_type != 0 {
            return Err(MetadumpError::BadFormat(format!(
                "unsupported checksum type {}",
                superblock.csum_type
            )));
        }
        if superblock.nodesize != superblock.leafsize {
            return Err(MetadumpError::BadFormat(format!(
                "nodesize {} differs from leafsize {}",
                superblock.nodesize, superblock.leafsize
            )));
        }
        if (superblock.nodesize as usize) < BtrfsHeader::SIZE {
            return Err(MetadumpError::BadFormat(format!(
                "nodesize {} is too small",
                superblock.nodesize
            )));
        }

        let mut chunks = ChunkMap::new(superblock.dev_item.devid);
        for (key, chunk) in parse_sys_chunk_array(&superblock.sys_chunk_array)? {
            chunks.insert(key.offset, &chunk)?;
        }
        if chunks.is_empty() {
            return Err(MetadumpError::BadFormat(
                "superblock carries no system chunks".to_string(),
            ));
        }

        let mut image = BtrfsImage {
            device,
            superblock,
            chunks,
        };
        image.load_chunk_tree()?;

        tracing::info!(
            "Opened btrfs image: nodesize {}, generation {}, {} of {} bytes used, {} chunks mapped",
            image.superblock.nodesize,
            image.superblock.generation,
            image.superblock.bytes_used,
            image.superblock.total_bytes,
            image.chunks.len()
        );

        Ok(image)
    }

    fn load_chunk_tree(&mut self) -> Result<()> {
        let mut found = Vec::new();
        self.iterate_tree(self.superblock.chunk_root, |node, item| {
            if item.key.item_type == BTRFS_CHUNK_ITEM_KEY {
                let data = node.get_item_data(item).ok_or_else(|| {
                    MetadumpError::BadFormat(format!(
                        "chunk item {} lies outside its leaf",
                        item.key.offset
                    ))
                })?;
                found.push((item.key.offset, BtrfsChunk::parse(data)?));
            }
            Ok(true)
        })?;

        for (logical, chunk) in found {
            self.chunks.insert(logical, &chunk)?;
        }
        Ok(())
    }

    pub fn superblock(&self) -> &BtrfsSuperblock {
        &self.superblock
    }

    pub fn nodesize(&self) -> u32 {
        self.superblock.nodesize
    }

    /// The primary superblock exactly as stored on the device
    pub fn superblock_bytes(&self) -> Result<&[u8]> {
        self.device.read_bytes(BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE)
    }

    /// Read `len` raw bytes at a logical address inside one chunk
    pub fn read_data(&self, logical: u64, len: usize) -> Result<&[u8]> {
        let physical = self.chunks.map(logical, len as u64)?;
        self.device.read_bytes(physical, len)
    }

    /// Append `len` bytes at `logical` to `out`, following the range across
    /// as many adjacent chunks as it spans
    pub fn read_data_into(&self, logical: u64, len: u64, out: &mut Vec<u8>) -> Result<()> {
        let end = logical + len;
        let mut at = logical;
        while at < end {
            let (physical, available) = self.chunks.map_segment(at, end - at)?;
            out.extend_from_slice(self.device.read_bytes(physical, available as usize)?);
            at += available;
        }
        Ok(())
    }

    /// Read the tree block at `logical`, checking it claims to live there
    pub fn read_tree_block(&self, logical: u64) -> Result<&[u8]> {
        let block = self.read_data(logical, self.superblock.nodesize as usize)?;
        if header_bytenr(block) != logical {
            return Err(MetadumpError::BadFormat(format!(
                "tree block at {} records bytenr {}",
                logical,
                header_bytenr(block)
            )));
        }
        if !verify_checksum(block) {
            tracing::warn!("Checksum mismatch in tree block at {}", logical);
        }
        Ok(block)
    }

    pub fn read_node(&self, logical: u64) -> Result<BtrfsNode> {
        BtrfsNode::parse(self.read_tree_block(logical)?.to_vec())
    }

    /// Iterate all items in a tree (in-order traversal)
    pub fn iterate_tree<F>(&self, root_bytenr: u64, mut callback: F) -> Result<()>
    where
        F: FnMut(&BtrfsNode, &BtrfsItem) -> Result<bool>, // Return false to stop
    {
        self.iterate_node(root_bytenr, None, &mut callback).map(|_| ())
    }

    fn iterate_node<F>(&self, bytenr: u64, expected_level: Option<u8>, callback: &mut F) -> Result<bool>
    where
        F: FnMut(&BtrfsNode, &BtrfsItem) -> Result<bool>,
    {
        let node = self.read_node(bytenr)?;
        check_level(&node, expected_level)?;

        if node.is_leaf() {
            for item in &node.items {
                if !callback(&node, item)? {
                    return Ok(false);
                }
            }
        } else {
            for kp in &node.key_ptrs {
                if !self.iterate_node(kp.blockptr, Some(node.header.level - 1), callback)? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Root block of the tree with the given objectid, looked up in the root tree
    pub fn find_root(&self, objectid: u64) -> Result<Option<u64>> {
        let mut bytenr = None;
        self.iterate_tree(self.superblock.root, |node, item| {
            if item.key.objectid == objectid && item.key.item_type == BTRFS_ROOT_ITEM_KEY {
                bytenr = node.get_item_data(item).and_then(root_item_bytenr);
                return Ok(false);
            }
            Ok(true)
        })?;
        Ok(bytenr)
    }
}

/// `bytenr` of a root item's tree, if the item is large enough to hold it
pub fn root_item_bytenr(data: &[u8]) -> Option<u64> {
    use byteorder::{ByteOrder, LittleEndian};
    data.get(ROOT_ITEM_BYTENR_OFFSET..ROOT_ITEM_BYTENR_OFFSET + 8)
        .map(LittleEndian::read_u64)
}

/// Children must sit exactly one level below their parent
pub fn check_level(node: &BtrfsNode, expected: Option<u8>) -> Result<()> {
    let level = node.header.level;
    if level >= BTRFS_MAX_LEVEL || expected.is_some_and(|e| e != level) {
        return Err(MetadumpError::BadFormat(format!(
            "tree block at {} has level {} (expected {:?})",
            node.header.bytenr, level, expected
        )));
    }
    Ok(())
}
