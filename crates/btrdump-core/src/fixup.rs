/// Device identity rewrites applied while restoring a metadump
///
/// A restored image lives on one new device with every chunk mapped 1:1
/// (physical offset == logical offset). The chunk tree and the superblock's
/// system chunk array are rewritten to say exactly that.
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use uuid::Uuid;

use crate::error::{IoContext, MetadumpError, Result};
use crate::fs::btrfs::chunk::{
    BtrfsChunk, BtrfsStripe, BTRFS_BLOCK_GROUP_SYSTEM, BTRFS_BLOCK_GROUP_TYPE_MASK,
};
use crate::fs::btrfs::csum::recompute_checksum;
use crate::fs::btrfs::tree::*;
use crate::fs::btrfs::*;
use crate::fs::common::types::write_all_at;

/// How restore treats device-specific structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FixupStrategy {
    /// Write every block exactly as stored in the container
    Verbatim,
    /// Replace the system chunk array with one synthetic chunk and flag the
    /// superblock as a metadump; the chunk tree is left alone
    Compat,
    /// Compact every chunk (superblock array and chunk tree) to a single
    /// stripe on the target device
    #[default]
    Current,
}

/// Target-device fields learned from the container's superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub leafsize: u32,
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub devid: u64,
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

impl DeviceIdentity {
    pub fn from_superblock(buffer: &[u8]) -> Result<Self> {
        let sb = BtrfsSuperblock::parse(buffer)?;
        if (sb.nodesize as usize) < BtrfsHeader::SIZE {
            return Err(MetadumpError::BadFormat(format!(
                "superblock leaf size {} is too small",
                sb.nodesize
            )));
        }
        Ok(Self {
            leafsize: sb.nodesize,
            fsid: sb.fsid,
            devid: sb.dev_item.devid,
            dev_uuid: sb.dev_item.uuid,
        })
    }

    pub fn fsid_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.fsid)
    }

    pub fn device_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.dev_uuid)
    }
}

/// Outcome of looking at one block during chunk tree fixup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafFixup {
    Rewritten,
    /// A block of this filesystem, but not a chunk tree leaf
    Skipped,
    /// Not a tree block of this filesystem at this address
    Foreign,
}

/// Rewrite every chunk item in a chunk tree leaf to a single stripe on the
/// target device.
pub fn fixup_chunk_tree_leaf(block: &mut [u8], bytenr: u64, identity: &DeviceIdentity) -> Result<LeafFixup> {
    if block.len() < BtrfsHeader::SIZE
        || header_bytenr(block) != bytenr
        || header_fsid(block) != identity.fsid
    {
        return Ok(LeafFixup::Foreign);
    }
    if header_owner(block) != BTRFS_CHUNK_TREE_OBJECTID || header_level(block) != 0 {
        return Ok(LeafFixup::Skipped);
    }

    let nritems = header_nritems(block) as usize;
    if item_nr_offset(nritems) > block.len() {
        return Err(MetadumpError::BadFormat(format!(
            "chunk leaf at {} claims {} items",
            bytenr, nritems
        )));
    }

    for slot in 0..nritems {
        let key = item_key(block, slot)?;
        if key.item_type != BTRFS_CHUNK_ITEM_KEY {
            continue;
        }

        let start = item_data_start(block, slot);
        let end = start + BtrfsChunk::item_size(1);
        if (item_size(block, slot) as usize) < BtrfsChunk::item_size(1) || end > block.len() {
            return Err(MetadumpError::BadFormat(format!(
                "chunk item {} in leaf at {} is too small",
                key.offset, bytenr
            )));
        }

        let chunk = single_stripe_chunk(&block[start..end], identity, key.offset)?;
        truncate_item(block, slot, BtrfsChunk::item_size(1) as u32)?;
        let start = item_data_start(block, slot);
        chunk.write(&mut block[start..start + BtrfsChunk::item_size(1)]);
    }

    recompute_checksum(block);
    Ok(LeafFixup::Rewritten)
}

/// Compact `data`'s chunk to one stripe; only the first stripe's bytes are read
fn single_stripe_chunk(data: &[u8], identity: &DeviceIdentity, logical: u64) -> Result<BtrfsChunk> {
    let mut first = data[..BtrfsChunk::item_size(1)].to_vec();
    LittleEndian::write_u16(&mut first[44..46], 1);
    let mut chunk = BtrfsChunk::parse(&first)?;
    chunk.chunk_type &= BTRFS_BLOCK_GROUP_TYPE_MASK;
    Ok(chunk.to_single_stripe(identity.devid, identity.dev_uuid, logical))
}

/// Apply `fixup_chunk_tree_leaf` to each leaf-sized block of an item.
///
/// Items that are not a whole number of leaves are left alone, and the
/// first foreign block ends the scan. Returns the number of leaves rewritten.
pub fn fixup_chunk_tree_blocks(buffer: &mut [u8], start: u64, identity: &DeviceIdentity) -> Result<usize> {
    let leafsize = identity.leafsize as usize;
    if buffer.is_empty() || buffer.len() % leafsize != 0 {
        return Ok(0);
    }

    let mut rewritten = 0;
    for (i, block) in buffer.chunks_exact_mut(leafsize).enumerate() {
        let bytenr = start + (i * leafsize) as u64;
        match fixup_chunk_tree_leaf(block, bytenr, identity)? {
            LeafFixup::Rewritten => rewritten += 1,
            LeafFixup::Skipped => {}
            LeafFixup::Foreign => break,
        }
    }
    Ok(rewritten)
}

/// Rewrite the superblock's system chunk array for the target device
pub fn fixup_superblock(buffer: &mut [u8], strategy: FixupStrategy) -> Result<()> {
    match strategy {
        FixupStrategy::Verbatim => return Ok(()),
        FixupStrategy::Compat => synthesize_sys_chunk_array(buffer)?,
        FixupStrategy::Current => compact_sys_chunk_array(buffer)?,
    }
    recompute_checksum(&mut buffer[..BTRFS_SUPER_INFO_SIZE]);
    Ok(())
}

fn super_dev(buffer: &[u8]) -> (u64, [u8; BTRFS_UUID_SIZE]) {
    let dev = &buffer[SUPER_DEV_ITEM_OFFSET..];
    let mut uuid = [0u8; BTRFS_UUID_SIZE];
    uuid.copy_from_slice(&dev[DEV_ITEM_UUID_OFFSET..DEV_ITEM_UUID_OFFSET + BTRFS_UUID_SIZE]);
    (LittleEndian::read_u64(&dev[DEV_ITEM_DEVID_OFFSET..]), uuid)
}

fn check_superblock_len(buffer: &[u8]) -> Result<()> {
    if buffer.len() < BTRFS_SUPER_INFO_SIZE {
        return Err(MetadumpError::BadFormat(format!(
            "superblock item is only {} bytes",
            buffer.len()
        )));
    }
    Ok(())
}

fn compact_sys_chunk_array(buffer: &mut [u8]) -> Result<()> {
    check_superblock_len(buffer)?;
    let array_size = LittleEndian::read_u32(&buffer[SUPER_SYS_ARRAY_SIZE_OFFSET..]) as usize;
    if array_size > SUPER_SYS_CHUNK_ARRAY_MAX {
        return Err(MetadumpError::BadFormat(format!(
            "system chunk array size {} exceeds {}",
            array_size, SUPER_SYS_CHUNK_ARRAY_MAX
        )));
    }
    let (devid, dev_uuid) = super_dev(buffer);
    let array = &buffer[SUPER_SYS_CHUNK_ARRAY_OFFSET..SUPER_SYS_CHUNK_ARRAY_OFFSET + array_size];

    let mut compacted = Vec::with_capacity(array_size);
    let mut cur = 0;
    while cur < array.len() {
        let key = BtrfsKey::parse(&array[cur..])?;
        if key.item_type != BTRFS_CHUNK_ITEM_KEY {
            return Err(MetadumpError::BadFormat(format!(
                "bogus key type {} in the system chunk array",
                key.item_type
            )));
        }
        cur += BtrfsKey::SIZE;
        let chunk = BtrfsChunk::parse(&array[cur..])?;
        cur += BtrfsChunk::item_size(chunk.num_stripes);

        let mut single = chunk.to_single_stripe(devid, dev_uuid, key.offset);
        single.chunk_type = BTRFS_BLOCK_GROUP_SYSTEM;

        let at = compacted.len();
        compacted.resize(at + BtrfsKey::SIZE + BtrfsChunk::item_size(1), 0);
        key.write(&mut compacted[at..]);
        single.write(&mut compacted[at + BtrfsKey::SIZE..]);
    }

    let region = &mut buffer[SUPER_SYS_CHUNK_ARRAY_OFFSET..SUPER_SYS_CHUNK_ARRAY_OFFSET + array_size];
    region[..compacted.len()].copy_from_slice(&compacted);
    region[compacted.len()..].fill(0);
    LittleEndian::write_u32(&mut buffer[SUPER_SYS_ARRAY_SIZE_OFFSET..], compacted.len() as u32);
    Ok(())
}

fn synthesize_sys_chunk_array(buffer: &mut [u8]) -> Result<()> {
    check_superblock_len(buffer)?;
    let sectorsize = LittleEndian::read_u32(&buffer[SUPER_SECTORSIZE_OFFSET..]);
    let flags = LittleEndian::read_u64(&buffer[SUPER_FLAGS_OFFSET..]);
    LittleEndian::write_u64(&mut buffer[SUPER_FLAGS_OFFSET..], flags | BTRFS_SUPER_FLAG_METADUMP);

    let (devid, dev_uuid) = super_dev(buffer);
    let key = BtrfsKey {
        objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        item_type: BTRFS_CHUNK_ITEM_KEY,
        offset: 0,
    };
    let chunk = BtrfsChunk {
        length: u64::MAX,
        owner: BTRFS_EXTENT_TREE_OBJECTID,
        stripe_len: 64 * 1024,
        chunk_type: BTRFS_BLOCK_GROUP_SYSTEM,
        io_align: sectorsize,
        io_width: sectorsize,
        sector_size: sectorsize,
        num_stripes: 1,
        sub_stripes: 0,
        stripes: vec![BtrfsStripe {
            devid,
            offset: 0,
            dev_uuid,
        }],
    };

    let array = &mut buffer[SUPER_SYS_CHUNK_ARRAY_OFFSET..SUPER_SYS_CHUNK_ARRAY_OFFSET + SUPER_SYS_CHUNK_ARRAY_MAX];
    array.fill(0);
    key.write(array);
    chunk.write(&mut array[BtrfsKey::SIZE..]);
    LittleEndian::write_u32(
        &mut buffer[SUPER_SYS_ARRAY_SIZE_OFFSET..],
        (BtrfsKey::SIZE + BtrfsChunk::item_size(1)) as u32,
    );
    Ok(())
}

/// Size of the target, as far as its end can be seeked to
pub fn device_size(file: &File) -> Result<u64> {
    let mut handle = file;
    handle
        .seek(SeekFrom::End(0))
        .context_io(|| "querying target device size".to_string())
}

/// Mirror a fixed-up primary superblock to the backup locations that fit on
/// the target. Returns how many copies were written.
pub fn write_backup_supers(file: &File, superblock: &[u8]) -> Result<u32> {
    check_superblock_len(superblock)?;
    let size = device_size(file)?;
    let mut copy = superblock[..BTRFS_SUPER_INFO_SIZE].to_vec();
    let mut written = 0;

    for mirror in 1..BTRFS_SUPER_MIRROR_MAX {
        let bytenr = super_mirror_offset(mirror);
        if bytenr + BTRFS_SUPER_INFO_SIZE as u64 > size {
            break;
        }
        LittleEndian::write_u64(&mut copy[SUPER_BYTENR_OFFSET..], bytenr);
        recompute_checksum(&mut copy);
        write_all_at(file, &copy, bytenr)
            .context_io(|| format!("writing backup superblock at {}", bytenr))?;
        written += 1;
    }

    tracing::debug!("Wrote {} backup superblock copies (device size {})", written, size);
    Ok(written)
}
