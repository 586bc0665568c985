/// Scrub captured tree blocks so a metadump carries no file contents
///
/// Unused space is zeroed, as are checksum items and the payload of inline
/// file extents. The block checksum is recomputed afterward so the
/// restored image still verifies.
use crate::error::{MetadumpError, Result};
use crate::fs::btrfs::csum::recompute_checksum;
use crate::fs::btrfs::tree::*;

/// Sanitize one tree block in place
pub fn sanitize_tree_block(block: &mut [u8], bytenr: u64) -> Result<()> {
    if block.len() < BtrfsHeader::SIZE {
        return Err(MetadumpError::BadFormat(format!(
            "tree block at {} is only {} bytes",
            bytenr,
            block.len()
        )));
    }

    let nritems = header_nritems(block) as usize;
    let level = header_level(block);

    if nritems == 0 {
        block[BtrfsHeader::SIZE..].fill(0);
    } else if level == 0 {
        let items_end = item_nr_offset(nritems);
        if items_end > block.len() {
            return Err(bad_leaf(bytenr, format!("{} item headers overflow the block", nritems)));
        }
        let data_start = item_data_start(block, nritems - 1);
        if data_start < items_end || data_start > block.len() {
            return Err(bad_leaf(bytenr, format!("item data starts at {}", data_start)));
        }
        block[items_end..data_start].fill(0);
        zero_items(block, bytenr)?;
    } else {
        let ptrs_end = BtrfsHeader::SIZE + BtrfsKeyPtr::SIZE * nritems;
        if ptrs_end > block.len() {
            return Err(MetadumpError::BadFormat(format!(
                "node at {} claims {} pointers",
                bytenr, nritems
            )));
        }
        block[ptrs_end..].fill(0);
    }

    recompute_checksum(block);
    Ok(())
}

/// Zero checksum items and inline file extent data
fn zero_items(block: &mut [u8], bytenr: u64) -> Result<()> {
    let nritems = header_nritems(block) as usize;
    for slot in 0..nritems {
        let key = item_key(block, slot)?;
        if key.item_type != BTRFS_EXTENT_CSUM_KEY && key.item_type != BTRFS_EXTENT_DATA_KEY {
            continue;
        }

        let start = item_data_start(block, slot);
        let end = start + item_size(block, slot) as usize;
        if end > block.len() {
            return Err(bad_leaf(bytenr, format!("item {} ends at {}", slot, end)));
        }

        if key.item_type == BTRFS_EXTENT_CSUM_KEY {
            block[start..end].fill(0);
            continue;
        }

        if end - start <= FILE_EXTENT_INLINE_DATA_OFFSET
            || block[start + FILE_EXTENT_TYPE_OFFSET] != BTRFS_FILE_EXTENT_INLINE
        {
            continue;
        }
        block[start + FILE_EXTENT_INLINE_DATA_OFFSET..end].fill(0);
    }
    Ok(())
}

fn bad_leaf(bytenr: u64, reason: String) -> MetadumpError {
    MetadumpError::BadFormat(format!("leaf at {}: {}", bytenr, reason))
}
