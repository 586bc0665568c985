/// Btrfs block checksums (CRC32C, csum_type 0)
use byteorder::{ByteOrder, LittleEndian};

use super::BTRFS_CSUM_SIZE;

/// CRC32C of everything after the checksum field.
pub fn block_crc(block: &[u8]) -> u32 {
    crc32c::crc32c(&block[BTRFS_CSUM_SIZE..])
}

/// Overwrite the block's leading checksum with the CRC of the rest of it.
///
/// Must be called after any in-place change to a tree block or superblock.
pub fn recompute_checksum(block: &mut [u8]) {
    let crc = block_crc(block);
    block[..BTRFS_CSUM_SIZE].fill(0);
    LittleEndian::write_u32(&mut block[..4], crc);
}

pub fn verify_checksum(block: &[u8]) -> bool {
    block.len() > BTRFS_CSUM_SIZE && LittleEndian::read_u32(&block[..4]) == block_crc(block)
}
