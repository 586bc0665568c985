/// Chunk items and the logical → physical map they describe
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

use super::tree::{BtrfsKey, BTRFS_CHUNK_ITEM_KEY};
use super::BTRFS_UUID_SIZE;
use crate::error::{MetadumpError, Result};

/// Block group type and profile bits
pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BTRFS_BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BTRFS_BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BTRFS_BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BTRFS_BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BTRFS_BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BTRFS_BLOCK_GROUP_RAID6: u64 = 1 << 8;

pub const BTRFS_BLOCK_GROUP_TYPE_MASK: u64 =
    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_SYSTEM | BTRFS_BLOCK_GROUP_METADATA;

/// Profiles whose data is spread across stripes rather than mirrored
const STRIPED_PROFILES: u64 = BTRFS_BLOCK_GROUP_RAID0
    | BTRFS_BLOCK_GROUP_RAID10
    | BTRFS_BLOCK_GROUP_RAID5
    | BTRFS_BLOCK_GROUP_RAID6;

/// One stripe of a chunk: where on which device the chunk lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtrfsStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

impl BtrfsStripe {
    pub const SIZE: usize = 32;

    fn parse(data: &[u8]) -> Self {
        let mut dev_uuid = [0u8; BTRFS_UUID_SIZE];
        dev_uuid.copy_from_slice(&data[16..32]);
        Self {
            devid: LittleEndian::read_u64(&data[0..8]),
            offset: LittleEndian::read_u64(&data[8..16]),
            dev_uuid,
        }
    }

    fn write(&self, out: &mut [u8]) {
        LittleEndian::write_u64(&mut out[0..8], self.devid);
        LittleEndian::write_u64(&mut out[8..16], self.offset);
        out[16..32].copy_from_slice(&self.dev_uuid);
    }
}

/// `btrfs_chunk`: a fixed 48-byte part followed by `num_stripes` stripes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrfsChunk {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<BtrfsStripe>,
}

impl BtrfsChunk {
    pub const FIXED_SIZE: usize = 48;

    /// On-disk size of a chunk with `num_stripes` stripes
    pub fn item_size(num_stripes: u16) -> usize {
        Self::FIXED_SIZE + BtrfsStripe::SIZE * num_stripes as usize
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::item_size(1) {
            return Err(MetadumpError::BadFormat(format!(
                "chunk item too small: {} bytes",
                data.len()
            )));
        }
        let num_stripes = LittleEndian::read_u16(&data[44..46]);
        if num_stripes == 0 || data.len() < Self::item_size(num_stripes) {
            return Err(MetadumpError::BadFormat(format!(
                "chunk item with {} stripes does not fit in {} bytes",
                num_stripes,
                data.len()
            )));
        }
        let stripes = (0..num_stripes as usize)
            .map(|i| BtrfsStripe::parse(&data[Self::FIXED_SIZE + i * BtrfsStripe::SIZE..]))
            .collect();

        Ok(Self {
            length: LittleEndian::read_u64(&data[0..8]),
            owner: LittleEndian::read_u64(&data[8..16]),
            stripe_len: LittleEndian::read_u64(&data[16..24]),
            chunk_type: LittleEndian::read_u64(&data[24..32]),
            io_align: LittleEndian::read_u32(&data[32..36]),
            io_width: LittleEndian::read_u32(&data[36..40]),
            sector_size: LittleEndian::read_u32(&data[40..44]),
            num_stripes,
            sub_stripes: LittleEndian::read_u16(&data[46..48]),
            stripes,
        })
    }

    /// Encode into `out`, which must hold `item_size(self.stripes.len())` bytes
    pub fn write(&self, out: &mut [u8]) {
        LittleEndian::write_u64(&mut out[0..8], self.length);
        LittleEndian::write_u64(&mut out[8..16], self.owner);
        LittleEndian::write_u64(&mut out[16..24], self.stripe_len);
        LittleEndian::write_u64(&mut out[24..32], self.chunk_type);
        LittleEndian::write_u32(&mut out[32..36], self.io_align);
        LittleEndian::write_u32(&mut out[36..40], self.io_width);
        LittleEndian::write_u32(&mut out[40..44], self.sector_size);
        LittleEndian::write_u16(&mut out[44..46], self.num_stripes);
        LittleEndian::write_u16(&mut out[46..48], self.sub_stripes);
        for (i, stripe) in self.stripes.iter().enumerate() {
            stripe.write(&mut out[Self::FIXED_SIZE + i * BtrfsStripe::SIZE..]);
        }
    }

    /// Collapse to a single stripe on the given device, mapped 1:1 at `logical`
    pub fn to_single_stripe(&self, devid: u64, dev_uuid: [u8; BTRFS_UUID_SIZE], logical: u64) -> Self {
        Self {
            num_stripes: 1,
            sub_stripes: 0,
            stripes: vec![BtrfsStripe {
                devid,
                offset: logical,
                dev_uuid,
            }],
            ..self.clone()
        }
    }
}

/// Decode the superblock's system chunk array into (key, chunk) pairs
pub fn parse_sys_chunk_array(array: &[u8]) -> Result<Vec<(BtrfsKey, BtrfsChunk)>> {
    let mut chunks = Vec::new();
    let mut cur = 0;
    while cur < array.len() {
        let key = BtrfsKey::parse(&array[cur..])?;
        cur += BtrfsKey::SIZE;
        if key.item_type != BTRFS_CHUNK_ITEM_KEY {
            return Err(MetadumpError::BadFormat(format!(
                "unexpected key type {} in system chunk array",
                key.item_type
            )));
        }
        let chunk = BtrfsChunk::parse(&array[cur..])?;
        cur += BtrfsChunk::item_size(chunk.num_stripes);
        chunks.push((key, chunk));
    }
    Ok(chunks)
}

#[derive(Debug, Clone, Copy)]
struct ChunkMapping {
    length: u64,
    physical: u64,
}

/// Logical → physical translation for a single device
#[derive(Debug, Default)]
pub struct ChunkMap {
    devid: u64,
    chunks: BTreeMap<u64, ChunkMapping>,
}

impl ChunkMap {
    pub fn new(devid: u64) -> Self {
        Self {
            devid,
            chunks: BTreeMap::new(),
        }
    }

    /// Register the chunk starting at `logical`
    pub fn insert(&mut self, logical: u64, chunk: &BtrfsChunk) -> Result<()> {
        if chunk.chunk_type & STRIPED_PROFILES != 0 {
            return Err(MetadumpError::BadFormat(format!(
                "chunk at {} uses striped profile {:#x}",
                logical, chunk.chunk_type
            )));
        }
        let stripe = chunk
            .stripes
            .iter()
            .find(|s| s.devid == self.devid)
            .ok_or_else(|| {
                MetadumpError::BadFormat(format!(
                    "chunk at {} has no stripe on device {}",
                    logical, self.devid
                ))
            })?;
        self.chunks.insert(
            logical,
            ChunkMapping {
                length: chunk.length,
                physical: stripe.offset,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Physical offset of `len` bytes at `logical`; the range may not cross chunks
    pub fn map(&self, logical: u64, len: u64) -> Result<u64> {
        let (physical, available) = self.map_segment(logical, len)?;
        if available < len {
            return Err(MetadumpError::BadFormat(format!(
                "range {}+{} is not covered by one chunk",
                logical, len
            )));
        }
        Ok(physical)
    }

    /// Physical offset of `logical` and how many of the next `len` bytes the
    /// same chunk covers
    pub fn map_segment(&self, logical: u64, len: u64) -> Result<(u64, u64)> {
        let (start, mapping) = self
            .chunks
            .range(..=logical)
            .next_back()
            .ok_or_else(|| MetadumpError::BadFormat(format!("no chunk maps logical {}", logical)))?;
        let within = logical - start;
        if within >= mapping.length {
            return Err(MetadumpError::BadFormat(format!(
                "logical {} lies past the end of chunk at {}",
                logical, start
            )));
        }
        Ok((mapping.physical + within, len.min(mapping.length - within)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_type: u64, stripes: &[(u64, u64)]) -> BtrfsChunk {
        BtrfsChunk {
            length: 8 * 1024 * 1024,
            owner: 2,
            stripe_len: 64 * 1024,
            chunk_type,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: stripes.len() as u16,
            sub_stripes: 0,
            stripes: stripes
                .iter()
                .map(|&(devid, offset)| BtrfsStripe {
                    devid,
                    offset,
                    dev_uuid: [devid as u8; 16],
                })
                .collect(),
        }
    }

    #[test]
    fn test_chunk_encode_decode() {
        let c = chunk(BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_DUP, &[(1, 0x10_0000), (1, 0x90_0000)]);
        let mut buf = vec![0u8; BtrfsChunk::item_size(2)];
        c.write(&mut buf);
        assert_eq!(BtrfsChunk::parse(&buf).unwrap(), c);
    }

    #[test]
    fn test_sys_chunk_array_parse() {
        let c = chunk(BTRFS_BLOCK_GROUP_SYSTEM, &[(1, 0x10_0000)]);
        let mut array = vec![0u8; BtrfsKey::SIZE + BtrfsChunk::item_size(1)];
        BtrfsKey {
            objectid: 256,
            item_type: BTRFS_CHUNK_ITEM_KEY,
            offset: 0x10_0000,
        }
        .write(&mut array);
        c.write(&mut array[BtrfsKey::SIZE..]);

        let parsed = parse_sys_chunk_array(&array).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0.offset, 0x10_0000);
        assert_eq!(parsed[0].1, c);
    }

    #[test]
    fn test_chunk_map_picks_local_stripe() {
        let mut map = ChunkMap::new(2);
        map.insert(0x100_0000, &chunk(BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1, &[(1, 0x50_0000), (2, 0x70_0000)]))
            .unwrap();
        assert_eq!(map.map(0x100_1000, 4096).unwrap(), 0x70_1000);
        assert!(map.map(0xFF_0000, 4096).is_err());
        assert!(map.map(0x100_0000 + 8 * 1024 * 1024 - 1024, 4096).is_err());
    }

    #[test]
    fn test_segments_follow_adjacent_chunks() {
        let len = 8 * 1024 * 1024;
        let mut map = ChunkMap::new(1);
        map.insert(0x100_0000, &chunk(BTRFS_BLOCK_GROUP_DATA, &[(1, 0x50_0000)])).unwrap();
        map.insert(0x100_0000 + len, &chunk(BTRFS_BLOCK_GROUP_DATA, &[(1, 0x200_0000)])).unwrap();

        let boundary = 0x100_0000 + len;
        assert_eq!(map.map_segment(boundary - 4096, 8192).unwrap(), (0x50_0000 + len - 4096, 4096));
        assert_eq!(map.map_segment(boundary, 4096).unwrap(), (0x200_0000, 4096));
        assert!(map.map(boundary - 4096, 8192).is_err());
        // a gap after the last chunk
        assert!(map.map_segment(boundary + len, 4096).is_err());
    }

    #[test]
    fn test_chunk_map_rejects_striped_profiles() {
        let mut map = ChunkMap::new(1);
        let err = map
            .insert(0, &chunk(BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID0, &[(1, 0), (2, 0)]))
            .unwrap_err();
        assert!(matches!(err, MetadumpError::BadFormat(_)));
    }
}
