use byteorder::LittleEndian;
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{FsError, Result};

/// Identifies a formatted volume.
pub const SB_MAGIC: u32 = 0x001a_b4f5;

/// The superblock always lives at this absolute byte offset, leaving the
/// first kilobyte for a boot sector. For block sizes above 1024 it sits
/// inside block 0 at an offset.
pub const SB_BYTE_OFFSET: usize = 1024;

/// On-disk size of the serialized superblock fields.
pub const SB_RECORD_SIZE: usize = 56;

/// The on-disk superblock record: fourteen little-endian 32-bit fields.
/// Consumed when mounting, produced by the formatter.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
pub struct RawSuperBlock {
    pub magic: U32<LittleEndian>,
    pub blocks_count: U32<LittleEndian>,
    pub block_size: U32<LittleEndian>,
    pub inodes_count: U32<LittleEndian>,
    pub inode_size: U32<LittleEndian>,
    pub first_block: U32<LittleEndian>,
    pub inode_bitmap: U32<LittleEndian>,
    pub data_bitmap: U32<LittleEndian>,
    pub inode_table: U32<LittleEndian>,
    pub data_blocks: U32<LittleEndian>,
    pub root_inode: U32<LittleEndian>,
    pub first_inode: U32<LittleEndian>,
    pub free_inodes_count: U32<LittleEndian>,
    pub free_data_blocks_count: U32<LittleEndian>,
}

impl RawSuperBlock {
    /// Reads the record from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let lv: LayoutVerified<&[u8], RawSuperBlock> =
            LayoutVerified::new_unaligned_from_prefix(buf)
                .ok_or_else(|| FsError::Corruption("superblock record truncated".to_string()))?
                .0;
        Ok(*lv)
    }
}

/// Filesystem geometry, fixed once the volume is mounted.
///
/// Every field is derived from the superblock and validated for internal
/// consistency before the engine touches any other block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Size of one block in bytes. Power of two, at least 512.
    pub block_size: u32,
    /// Total number of blocks on the volume.
    pub blocks_count: u32,
    /// Size of one inode record in bytes. Power of two, at least 128.
    pub inode_size: u32,
    /// Number of inode slots, including the reserved bad-inode slot 0.
    pub inodes_count: u32,
    /// First block usable by filesystem metadata (past boot sector and
    /// superblock).
    pub first_block: u32,
    /// Starting block of the inode allocation bitmap.
    pub inode_bitmap: u32,
    /// Starting block of the data-region allocation bitmap.
    pub data_bitmap: u32,
    /// Starting block of the inode table.
    pub inode_table: u32,
    /// First block of the data region. Data bitmap bit i tracks physical
    /// block `data_start + i`.
    pub data_start: u32,
    /// Inode number of the root directory.
    pub root_inode: u32,
    /// First inode number available for ordinary files.
    pub first_inode: u32,
}

impl Geometry {
    /// Validates a parsed superblock and freezes it into a geometry.
    pub fn from_raw(raw: &RawSuperBlock) -> Result<Self> {
        if raw.magic.get() != SB_MAGIC {
            return Err(FsError::Corruption(format!(
                "bad superblock magic {:#x}",
                raw.magic.get()
            )));
        }
        let geo = Geometry {
            block_size: raw.block_size.get(),
            blocks_count: raw.blocks_count.get(),
            inode_size: raw.inode_size.get(),
            inodes_count: raw.inodes_count.get(),
            first_block: raw.first_block.get(),
            inode_bitmap: raw.inode_bitmap.get(),
            data_bitmap: raw.data_bitmap.get(),
            inode_table: raw.inode_table.get(),
            data_start: raw.data_blocks.get(),
            root_inode: raw.root_inode.get(),
            first_inode: raw.first_inode.get(),
        };
        geo.validate()?;
        Ok(geo)
    }

    fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(FsError::Corruption(format!(
                "unsupported block size {}",
                self.block_size
            )));
        }
        if !self.inode_size.is_power_of_two()
            || self.inode_size < 128
            || self.inode_size > self.block_size
        {
            return Err(FsError::Corruption(format!(
                "unsupported inode size {}",
                self.inode_size
            )));
        }
        let ordered = self.first_block <= self.inode_bitmap
            && self.inode_bitmap <= self.data_bitmap
            && self.data_bitmap <= self.inode_table
            && self.inode_table <= self.data_start
            && self.data_start < self.blocks_count;
        if !ordered {
            return Err(FsError::Corruption(
                "metadata regions out of order".to_string(),
            ));
        }
        if self.inodes_count == 0 || self.root_inode >= self.inodes_count {
            return Err(FsError::Corruption("bad inode region bounds".to_string()));
        }
        let table_bytes = self.inodes_count as u64 * self.inode_size as u64;
        let table_room = (self.data_start - self.inode_table) as u64 * self.block_size as u64;
        if table_bytes > table_room {
            return Err(FsError::Corruption(
                "inode table overruns data region".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_raw(&self, free_inodes: u32, free_data_blocks: u32) -> RawSuperBlock {
        RawSuperBlock {
            magic: U32::new(SB_MAGIC),
            blocks_count: U32::new(self.blocks_count),
            block_size: U32::new(self.block_size),
            inodes_count: U32::new(self.inodes_count),
            inode_size: U32::new(self.inode_size),
            first_block: U32::new(self.first_block),
            inode_bitmap: U32::new(self.inode_bitmap),
            data_bitmap: U32::new(self.data_bitmap),
            inode_table: U32::new(self.inode_table),
            data_blocks: U32::new(self.data_start),
            root_inode: U32::new(self.root_inode),
            first_inode: U32::new(self.first_inode),
            free_inodes_count: U32::new(free_inodes),
            free_data_blocks_count: U32::new(free_data_blocks),
        }
    }

    /// Block holding the superblock record and the byte offset inside it.
    pub fn sb_location(block_size: u32) -> (usize, usize) {
        (
            SB_BYTE_OFFSET / block_size as usize,
            SB_BYTE_OFFSET % block_size as usize,
        )
    }

    /// Number of block pointers an indirect block can hold.
    pub fn addrs_per_block(&self) -> u32 {
        self.block_size / 4
    }

    /// Number of data-region blocks tracked by the data bitmap.
    pub fn data_blocks_count(&self) -> u32 {
        self.blocks_count - self.data_start
    }

    /// Byte position of an inode record inside the inode table.
    pub fn inode_byte_position(&self, ino: u32) -> (usize, usize) {
        let byte = ino as u64 * self.inode_size as u64;
        let block = self.inode_table as u64 + byte / self.block_size as u64;
        (block as usize, (byte % self.block_size as u64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Geometry {
        Geometry {
            block_size: 1024,
            blocks_count: 64,
            inode_size: 128,
            inodes_count: 48,
            first_block: 2,
            inode_bitmap: 2,
            data_bitmap: 3,
            inode_table: 4,
            data_start: 10,
            root_inode: 1,
            first_inode: 2,
        }
    }

    #[test]
    fn can_encode_and_decode_superblocks() {
        let geo = sample();
        let raw = geo.to_raw(46, 54);
        let parsed = RawSuperBlock::parse(raw.as_bytes()).unwrap();
        assert_eq!(Geometry::from_raw(&parsed).unwrap(), geo);
        assert_eq!(parsed.free_inodes_count.get(), 46);
        assert_eq!(parsed.free_data_blocks_count.get(), 54);
    }

    #[test]
    fn serialized_record_has_fixed_size() {
        let raw = sample().to_raw(0, 0);
        assert_eq!(raw.as_bytes().len(), SB_RECORD_SIZE);
    }

    #[test]
    fn parsing_buffer_with_invalid_magic_fails() {
        let mut raw = sample().to_raw(0, 0);
        raw.magic = U32::new(0xdeadbeef);
        let parsed = RawSuperBlock::parse(raw.as_bytes()).unwrap();
        match Geometry::from_raw(&parsed) {
            Err(FsError::Corruption(_)) => (),
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn regions_out_of_order_fail_validation() {
        let mut geo = sample();
        geo.inode_table = 99;
        let raw = geo.to_raw(0, 0);
        assert!(Geometry::from_raw(&raw).is_err());
    }

    #[test]
    fn superblock_location_depends_on_block_size() {
        assert_eq!(Geometry::sb_location(1024), (1, 0));
        assert_eq!(Geometry::sb_location(4096), (0, 1024));
        assert_eq!(Geometry::sb_location(512), (2, 0));
    }
}
