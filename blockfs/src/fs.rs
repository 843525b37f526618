use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use zerocopy::AsBytes;

use crate::alloc::Bitmap;
use crate::error::{FsError, Result};
use crate::io::BlockStorage;
use crate::lock;
use crate::node::{Inode, NodeState, S_IFDIR};
use crate::sb::{Geometry, RawSuperBlock, SB_RECORD_SIZE};

/// Inode numbers reserved by the format: slot 0 is the bad inode, slot 1 the
/// root directory.
const RESERVED_INODES: u32 = 2;
const ROOT_INO: u32 = 1;

/// Behavior knobs fixed at mount time.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Force directory-block writes to the medium before returning.
    pub sync_dirs: bool,
    /// How many times a block-chain walk may be retried after losing a race
    /// with a concurrent truncate before the call fails with
    /// [`FsError::Contention`].
    pub chain_retry_limit: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            sync_dirs: false,
            chain_retry_limit: 16,
        }
    }
}

/// Geometry knobs for formatting a fresh volume.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub total_blocks: u32,
    pub block_size: u32,
    pub inode_size: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            total_blocks: 64,
            block_size: 1024,
            inode_size: 128,
        }
    }
}

struct Counters {
    free_inodes: u32,
    free_data_blocks: u32,
}

/// A mounted filesystem: the geometry, both allocation bitmaps, the global
/// free counters, the per-mount inode handles, and the device itself. Created
/// once at mount and torn down once on drop; nothing here is global state.
pub struct Filesystem<T: BlockStorage> {
    dev: Mutex<T>,
    geo: Geometry,
    inode_map: Bitmap,
    block_map: Bitmap,
    counters: Mutex<Counters>,
    options: MountOptions,
    nodes: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl<T: BlockStorage> Filesystem<T> {
    /// Mounts an already formatted device: reads and validates the
    /// superblock, loads both bitmaps, and picks up the free counters.
    pub fn mount(mut dev: T, options: MountOptions) -> Result<Self> {
        let raw = read_superblock(&mut dev)?;
        let geo = Geometry::from_raw(&raw)?;
        if geo.block_size as usize != dev.block_size() {
            return Err(FsError::Corruption(format!(
                "superblock declares {}-byte blocks but the device uses {}",
                geo.block_size,
                dev.block_size()
            )));
        }
        debug!(
            "mounting: {} blocks of {} bytes, {} inodes",
            geo.blocks_count, geo.block_size, geo.inodes_count
        );

        let inode_map = Bitmap::setup(&mut dev, geo.inode_bitmap, geo.inodes_count, geo.block_size)?;
        let block_map = Bitmap::setup(
            &mut dev,
            geo.data_bitmap,
            geo.data_blocks_count(),
            geo.block_size,
        )?;

        let counters = Counters {
            free_inodes: raw.free_inodes_count.get(),
            free_data_blocks: raw.free_data_blocks_count.get(),
        };
        info!(
            "mounted filesystem: {} free inodes, {} free data blocks",
            counters.free_inodes, counters.free_data_blocks
        );

        Ok(Filesystem {
            dev: Mutex::new(dev),
            geo,
            inode_map,
            block_map,
            counters: Mutex::new(counters),
            options,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Initializes the filesystem onto owned block storage and mounts it.
    ///
    /// # Layout
    /// =========================================================================
    /// | Boot + SuperBlock | Bitmap (inodes) | Bitmap (data) | Inodes | Data |
    /// =========================================================================
    pub fn format(mut dev: T, opts: &FormatOptions) -> Result<Self> {
        if opts.block_size as usize != dev.block_size() {
            return Err(FsError::InvalidArgument(format!(
                "cannot format {}-byte blocks onto a device with {}-byte blocks",
                opts.block_size,
                dev.block_size()
            )));
        }
        let geo = compute_geometry(opts)?;
        let bs = geo.block_size as usize;

        // Zero the whole metadata region so both bitmaps and the inode table
        // start from a clean slate.
        let zeroes = vec![0u8; bs];
        for blocknr in 0..geo.data_start as usize {
            dev.write_block(blocknr, &zeroes)?;
        }

        // Superblock, at its fixed byte offset.
        let raw = geo.to_raw(
            geo.inodes_count - RESERVED_INODES,
            geo.data_blocks_count(),
        );
        let (sb_block, sb_offset) = Geometry::sb_location(geo.block_size);
        let mut buf = vec![0u8; bs];
        dev.read_block(sb_block, &mut buf)?;
        buf[sb_offset..sb_offset + SB_RECORD_SIZE].copy_from_slice(raw.as_bytes());
        dev.write_block(sb_block, &buf)?;

        // Inode bitmap: the bad inode and the root are taken from the start.
        let mut buf = vec![0u8; bs];
        buf[0] = 0b0000_0011;
        dev.write_block(geo.inode_bitmap as usize, &buf)?;

        // Root directory inode: no blocks yet, two links by convention.
        let mut root = NodeState::new_file(S_IFDIR | 0o755, crate::node::unix_now());
        root.links_count = 2;
        let (blocknr, offset) = geo.inode_byte_position(ROOT_INO);
        let mut buf = vec![0u8; bs];
        dev.read_block(blocknr, &mut buf)?;
        buf[offset..offset + crate::node::INODE_RECORD_SIZE]
            .copy_from_slice(root.to_raw().as_bytes());
        dev.write_block(blocknr, &buf)?;

        dev.sync_disk()?;
        info!(
            "formatted {} blocks of {} bytes: {} inodes, data region at block {}",
            geo.blocks_count, geo.block_size, geo.inodes_count, geo.data_start
        );
        Self::mount(dev, MountOptions::default())
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn inode_bitmap(&self) -> &Bitmap {
        &self.inode_map
    }

    pub fn data_bitmap(&self) -> &Bitmap {
        &self.block_map
    }

    pub(crate) fn options(&self) -> &MountOptions {
        &self.options
    }

    pub(crate) fn block_size(&self) -> usize {
        self.geo.block_size as usize
    }

    /// A consistent snapshot of the free-inode and free-data-block counters.
    pub fn free_counts(&self) -> (u32, u32) {
        let counters = lock::hold(&self.counters);
        (counters.free_inodes, counters.free_data_blocks)
    }

    /// Flushes bitmaps, counters, and buffered device writes to the medium.
    pub fn sync(&self) -> Result<()> {
        let (free_inodes, free_data_blocks) = self.free_counts();
        let raw = self.geo.to_raw(free_inodes, free_data_blocks);

        let mut dev = lock::hold(&self.dev);
        self.inode_map.flush(&mut *dev)?;
        self.block_map.flush(&mut *dev)?;

        let (sb_block, sb_offset) = Geometry::sb_location(self.geo.block_size);
        let mut buf = vec![0u8; self.block_size()];
        dev.read_block(sb_block, &mut buf)?;
        buf[sb_offset..sb_offset + SB_RECORD_SIZE].copy_from_slice(raw.as_bytes());
        dev.write_block(sb_block, &buf)?;
        dev.sync_disk()?;
        Ok(())
    }

    // ── Block-level plumbing shared by the translator and the directory code ──

    pub(crate) fn read_block_buf(&self, blocknr: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size()];
        let mut dev = lock::hold(&self.dev);
        dev.read_block(blocknr, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_block_buf(&self, blocknr: usize, buf: &[u8]) -> Result<()> {
        let mut dev = lock::hold(&self.dev);
        dev.write_block(blocknr, buf)?;
        Ok(())
    }

    /// Read-modify-write of a byte range inside one block, done under the
    /// device lock so concurrent updates of sibling records in the same block
    /// (inode table slots, most of all) cannot trample each other.
    pub(crate) fn update_block_region(
        &self,
        blocknr: usize,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let mut dev = lock::hold(&self.dev);
        let mut buf = vec![0u8; self.block_size()];
        dev.read_block(blocknr, &mut buf)?;
        buf[offset..offset + data.len()].copy_from_slice(data);
        dev.write_block(blocknr, &buf)?;
        Ok(())
    }

    pub(crate) fn sync_device(&self) -> Result<()> {
        let mut dev = lock::hold(&self.dev);
        dev.sync_disk()?;
        Ok(())
    }

    // ── Data-block accounting ───────────────────────────────────────────────

    /// Claims one data block, preferring the first free bit at or after
    /// `goal_bit`. If nothing is free past the goal the scan restarts once
    /// from bit 0; it never wraps mid-scan. Returns the physical block
    /// number.
    pub(crate) fn alloc_data_block(&self, goal_bit: u32) -> Result<u32> {
        let bit = match self.block_map.find_next_zero(goal_bit, true) {
            Some(bit) => Some(bit),
            None if goal_bit > 0 => self.block_map.find_next_zero(0, true),
            None => None,
        };
        let bit = bit.ok_or(FsError::NoSpace)?;
        {
            let mut counters = lock::hold(&self.counters);
            counters.free_data_blocks = counters.free_data_blocks.saturating_sub(1);
        }
        Ok(self.geo.data_start + bit)
    }

    /// Returns a data-region block to the bitmap and bumps the free counter.
    pub fn free_data_block(&self, blocknr: u32) -> Result<()> {
        if blocknr < self.geo.data_start || blocknr >= self.geo.blocks_count {
            return Err(FsError::InvalidArgument(format!(
                "block {} is outside the data region",
                blocknr
            )));
        }
        if self.block_map.test_and_clear(blocknr - self.geo.data_start)? {
            let mut counters = lock::hold(&self.counters);
            counters.free_data_blocks += 1;
        } else {
            warn!("freeing block {} which was not allocated", blocknr);
        }
        Ok(())
    }

    pub(crate) fn inode_map(&self) -> &Bitmap {
        &self.inode_map
    }

    pub(crate) fn note_inode_alloc(&self) {
        let mut counters = lock::hold(&self.counters);
        counters.free_inodes = counters.free_inodes.saturating_sub(1);
    }

    pub(crate) fn note_inode_free(&self) {
        let mut counters = lock::hold(&self.counters);
        counters.free_inodes += 1;
    }

    // ── Per-mount inode handles ─────────────────────────────────────────────

    pub(crate) fn cached_inode(&self, ino: u32) -> Option<Arc<Inode>> {
        lock::hold(&self.nodes).get(&ino).cloned()
    }

    pub(crate) fn insert_inode(&self, inode: Inode) -> Arc<Inode> {
        let mut nodes = lock::hold(&self.nodes);
        nodes
            .entry(inode.ino())
            .or_insert_with(|| Arc::new(inode))
            .clone()
    }

    pub(crate) fn evict_inode(&self, ino: u32) {
        lock::hold(&self.nodes).remove(&ino);
    }
}

impl<T: BlockStorage> Drop for Filesystem<T> {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!("could not sync filesystem on teardown: {}", e);
        }
    }
}

fn read_superblock<T: BlockStorage>(dev: &mut T) -> Result<RawSuperBlock> {
    let bs = dev.block_size();
    let (sb_block, sb_offset) = Geometry::sb_location(bs as u32);
    let mut buf = vec![0u8; bs];
    dev.read_block(sb_block, &mut buf)?;
    RawSuperBlock::parse(&buf[sb_offset..])
}

/// Derives the region layout from the raw device size, one inode per
/// data block as the sizing heuristic.
fn compute_geometry(opts: &FormatOptions) -> Result<Geometry> {
    let bs = opts.block_size;
    let is = opts.inode_size;
    let total = opts.total_blocks;

    if !bs.is_power_of_two() || bs < 512 {
        return Err(FsError::InvalidArgument(format!(
            "block size {} must be a power of two of at least 512",
            bs
        )));
    }
    if !is.is_power_of_two() || is < 128 || is > bs {
        return Err(FsError::InvalidArgument(format!(
            "inode size {} must be a power of two between 128 and the block size",
            is
        )));
    }

    // Boot sector plus superblock occupy the first 2048 bytes.
    let first_block = (2048 + bs - 1) / bs;
    let remaining = total
        .checked_sub(first_block)
        .filter(|r| *r >= 4)
        .ok_or_else(|| {
            FsError::InvalidArgument(format!("{} blocks is too small to format", total))
        })?;

    // One inode per data block, rounded down to whole bitmap bytes.
    let mut inodes_count = (remaining as u64 * bs as u64 / (bs + is) as u64) as u32;
    inodes_count &= !7;
    inodes_count = inodes_count.max(8);

    let bits_per_block = bs * 8;
    let ib_blocks = (inodes_count + bits_per_block - 1) / bits_per_block;
    let it_blocks = (inodes_count * is + bs - 1) / bs;

    let after_bitmap = remaining
        .checked_sub(ib_blocks)
        .and_then(|r| r.checked_sub(it_blocks))
        .filter(|r| *r >= 2)
        .ok_or_else(|| {
            FsError::InvalidArgument(format!("{} blocks is too small to format", total))
        })?;

    // The rest splits between the data bitmap and the data region itself;
    // every data-bitmap block tracks 8 * block_size data blocks.
    let db_blocks = (after_bitmap + bits_per_block) / (bits_per_block + 1);
    let db_blocks = db_blocks.max(1);

    let inode_bitmap = first_block;
    let data_bitmap = inode_bitmap + ib_blocks;
    let inode_table = data_bitmap + db_blocks;
    let data_start = inode_table + it_blocks;

    if data_start >= total {
        return Err(FsError::InvalidArgument(format!(
            "{} blocks is too small to format",
            total
        )));
    }

    Ok(Geometry {
        block_size: bs,
        blocks_count: total,
        inode_size: is,
        inodes_count,
        first_block,
        inode_bitmap,
        data_bitmap,
        inode_table,
        data_start,
        root_inode: ROOT_INO,
        first_inode: RESERVED_INODES,
    })
}
