use std::sync::RwLock;

use log::{debug, error};

use crate::error::{FsError, Result};
use crate::io::BlockStorage;
use crate::lock;

/// One logical bit-vector backed by consecutive disk blocks, tracking the
/// allocation state of a resource class (inodes or data blocks). Bit i is set
/// iff resource i is allocated.
///
/// A single reader/writer lock spans the whole bit range. That is coarse
/// grained on purpose: the bitmap is small next to the filesystem it
/// describes, and a writer must exclude everyone for the full test-and-mutate
/// anyway.
pub struct Bitmap {
    start_block: u32,
    nr_valid_bits: u32,
    nr_bits_per_block: u32,
    log_nr_bits_per_block: u32,
    blocks: RwLock<BackingBlocks>,
}

struct BackingBlocks {
    bufs: Vec<Vec<u8>>,
    dirty: Vec<bool>,
}

/// Splits an absolute bit index into (backing block, byte inside it, mask).
fn locate(bitmap: &Bitmap, nr: u32) -> (usize, usize, u8) {
    let block = (nr >> bitmap.log_nr_bits_per_block) as usize;
    let offset = nr & (bitmap.nr_bits_per_block - 1);
    (block, (offset / 8) as usize, 1u8 << (offset % 8))
}

impl Bitmap {
    /// Loads the backing blocks for a bitmap of `nr_valid_bits` bits starting
    /// at `start_block`. Fails with an I/O error if any backing block cannot
    /// be read.
    pub fn setup<T: BlockStorage>(
        dev: &mut T,
        start_block: u32,
        nr_valid_bits: u32,
        block_size: u32,
    ) -> Result<Bitmap> {
        let nr_bits_per_block = block_size * 8;
        let nr_bhs = (nr_valid_bits as usize + nr_bits_per_block as usize - 1)
            / nr_bits_per_block as usize;
        debug!(
            "setting up a bitmap of {} bits over {} backing block(s) at block {}",
            nr_valid_bits, nr_bhs, start_block
        );

        let mut bufs = Vec::with_capacity(nr_bhs);
        for i in 0..nr_bhs {
            let mut buf = vec![0u8; block_size as usize];
            dev.read_block(start_block as usize + i, &mut buf)
                .map_err(|e| {
                    error!("cannot load bitmap at block {}", start_block as usize + i);
                    e
                })?;
            bufs.push(buf);
        }

        Ok(Bitmap {
            start_block,
            nr_valid_bits,
            nr_bits_per_block,
            log_nr_bits_per_block: nr_bits_per_block.trailing_zeros(),
            blocks: RwLock::new(BackingBlocks {
                dirty: vec![false; nr_bhs],
                bufs,
            }),
        })
    }

    pub fn nr_valid_bits(&self) -> u32 {
        self.nr_valid_bits
    }

    fn check_range(&self, nr: u32) -> Result<()> {
        if nr >= self.nr_valid_bits {
            return Err(FsError::InvalidArgument(format!(
                "bit {} outside bitmap of {} bits",
                nr, self.nr_valid_bits
            )));
        }
        Ok(())
    }

    /// Sets bit `nr` unconditionally and marks its backing block dirty.
    pub fn set(&self, nr: u32) -> Result<()> {
        self.check_range(nr)?;
        let (n, byte, mask) = locate(self, nr);
        let mut blocks = lock::write(&self.blocks);
        blocks.bufs[n][byte] |= mask;
        blocks.dirty[n] = true;
        Ok(())
    }

    /// Clears bit `nr` unconditionally and marks its backing block dirty.
    pub fn clear(&self, nr: u32) -> Result<()> {
        self.check_range(nr)?;
        let (n, byte, mask) = locate(self, nr);
        let mut blocks = lock::write(&self.blocks);
        blocks.bufs[n][byte] &= !mask;
        blocks.dirty[n] = true;
        Ok(())
    }

    /// Reads bit `nr` without dirtying anything.
    pub fn test(&self, nr: u32) -> Result<bool> {
        self.check_range(nr)?;
        let (n, byte, mask) = locate(self, nr);
        let blocks = lock::read(&self.blocks);
        Ok(blocks.bufs[n][byte] & mask != 0)
    }

    /// Sets bit `nr` and returns its prior value. The backing block is dirtied
    /// only when the bit actually changed, which is what lets callers claim a
    /// resource exactly once.
    pub fn test_and_set(&self, nr: u32) -> Result<bool> {
        self.check_range(nr)?;
        let (n, byte, mask) = locate(self, nr);
        let mut blocks = lock::write(&self.blocks);
        let prior = blocks.bufs[n][byte] & mask != 0;
        if !prior {
            blocks.bufs[n][byte] |= mask;
            blocks.dirty[n] = true;
        }
        Ok(prior)
    }

    /// Clears bit `nr` and returns its prior value. Dirties only on change.
    pub fn test_and_clear(&self, nr: u32) -> Result<bool> {
        self.check_range(nr)?;
        let (n, byte, mask) = locate(self, nr);
        let mut blocks = lock::write(&self.blocks);
        let prior = blocks.bufs[n][byte] & mask != 0;
        if prior {
            blocks.bufs[n][byte] &= !mask;
            blocks.dirty[n] = true;
        }
        Ok(prior)
    }

    /// Scans forward from bit `from` (clamped into range) for the first zero
    /// bit. The scan starts at the bit offset inside the containing backing
    /// block, continues through subsequent blocks from bit 0, and never wraps
    /// past the end of the bitmap.
    ///
    /// With `claim` the found bit is set and its block dirtied inside the same
    /// critical section as the scan, so no other allocation can observe the
    /// bit as free in between. Returns `None` once the bitmap is exhausted.
    pub fn find_next_zero(&self, from: u32, claim: bool) -> Option<u32> {
        if self.nr_valid_bits == 0 {
            return None;
        }
        let from = from.min(self.nr_valid_bits - 1);
        if claim {
            let mut blocks = lock::write(&self.blocks);
            let found = self.scan_zero(&blocks, from);
            if let Some(nr) = found {
                let (n, byte, mask) = locate(self, nr);
                blocks.bufs[n][byte] |= mask;
                blocks.dirty[n] = true;
            }
            found
        } else {
            let blocks = lock::read(&self.blocks);
            self.scan_zero(&blocks, from)
        }
    }

    fn scan_zero(&self, blocks: &BackingBlocks, from: u32) -> Option<u32> {
        let mut nr = from;
        while nr < self.nr_valid_bits {
            let (n, byte, mask) = locate(self, nr);
            let buf = &blocks.bufs[n];
            // Skip saturated bytes once the current one is exhausted.
            if buf[byte] & mask != 0 {
                if buf[byte] | (mask.wrapping_sub(1)) == 0xff {
                    nr = (nr | 7) + 1;
                } else {
                    nr += 1;
                }
                continue;
            }
            return Some(nr);
        }
        None
    }

    /// Counts free bits under the shared lock, for consistency checks against
    /// the superblock counters.
    pub fn count_free(&self) -> u32 {
        let blocks = lock::read(&self.blocks);
        let mut free = 0;
        for nr in 0..self.nr_valid_bits {
            let (n, byte, mask) = locate(self, nr);
            if blocks.bufs[n][byte] & mask == 0 {
                free += 1;
            }
        }
        free
    }

    /// Writes dirty backing blocks back to the device and clears their dirty
    /// flags.
    pub fn flush<T: BlockStorage>(&self, dev: &mut T) -> Result<()> {
        let mut blocks = lock::write(&self.blocks);
        for n in 0..blocks.bufs.len() {
            if blocks.dirty[n] {
                dev.write_block(self.start_block as usize + n, &blocks.bufs[n])?;
                blocks.dirty[n] = false;
            }
        }
        Ok(())
    }
}
