use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{FsError, Result};
use crate::fs::Filesystem;
use crate::io::BlockStorage;
use crate::lock;

/// Direct pointer slots in an inode.
pub const NDIR_BLOCKS: usize = 7;
/// Index of the single indirect slot.
pub const IND_BLOCK: usize = 7;
/// Total pointer slots.
pub const N_BLOCKS: usize = 8;

/// Inode number 0 is reserved and never handed out.
pub const BAD_INO: u32 = 0;

/// On-disk size of the serialized inode fields (the rest of the inode slot
/// is zero padding up to the geometry's inode size).
pub const INODE_RECORD_SIZE: usize = 76;

pub const S_IFMT: u16 = 0xf000;
pub const S_IFSOCK: u16 = 0xc000;
pub const S_IFLNK: u16 = 0xa000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

/// The on-disk inode record. Field order is part of the format; note that
/// gid precedes uid.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
pub(crate) struct RawInode {
    pub mode: U16<LittleEndian>,
    pub links_count: U16<LittleEndian>,
    pub size: U32<LittleEndian>,
    pub atime: U32<LittleEndian>,
    pub ctime: U32<LittleEndian>,
    pub mtime: U32<LittleEndian>,
    pub dtime: U32<LittleEndian>,
    pub gid: U32<LittleEndian>,
    pub uid: U32<LittleEndian>,
    pub blocks: U32<LittleEndian>,
    pub block: [U32<LittleEndian>; N_BLOCKS],
    pub file_acl: U32<LittleEndian>,
    pub dir_acl: U32<LittleEndian>,
}

impl RawInode {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self> {
        let lv: LayoutVerified<&[u8], RawInode> = LayoutVerified::new_unaligned_from_prefix(buf)
            .ok_or_else(|| FsError::Corruption("inode record truncated".to_string()))?
            .0;
        Ok(*lv)
    }
}

/// What an inode is, decoded once from the mode when the inode is loaded.
/// Directory operations require `Directory`; everything else goes through the
/// regular-file surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Unknown,
    Regular,
    Directory,
    CharDev,
    BlockDev,
    Fifo,
    Socket,
    Symlink,
}

impl NodeKind {
    pub fn from_mode(mode: u16) -> NodeKind {
        match mode & S_IFMT {
            S_IFREG => NodeKind::Regular,
            S_IFDIR => NodeKind::Directory,
            S_IFCHR => NodeKind::CharDev,
            S_IFBLK => NodeKind::BlockDev,
            S_IFIFO => NodeKind::Fifo,
            S_IFSOCK => NodeKind::Socket,
            S_IFLNK => NodeKind::Symlink,
            _ => NodeKind::Unknown,
        }
    }
}

/// In-memory copy of an inode record. Reads take the owning [`Inode`]'s
/// shared lock; any multi-step mutation (allocate-then-link) holds the
/// exclusive lock so the in-memory and on-disk copies cannot diverge under
/// concurrent readers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeState {
    pub mode: u16,
    pub links_count: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub uid: u32,
    pub gid: u32,
    /// Number of blocks held, indirect block included.
    pub blocks: u32,
    /// Pointer slots; 0 means not yet allocated. A nonzero slot 7 points at a
    /// block wholly filled with further pointers.
    pub block: [u32; N_BLOCKS],
}

impl NodeState {
    pub(crate) fn from_raw(raw: &RawInode) -> NodeState {
        let mut block = [0u32; N_BLOCKS];
        for (slot, raw_slot) in block.iter_mut().zip(raw.block.iter()) {
            *slot = raw_slot.get();
        }
        NodeState {
            mode: raw.mode.get(),
            links_count: raw.links_count.get(),
            size: raw.size.get(),
            atime: raw.atime.get(),
            ctime: raw.ctime.get(),
            mtime: raw.mtime.get(),
            dtime: raw.dtime.get(),
            uid: raw.uid.get(),
            gid: raw.gid.get(),
            blocks: raw.blocks.get(),
            block,
        }
    }

    pub(crate) fn to_raw(&self) -> RawInode {
        let mut block = [U32::new(0); N_BLOCKS];
        for (raw_slot, slot) in block.iter_mut().zip(self.block.iter()) {
            *raw_slot = U32::new(*slot);
        }
        RawInode {
            mode: U16::new(self.mode),
            links_count: U16::new(self.links_count),
            size: U32::new(self.size),
            atime: U32::new(self.atime),
            ctime: U32::new(self.ctime),
            mtime: U32::new(self.mtime),
            dtime: U32::new(self.dtime),
            gid: U32::new(self.gid),
            uid: U32::new(self.uid),
            blocks: U32::new(self.blocks),
            block,
            file_acl: U32::new(0),
            dir_acl: U32::new(0),
        }
    }

    /// An inode slot whose record was released: never handed back to callers.
    pub(crate) fn is_deleted(&self) -> bool {
        self.links_count == 0 && (self.mode == 0 || self.dtime != 0)
    }

    pub(crate) fn new_file(mode: u16, now: u32) -> NodeState {
        NodeState {
            mode,
            links_count: 1,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: 0,
            uid: 0,
            gid: 0,
            blocks: 0,
            block: [0; N_BLOCKS],
        }
    }
}

/// Shared handle to a loaded inode. One handle exists per inode number for
/// the lifetime of the mount, so every thread contends on the same lock.
pub struct Inode {
    ino: u32,
    kind: NodeKind,
    pub(crate) state: RwLock<NodeState>,
    /// Last directory block a lookup matched in; scans start here instead of
    /// at block 0.
    pub(crate) dir_hint: AtomicUsize,
    /// Serializes directory mutations against each other; lookups stay
    /// lock-free.
    pub(crate) dir_lock: Mutex<()>,
}

impl Inode {
    pub(crate) fn new(ino: u32, state: NodeState) -> Inode {
        Inode {
            ino,
            kind: NodeKind::from_mode(state.mode),
            state: RwLock::new(state),
            dir_hint: AtomicUsize::new(0),
            dir_lock: Mutex::new(()),
        }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// A consistent snapshot of the inode fields, taken under the shared lock.
    pub fn stat(&self) -> NodeState {
        *lock::read(&self.state)
    }
}

/// Seconds since the epoch, truncated to the on-disk 32-bit stamp.
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// A logical block index resolved into at most two array offsets: one into
/// the inode's direct slots, or the indirect slot followed by an offset into
/// the indirect block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockPath {
    pub offsets: [usize; 2],
    pub depth: usize,
    /// True when the logical index is the last one addressable at its level.
    pub boundary: bool,
}

/// Result of one attempt at walking a pointer chain.
enum Branch {
    /// Every pointer on the path was present; holds the final physical block.
    Complete(u32),
    /// The walk hit a zero pointer: nothing allocated from that depth on.
    Partial(PartialChain),
    /// A recorded pointer no longer matched its live value after blocking
    /// I/O; the whole walk must be retried from scratch.
    Changed,
}

struct PartialChain {
    /// Number of live pointers at the head of the path.
    have: usize,
    /// Snapshot of the pointers the walk observed, for re-verification under
    /// the exclusive lock before linking anything new.
    keys: [u32; 2],
}

impl<T: BlockStorage> Filesystem<T> {
    /// Maps a file-relative block index onto the inode pointer layout.
    ///
    /// Indices below the direct-slot count resolve to a single offset into
    /// the direct array; past that the path goes through the indirect slot
    /// and an offset within the indirect block. Anything beyond the indirect
    /// block's capacity is too large for this addressing scheme.
    pub fn block_to_path(&self, iblock: u32) -> Result<BlockPath> {
        let ptrs = self.geometry().addrs_per_block();
        if (iblock as usize) < NDIR_BLOCKS {
            return Ok(BlockPath {
                offsets: [iblock as usize, 0],
                depth: 1,
                boundary: iblock as usize == NDIR_BLOCKS - 1,
            });
        }
        let rest = iblock - NDIR_BLOCKS as u32;
        if rest < ptrs {
            return Ok(BlockPath {
                offsets: [IND_BLOCK, rest as usize],
                depth: 2,
                boundary: rest == ptrs - 1,
            });
        }
        Err(FsError::InvalidArgument(format!(
            "logical block {} exceeds the {} blocks this layout can address",
            iblock,
            NDIR_BLOCKS as u32 + ptrs
        )))
    }

    /// Walks the pointer path once, snapshotting each pointer it follows.
    ///
    /// The indirect block read happens without the inode lock held; the lock
    /// is re-acquired afterwards and the snapshot verified against the live
    /// array, so a truncate that raced the read is detected instead of
    /// silently dereferencing a recycled block.
    fn walk_branch(&self, inode: &Inode, path: &BlockPath) -> Result<Branch> {
        let key0 = lock::read(&inode.state).block[path.offsets[0]];
        if key0 == 0 {
            return Ok(Branch::Partial(PartialChain {
                have: 0,
                keys: [0, 0],
            }));
        }
        if path.depth == 1 {
            return Ok(Branch::Complete(key0));
        }

        // May block on device I/O; no lock held while it does.
        let buf = self.read_block_buf(key0 as usize)?;

        let st = lock::read(&inode.state);
        if st.block[path.offsets[0]] != key0 {
            debug!("pointer chain changed under inode {} during read", inode.ino());
            return Ok(Branch::Changed);
        }
        let at = path.offsets[1] * 4;
        let key1 = LittleEndian::read_u32(&buf[at..at + 4]);
        drop(st);

        if key1 == 0 {
            Ok(Branch::Partial(PartialChain {
                have: 1,
                keys: [key0, 0],
            }))
        } else {
            Ok(Branch::Complete(key1))
        }
    }

    /// Resolves a logical block of a file to its physical block number.
    ///
    /// Without `create`, a hole reports `None` and callers synthesize zeroes.
    /// With `create`, missing levels of the chain are allocated on demand.
    /// A chain that keeps changing under concurrent truncation is retried up
    /// to the mount's retry cap and then surfaces as [`FsError::Contention`].
    pub fn get_block(&self, inode: &Arc<Inode>, iblock: u32, create: bool) -> Result<Option<u32>> {
        let path = self.block_to_path(iblock)?;
        let mut retries = 0u32;
        loop {
            match self.walk_branch(inode, &path)? {
                Branch::Complete(key) => return Ok(Some(key)),
                Branch::Partial(partial) => {
                    if !create {
                        return Ok(None);
                    }
                    if let Some(key) = self.alloc_branch(inode, &path, partial)? {
                        return Ok(Some(key));
                    }
                }
                Branch::Changed => {}
            }
            retries += 1;
            if retries >= self.options().chain_retry_limit {
                warn!(
                    "giving up on the block chain of inode {} after {} retries",
                    inode.ino(),
                    retries
                );
                return Err(FsError::Contention);
            }
        }
    }

    /// Reads one logical block of a file, or `None` for a hole; callers
    /// synthesize zeroes for holes.
    pub fn read_file_block(&self, inode: &Arc<Inode>, iblock: u32) -> Result<Option<Vec<u8>>> {
        match self.get_block(inode, iblock, false)? {
            Some(blocknr) => Ok(Some(self.read_block_buf(blocknr as usize)?)),
            None => Ok(None),
        }
    }

    /// Fills the missing tail of a pointer chain with freshly claimed blocks.
    ///
    /// Claims happen against the data bitmap first; the new pointers are only
    /// linked in under the inode's exclusive lock after re-verifying the
    /// snapshot. On a verification miss every claimed block is returned to
    /// the bitmap and the caller retries the walk; `Ok(None)` signals that
    /// case.
    fn alloc_branch(
        &self,
        inode: &Arc<Inode>,
        path: &BlockPath,
        partial: PartialChain,
    ) -> Result<Option<u32>> {
        let missing = path.depth - partial.have;
        let goal = if partial.keys[0] != 0 {
            partial.keys[0] + 1 - self.geometry().data_start
        } else {
            0
        };

        let mut fresh: Vec<u32> = Vec::with_capacity(missing);
        for _ in 0..missing {
            match self.alloc_data_block(goal) {
                Ok(blocknr) => fresh.push(blocknr),
                Err(e) => {
                    self.release_blocks(&fresh);
                    return Err(e);
                }
            }
        }

        match (path.depth, partial.have) {
            (1, 0) => {
                let data = fresh[0];
                let mut st = lock::write(&inode.state);
                if st.block[path.offsets[0]] != 0 {
                    drop(st);
                    self.release_blocks(&fresh);
                    return Ok(None);
                }
                st.block[path.offsets[0]] = data;
                st.blocks += 1;
                self.write_inode_locked(inode.ino(), &st)?;
                Ok(Some(data))
            }
            (2, 0) => {
                let indirect = fresh[0];
                let data = fresh[1];
                // The fresh indirect block starts fully zeroed; the one child
                // pointer is spliced in before the block becomes reachable.
                let mut ibuf = vec![0u8; self.block_size()];
                let at = path.offsets[1] * 4;
                LittleEndian::write_u32(&mut ibuf[at..at + 4], data);
                if let Err(e) = self.write_block_buf(indirect as usize, &ibuf) {
                    self.release_blocks(&fresh);
                    return Err(e);
                }

                let mut st = lock::write(&inode.state);
                if st.block[IND_BLOCK] != 0 {
                    drop(st);
                    self.release_blocks(&fresh);
                    return Ok(None);
                }
                st.block[IND_BLOCK] = indirect;
                st.blocks += 2;
                self.write_inode_locked(inode.ino(), &st)?;
                Ok(Some(data))
            }
            (2, 1) => {
                let data = fresh[0];
                let indirect = partial.keys[0];
                let mut st = lock::write(&inode.state);
                if st.block[IND_BLOCK] != indirect {
                    drop(st);
                    self.release_blocks(&fresh);
                    return Ok(None);
                }
                // Re-read the indirect block under the lock: another writer
                // may have filled this slot between our walk and now.
                let mut ibuf = match self.read_block_buf(indirect as usize) {
                    Ok(buf) => buf,
                    Err(e) => {
                        drop(st);
                        self.release_blocks(&fresh);
                        return Err(e);
                    }
                };
                let at = path.offsets[1] * 4;
                if LittleEndian::read_u32(&ibuf[at..at + 4]) != 0 {
                    drop(st);
                    self.release_blocks(&fresh);
                    return Ok(None);
                }
                LittleEndian::write_u32(&mut ibuf[at..at + 4], data);
                if let Err(e) = self.write_block_buf(indirect as usize, &ibuf) {
                    drop(st);
                    self.release_blocks(&fresh);
                    return Err(e);
                }
                st.blocks += 1;
                self.write_inode_locked(inode.ino(), &st)?;
                Ok(Some(data))
            }
            _ => Err(FsError::InvalidArgument(
                "malformed block path".to_string(),
            )),
        }
    }

    fn release_blocks(&self, blocks: &[u32]) {
        for &blocknr in blocks {
            if let Err(e) = self.free_data_block(blocknr) {
                warn!("could not return block {} to the bitmap: {}", blocknr, e);
            }
        }
    }

    /// Loads an inode, returning the shared per-mount handle for it.
    ///
    /// Numbers outside the valid range are rejected up front; a record whose
    /// link count dropped to zero (and was stamped deleted) is reported as
    /// not found rather than resurrected.
    pub fn inode(&self, ino: u32) -> Result<Arc<Inode>> {
        let geo = self.geometry();
        if (ino != geo.root_inode && ino < geo.first_inode) || ino >= geo.inodes_count {
            return Err(FsError::InvalidArgument(format!(
                "bad inode number {}",
                ino
            )));
        }
        if let Some(existing) = self.cached_inode(ino) {
            return Ok(existing);
        }

        let (blocknr, offset) = geo.inode_byte_position(ino);
        let buf = self.read_block_buf(blocknr)?;
        let raw = RawInode::parse(&buf[offset..offset + INODE_RECORD_SIZE])?;
        let state = NodeState::from_raw(&raw);
        if state.is_deleted() {
            debug!("inode {} is deleted (links 0, dtime {})", ino, state.dtime);
            return Err(FsError::NotFound);
        }
        Ok(self.insert_inode(Inode::new(ino, state)))
    }

    /// Root directory handle.
    pub fn root(&self) -> Result<Arc<Inode>> {
        self.inode(self.geometry().root_inode)
    }

    /// Writes the in-memory inode record back into its table slot.
    pub fn write_inode(&self, inode: &Inode) -> Result<()> {
        let st = *lock::read(&inode.state);
        self.write_inode_locked(inode.ino(), &st)
    }

    /// Serialization helper shared by paths that already hold the inode lock.
    pub(crate) fn write_inode_locked(&self, ino: u32, st: &NodeState) -> Result<()> {
        let (blocknr, offset) = self.geometry().inode_byte_position(ino);
        self.update_block_region(blocknr, offset, st.to_raw().as_bytes())
    }

    /// Claims a fresh inode, initializes its record on disk, and returns the
    /// handle. The claim and the free-counter update are two separate
    /// critical sections.
    pub fn alloc_inode(&self, mode: u16) -> Result<Arc<Inode>> {
        let first = self.geometry().first_inode;
        let bit = match self.inode_map().find_next_zero(first, true) {
            Some(bit) => Some(bit),
            None => self.inode_map().find_next_zero(0, true),
        };
        let ino = bit.ok_or(FsError::NoSpace)?;
        self.note_inode_alloc();

        let st = NodeState::new_file(mode, unix_now());
        if let Err(e) = self.write_inode_locked(ino, &st) {
            let _ = self.inode_map().test_and_clear(ino);
            self.note_inode_free();
            return Err(e);
        }
        Ok(self.insert_inode(Inode::new(ino, st)))
    }

    /// Returns an inode number to the bitmap and bumps the free counter.
    pub fn free_inode(&self, ino: u32) -> Result<()> {
        if ino == self.geometry().root_inode {
            return Err(FsError::InvalidArgument(
                "refusing to free the root inode".to_string(),
            ));
        }
        if self.inode_map().test_and_clear(ino)? {
            self.note_inode_free();
        } else {
            warn!("freeing inode {} which was not allocated", ino);
        }
        self.evict_inode(ino);
        Ok(())
    }

    /// Drops every block a file holds: detaches the whole pointer array under
    /// the exclusive lock first, then frees the detached tree. Concurrent
    /// chain walks observe the change and retry against the now-empty file.
    pub fn truncate(&self, inode: &Arc<Inode>) -> Result<()> {
        let old = {
            let mut st = lock::write(&inode.state);
            let old = st.block;
            st.block = [0; N_BLOCKS];
            st.size = 0;
            st.blocks = 0;
            st.mtime = unix_now();
            self.write_inode_locked(inode.ino(), &st)?;
            old
        };

        for &blocknr in old.iter().take(NDIR_BLOCKS) {
            if blocknr != 0 {
                self.free_data_block(blocknr)?;
            }
        }
        if old[IND_BLOCK] != 0 {
            let buf = self.read_block_buf(old[IND_BLOCK] as usize)?;
            for slot in 0..self.geometry().addrs_per_block() as usize {
                let ptr = LittleEndian::read_u32(&buf[slot * 4..slot * 4 + 4]);
                if ptr != 0 {
                    self.free_data_block(ptr)?;
                }
            }
            self.free_data_block(old[IND_BLOCK])?;
        }
        Ok(())
    }
}
