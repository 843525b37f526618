use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};

use crate::error::{FsError, Result};
use crate::fs::Filesystem;
use crate::io::BlockStorage;
use crate::lock;
use crate::node::{unix_now, Inode, NodeKind};

/// Longest permitted entry name.
pub const NAME_MAX: usize = 255;

/// Fixed bytes ahead of the name in every entry: inode (4), record length
/// (2), name length (1), file type (1).
const ENTRY_HEADER_SIZE: usize = 8;

/// Entries are padded so each record starts on a 4-byte boundary.
const ENTRY_PAD: usize = 4;

/// Byte span a record with `name_len` name bytes needs.
fn rec_len_for(name_len: usize) -> usize {
    (ENTRY_HEADER_SIZE + name_len + ENTRY_PAD - 1) & !(ENTRY_PAD - 1)
}

/// On-disk file-type tag carried by every directory entry, so iteration can
/// report a type without dereferencing the target inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    CharDev = 3,
    BlockDev = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl DirEntryType {
    pub fn from_kind(kind: NodeKind) -> DirEntryType {
        match kind {
            NodeKind::Regular => DirEntryType::Regular,
            NodeKind::Directory => DirEntryType::Directory,
            NodeKind::CharDev => DirEntryType::CharDev,
            NodeKind::BlockDev => DirEntryType::BlockDev,
            NodeKind::Fifo => DirEntryType::Fifo,
            NodeKind::Socket => DirEntryType::Socket,
            NodeKind::Symlink => DirEntryType::Symlink,
            NodeKind::Unknown => DirEntryType::Unknown,
        }
    }

    fn from_tag(tag: u8) -> DirEntryType {
        match tag {
            1 => DirEntryType::Regular,
            2 => DirEntryType::Directory,
            3 => DirEntryType::CharDev,
            4 => DirEntryType::BlockDev,
            5 => DirEntryType::Fifo,
            6 => DirEntryType::Socket,
            7 => DirEntryType::Symlink,
            _ => DirEntryType::Unknown,
        }
    }
}

/// One live entry as reported by [`Filesystem::read_dir`].
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub ino: u32,
    pub file_type: DirEntryType,
    pub name: Vec<u8>,
}

/// Where a lookup found its entry: the directory-relative block index and
/// the byte offset of the record inside that block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirEntryLocation {
    pub ino: u32,
    pub block: u32,
    pub offset: usize,
}

/// A decoded record header; the name is addressed separately through the
/// containing buffer so all access stays bounds checked.
#[derive(Debug, Clone, Copy)]
struct EntryHead {
    offset: usize,
    ino: u32,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
}

impl EntryHead {
    fn name_range(&self) -> std::ops::Range<usize> {
        self.offset + ENTRY_HEADER_SIZE..self.offset + ENTRY_HEADER_SIZE + self.name_len
    }

    /// The space this record actually needs for its current name.
    fn tight_len(&self) -> usize {
        rec_len_for(self.name_len)
    }
}

/// Decodes the record starting at `offset`, validating that it tiles the
/// block correctly: nonzero length, 4-byte aligned, room for its own name,
/// and no overrun of the block. A violation is corruption, not a skippable
/// oddity.
fn entry_at(buf: &[u8], offset: usize) -> Result<EntryHead> {
    if offset + ENTRY_HEADER_SIZE > buf.len() {
        error!("directory entry header overruns its block at offset {}", offset);
        return Err(FsError::Corruption(
            "directory entry overruns block".to_string(),
        ));
    }
    let ino = LittleEndian::read_u32(&buf[offset..offset + 4]);
    let rec_len = LittleEndian::read_u16(&buf[offset + 4..offset + 6]) as usize;
    let name_len = buf[offset + 6] as usize;
    let file_type = buf[offset + 7];

    if rec_len == 0 {
        error!("zero-length directory entry at offset {}", offset);
        return Err(FsError::Corruption(
            "zero-length directory entry".to_string(),
        ));
    }
    if rec_len % ENTRY_PAD != 0
        || rec_len < rec_len_for(name_len)
        || offset + rec_len > buf.len()
    {
        error!(
            "malformed directory entry at offset {}: rec_len {}, name_len {}",
            offset, rec_len, name_len
        );
        return Err(FsError::Corruption(
            "malformed directory entry".to_string(),
        ));
    }
    Ok(EntryHead {
        offset,
        ino,
        rec_len,
        name_len,
        file_type,
    })
}

/// Writes a record header (and name) in place.
fn put_entry(buf: &mut [u8], offset: usize, ino: u32, rec_len: usize, name: &[u8], tag: u8) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], ino);
    LittleEndian::write_u16(&mut buf[offset + 4..offset + 6], rec_len as u16);
    buf[offset + 6] = name.len() as u8;
    buf[offset + 7] = tag;
    buf[offset + ENTRY_HEADER_SIZE..offset + ENTRY_HEADER_SIZE + name.len()]
        .copy_from_slice(name);
}

fn check_dir(dir: &Inode) -> Result<()> {
    if dir.kind() != NodeKind::Directory {
        return Err(FsError::InvalidArgument(format!(
            "inode {} is not a directory",
            dir.ino()
        )));
    }
    Ok(())
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidArgument(format!(
            "bad entry name length {}",
            name.len()
        )));
    }
    Ok(())
}

impl<T: BlockStorage> Filesystem<T> {
    fn dir_blocks(&self, dir: &Inode) -> u32 {
        let size = lock::read(&dir.state).size;
        let bs = self.block_size() as u32;
        (size + bs - 1) / bs
    }

    fn read_dir_block(&self, dir: &Arc<Inode>, index: u32) -> Result<(u32, Vec<u8>)> {
        let blocknr = self.get_block(dir, index, false)?.ok_or_else(|| {
            error!("directory {} has a hole at block {}", dir.ino(), index);
            FsError::Corruption("hole in directory".to_string())
        })?;
        let buf = self.read_block_buf(blocknr as usize)?;
        Ok((blocknr, buf))
    }

    /// Finds a live entry by name.
    ///
    /// The scan starts at the directory's cached hint block (the block the
    /// previous lookup matched in), wraps to block 0, and stops once the hint
    /// block comes around again. A freed slot with leftover name bytes never
    /// matches.
    pub fn find_entry(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<Option<DirEntryLocation>> {
        check_dir(dir)?;
        check_name(name)?;
        let nblocks = self.dir_blocks(dir);
        if nblocks == 0 {
            return Ok(None);
        }

        let start = (dir.dir_hint.load(Ordering::Relaxed) as u32).min(nblocks - 1);
        let mut n = start;
        loop {
            let (_, buf) = self.read_dir_block(dir, n)?;
            let mut offset = 0;
            while offset < buf.len() {
                let head = entry_at(&buf, offset)?;
                if head.ino != 0
                    && head.name_len == name.len()
                    && &buf[head.name_range()] == name
                {
                    dir.dir_hint.store(n as usize, Ordering::Relaxed);
                    return Ok(Some(DirEntryLocation {
                        ino: head.ino,
                        block: n,
                        offset,
                    }));
                }
                offset += head.rec_len;
            }
            n = (n + 1) % nblocks;
            if n == start {
                break;
            }
        }
        Ok(None)
    }

    /// Inserts a `name -> ino` entry into the directory.
    ///
    /// Each slot in each block is evaluated as a candidate: a free slot with
    /// enough room is reused in place, and a live entry with slack beyond its
    /// tight size is split in two. Only when every block is packed does the
    /// directory grow by one freshly allocated block holding a single entry
    /// that spans it. A pre-existing live entry with the same name rejects
    /// the insert.
    pub fn add_link(
        &self,
        dir: &Arc<Inode>,
        name: &[u8],
        ino: u32,
        file_type: DirEntryType,
    ) -> Result<()> {
        check_dir(dir)?;
        check_name(name)?;
        let needed = rec_len_for(name.len());
        let tag = file_type as u8;

        let _guard = lock::hold(&dir.dir_lock);
        let nblocks = self.dir_blocks(dir);

        for n in 0..nblocks {
            let (blocknr, mut buf) = self.read_dir_block(dir, n)?;
            let mut offset = 0;
            while offset < buf.len() {
                let head = entry_at(&buf, offset)?;
                if head.ino != 0 && head.name_len == name.len() && &buf[head.name_range()] == name
                {
                    return Err(FsError::AlreadyExists);
                }
                if head.ino == 0 && head.rec_len >= needed {
                    // Reuse the freed slot, keeping its span so the block
                    // still tiles exactly.
                    put_entry(&mut buf, offset, ino, head.rec_len, name, tag);
                    return self.commit_dir_block(dir, blocknr, &buf);
                }
                if head.ino != 0 && head.rec_len >= head.tight_len() + needed {
                    // Split: the head keeps its tight span, the tail becomes
                    // the new entry.
                    let tail_offset = offset + head.tight_len();
                    let tail_len = head.rec_len - head.tight_len();
                    LittleEndian::write_u16(
                        &mut buf[offset + 4..offset + 6],
                        head.tight_len() as u16,
                    );
                    put_entry(&mut buf, tail_offset, ino, tail_len, name, tag);
                    return self.commit_dir_block(dir, blocknr, &buf);
                }
                offset += head.rec_len;
            }
        }

        // Every block is packed: append a new one spanning a single entry.
        debug!(
            "growing directory {} to {} block(s) for entry insertion",
            dir.ino(),
            nblocks + 1
        );
        let blocknr = match self.get_block(dir, nblocks, true)? {
            Some(blocknr) => blocknr,
            None => return Err(FsError::NoSpace),
        };
        let bs = self.block_size();
        let mut buf = vec![0u8; bs];
        put_entry(&mut buf, 0, ino, bs, name, tag);
        self.commit_dir_block(dir, blocknr, &buf)?;

        let mut st = lock::write(&dir.state);
        st.size += bs as u32;
        st.mtime = unix_now();
        self.write_inode_locked(dir.ino(), &st)?;
        Ok(())
    }

    /// Marks the named entry free in place: its span is retained as reusable
    /// capacity and the entry count of the block is unchanged.
    pub fn remove_link(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<DirEntryLocation> {
        check_dir(dir)?;
        check_name(name)?;

        let _guard = lock::hold(&dir.dir_lock);
        let location = self.find_entry(dir, name)?.ok_or(FsError::NotFound)?;
        let (blocknr, mut buf) = self.read_dir_block(dir, location.block)?;
        // Freeing is zeroing the inode field; the name bytes stay behind and
        // are ignored by every scan.
        LittleEndian::write_u32(&mut buf[location.offset..location.offset + 4], 0);
        self.commit_dir_block(dir, blocknr, &buf)?;

        let mut st = lock::write(&dir.state);
        st.mtime = unix_now();
        self.write_inode_locked(dir.ino(), &st)?;
        Ok(location)
    }

    /// Lists the live entries of a directory in block order.
    pub fn read_dir(&self, dir: &Arc<Inode>) -> Result<Vec<DirEntry>> {
        check_dir(dir)?;
        let nblocks = self.dir_blocks(dir);
        let mut entries = Vec::new();
        for n in 0..nblocks {
            let (_, buf) = self.read_dir_block(dir, n)?;
            let mut offset = 0;
            while offset < buf.len() {
                let head = entry_at(&buf, offset)?;
                if head.ino != 0 {
                    entries.push(DirEntry {
                        ino: head.ino,
                        file_type: DirEntryType::from_tag(head.file_type),
                        name: buf[head.name_range()].to_vec(),
                    });
                }
                offset += head.rec_len;
            }
        }
        Ok(entries)
    }

    /// Allocates a fresh inode of the given mode and links it into the
    /// directory under `name`.
    pub fn create(&self, dir: &Arc<Inode>, name: &[u8], mode: u16) -> Result<Arc<Inode>> {
        check_dir(dir)?;
        check_name(name)?;

        let inode = self.alloc_inode(mode)?;
        let tag = DirEntryType::from_kind(inode.kind());
        if let Err(e) = self.add_link(dir, name, inode.ino(), tag) {
            // Unreachable entry; give the inode straight back.
            let _ = self.free_inode(inode.ino());
            return Err(e);
        }
        Ok(inode)
    }

    /// Removes the named entry and drops one link from its inode, releasing
    /// the inode and every block it held once the last link goes away.
    pub fn unlink(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<()> {
        let location = self.remove_link(dir, name)?;
        let inode = self.inode(location.ino)?;

        let last_link = {
            let mut st = lock::write(&inode.state);
            st.links_count = st.links_count.saturating_sub(1);
            st.ctime = unix_now();
            if st.links_count == 0 {
                st.dtime = unix_now();
            }
            self.write_inode_locked(inode.ino(), &st)?;
            st.links_count == 0
        };

        if last_link {
            self.truncate(&inode)?;
            self.free_inode(inode.ino())?;
        }
        Ok(())
    }

    /// Writes a directory block back, forcing it to the medium when the
    /// mount asks for synchronous directory updates.
    fn commit_dir_block(&self, dir: &Arc<Inode>, blocknr: u32, buf: &[u8]) -> Result<()> {
        self.write_block_buf(blocknr as usize, buf)?;
        if self.options().sync_dirs {
            debug!("synchronous directory update for inode {}", dir.ino());
            self.sync_device()?;
        }
        Ok(())
    }
}
