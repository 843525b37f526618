use crate::io::block::{BlockNumber, BlockStorage};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};

/// Emulates block disk/flash storage in userspace using a file as block
/// storage. This is only meant to be used for file system development and
/// testing.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
    /// Size of one block in bytes.
    block_size: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr > (self.block_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() < self.block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * self.block_size) as u64))?;

        let fd = &mut self.fd;
        // Limit the read to just the block specified.
        let mut fixed_reader = fd.take(self.block_size as u64);
        fixed_reader.read_exact(&mut buf[0..self.block_size])?;
        Ok(())
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        self.fd
            .seek(SeekFrom::Start((blocknr * self.block_size) as u64))?;

        let max = if self.block_size < buf.len() {
            self.block_size
        } else {
            buf.len()
        };
        self.fd.write_all(&buf[0..max])?;
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    block_size: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded down
            // to the nearest block.
            block_count: 0,
            block_size: 1024,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Sets the size in bytes of a single block. Must be a power of two.
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Controls whether the backing file is zeroed out on build. Pass false to
    /// reopen an already initialized disk image.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transferred to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        debug_assert!(self.block_count > 0);
        debug_assert!(self.block_size.is_power_of_two());
        if self.clear_medium {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
            block_size: self.block_size,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        let mut bfd = BufWriter::new(&self.fd);
        bfd.seek(SeekFrom::Start(0))?;
        // Zero out the "disk" block, buffering each write to prevent excessive
        // syscalls.
        for _ in 0..self.block_count {
            bfd.write_all(vec![0x00; self.block_size].as_slice())?;
        }
        bfd.flush()?;
        Ok(())
    }
}
