/// The block number to access ranging from 0 (the first block) to n - 1 (the
/// last block) where n is the number of blocks available.
pub type BlockNumber = usize;

/// Fixed-size block storage as the engine expects it from the host: read a
/// block, write a block, flush what was written. Every call may block the
/// calling thread on device I/O.
///
/// The engine assumes nothing about the medium beyond this interface; tests
/// run against [`FileBlockEmulator`](crate::FileBlockEmulator).
pub trait BlockStorage {
    /// Size in bytes of one device block. Constant for the life of the
    /// device.
    fn block_size(&self) -> usize;

    /// Reads disk block number into the provided buffer. The buffer must hold
    /// at least one block.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;

    /// Writes the provided buffer into the specified block number. Writes
    /// beyond one block are truncated.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;

    /// Flush any buffered disk IO from memory. This guarantees prior writes
    /// actually reached the medium, for instance before re-reading them from
    /// a different handle.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
