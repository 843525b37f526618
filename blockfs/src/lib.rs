//! Storage engine of a small block-addressed filesystem: free-space
//! accounting over block-backed bitmaps, logical-to-physical block
//! translation through per-inode pointer chains (7 direct slots plus one
//! indirect block), and variable-length directory entries packed into
//! fixed-size blocks.
//!
//! The host supplies block storage through [`BlockStorage`] and gets back a
//! mounted [`Filesystem`]. Everything in between — bitmap claims, chain
//! walks that survive concurrent truncation, directory-entry splitting —
//! lives here.

mod alloc;
mod dir;
mod error;
mod fs;
mod io;
mod node;
mod sb;

pub use crate::alloc::Bitmap;
pub use crate::dir::{DirEntry, DirEntryLocation, DirEntryType};
pub use crate::error::{FsError, Result};
pub use crate::fs::{Filesystem, FormatOptions, MountOptions};
pub use crate::io::{BlockNumber, BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
pub use crate::node::{BlockPath, Inode, NodeKind, NodeState};
pub use crate::sb::{Geometry, SB_MAGIC};

/// Lock acquisition that shrugs off poisoning: a panicked writer elsewhere
/// must not wedge the whole mount, the guarded state is still structurally
/// valid block data.
pub(crate) mod lock {
    use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

    pub fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
        l.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
        l.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hold<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
