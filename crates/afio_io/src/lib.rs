//! The blocking file-handle capability that the file executor is written against.
//!
//! Every method reports failure as the raw OS [`Errno`]. Translating that into something the
//! rest of the engine understands is the executor's job, not the handle's.

use std::path::Path;

pub use nix::errno::Errno;

mod posix;

pub use posix::PosixFile;

/// Which of read / write the file is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn is_readable(&self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

/// How [`FileHandle::open`] opens an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub access: Access,
    /// Every write lands at the end of the file, whatever offset was asked for.
    pub append: bool,
}

impl OpenMode {
    pub const fn new(access: Access) -> Self {
        Self {
            access,
            append: false,
        }
    }

    pub const fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// A thread-affine, blocking handle to (at most) one open file.
///
/// The handle object outlives the files it opens: `open` / `close` can be called repeatedly on
/// the same handle. Reads and writes may transfer fewer bytes than requested; callers must loop.
pub trait FileHandle {
    /// Creates a new, empty file. Fails with `EEXIST` if `path` already exists and with `ENOENT`
    /// if its directory is missing. Does not leave the file open.
    fn create(&mut self, path: &Path) -> Result<(), Errno>;

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<(), Errno>;

    fn is_open(&self) -> bool;

    fn close(&mut self) -> Result<(), Errno>;

    fn remove(&mut self, path: &Path) -> Result<(), Errno>;

    /// Reads from `offset` without moving the file position.
    fn read_pos(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Errno>;

    /// Reads from the current file position and advances it.
    fn read_forward(&mut self, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Writes at `offset` without moving the file position.
    fn write_pos(&mut self, buf: &[u8], offset: u64) -> Result<usize, Errno>;

    /// Writes at the current file position and advances it.
    fn write_forward(&mut self, buf: &[u8]) -> Result<usize, Errno>;

    /// Writes at the end of the file.
    fn append(&mut self, buf: &[u8]) -> Result<usize, Errno>;

    fn truncate(&mut self, len: u64) -> Result<(), Errno>;

    /// Grows the file to `len` bytes without writing any content. `len` must not be smaller than
    /// the current size.
    fn extend(&mut self, len: u64) -> Result<(), Errno>;

    /// Asks the OS to reserve disk blocks for the whole current extent of the file.
    fn allocate(&mut self) -> Result<(), Errno>;

    fn size(&self) -> Result<u64, Errno>;

    fn position(&mut self) -> Result<u64, Errno>;

    fn set_pos(&mut self, pos: u64) -> Result<(), Errno>;

    fn sync(&mut self) -> Result<(), Errno>;

    /// Syncs if the auto-sync threshold has been reached since the last sync.
    fn sync_on_write(&mut self) -> Result<(), Errno>;

    /// Sets the auto-sync threshold in bytes. Zero disables auto-sync.
    fn set_autosync(&mut self, bytes: u64);

    fn autosync(&self) -> u64;

    fn set_block_size_and_alignment(&mut self, block_size: usize, alignment: usize);

    /// Bypasses the page cache. With `direct_sync`, writes are also synchronous.
    fn set_direct_io(&mut self, direct_sync: bool) -> Result<(), Errno>;

    fn is_direct_io(&self) -> bool;

    /// Re-opens the file at `path` in OS-synchronous (`O_SYNC`) mode, keeping the access mode.
    fn reopen_with_sync(&mut self, path: &Path) -> Result<(), Errno>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access() {
        assert!(Access::ReadOnly.is_readable());
        assert!(!Access::ReadOnly.is_writable());
        assert!(Access::WriteOnly.is_writable());
        assert!(!Access::WriteOnly.is_readable());
        assert!(Access::ReadWrite.is_readable() && Access::ReadWrite.is_writable());
        assert!(OpenMode::new(Access::WriteOnly).append(true).append);
    }
}
