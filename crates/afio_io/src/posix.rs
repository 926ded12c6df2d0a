use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    os::unix::{
        fs::{FileExt, OpenOptionsExt},
        io::{AsRawFd, IntoRawFd},
    },
    path::{Path, PathBuf},
};

use nix::errno::Errno;
use tracing::debug;

use crate::{Access, FileHandle, OpenMode};

/// Converts a `std::io::Error` into the errno it was built from.
fn errno(err: io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

/// [`FileHandle`] backed by a POSIX file descriptor.
#[derive(Debug)]
pub struct PosixFile {
    file: Option<File>,
    /// The path of the currently open file. Needed to re-open with different flags.
    path: PathBuf,
    mode: OpenMode,
    sync_mode: bool,
    direct_io: bool,
    direct_sync: bool,
    block_size: usize,
    alignment: usize,
    autosync_period: u64,
    unsynced_bytes: u64,
}

impl Default for PosixFile {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixFile {
    pub fn new() -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
            mode: OpenMode::new(Access::ReadOnly),
            sync_mode: false,
            direct_io: false,
            direct_sync: false,
            block_size: 0,
            alignment: 0,
            autosync_period: 0,
            unsynced_bytes: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_sync_mode(&self) -> bool {
        self.sync_mode
    }

    fn file(&self) -> Result<&File, Errno> {
        self.file.as_ref().ok_or(Errno::EBADF)
    }

    fn open_options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.mode.access.is_readable())
            .write(self.mode.access.is_writable())
            .append(self.mode.append);

        let mut custom_flags = 0;
        if self.sync_mode {
            custom_flags |= libc::O_SYNC;
        }
        #[cfg(target_os = "linux")]
        if self.direct_io {
            custom_flags |= libc::O_DIRECT;
            if self.direct_sync {
                custom_flags |= libc::O_DSYNC;
            }
        }
        opts.custom_flags(custom_flags);
        opts
    }

    /// Re-opens `self.path` with the flags implied by the current state, keeping the position.
    fn reopen(&mut self) -> Result<(), Errno> {
        let pos = self.position()?;
        let file = self.open_options().open(&self.path).map_err(errno)?;
        (&file).seek(SeekFrom::Start(pos)).map_err(errno)?;
        // Dropping the old `File` closes the old descriptor.
        self.file = Some(file);
        Ok(())
    }

    /// With direct I/O on, the buffer address, its length and the file offset must all be
    /// multiples of the alignment.
    fn check_alignment(&self, ptr: *const u8, len: usize, offset: u64) -> Result<(), Errno> {
        if !self.direct_io || self.alignment == 0 {
            return Ok(());
        }
        let align = self.alignment;
        if (ptr as usize) % align != 0 || len % align != 0 || offset % align as u64 != 0 {
            debug!(
                ptr = ptr as usize,
                len, offset, align, "unaligned transfer on a direct I/O file"
            );
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn wrote(&mut self, n: usize) -> usize {
        self.unsynced_bytes += n as u64;
        n
    }
}

impl FileHandle for PosixFile {
    fn create(&mut self, path: &Path) -> Result<(), Errno> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(drop)
            .map_err(errno)
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<(), Errno> {
        assert!(self.file.is_none(), "open called on a handle that is already open");
        self.path = path.to_path_buf();
        self.mode = mode;
        self.sync_mode = false;
        self.direct_io = false;
        self.direct_sync = false;
        self.autosync_period = 0;
        self.unsynced_bytes = 0;
        let file = self.open_options().open(path).map_err(errno)?;
        self.file = Some(file);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn close(&mut self) -> Result<(), Errno> {
        let file = self.file.take().ok_or(Errno::EBADF)?;
        // `File::drop` swallows close errors, so close the descriptor ourselves.
        let fd = file.into_raw_fd();
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }

    fn remove(&mut self, path: &Path) -> Result<(), Errno> {
        fs::remove_file(path).map_err(errno)
    }

    fn read_pos(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        self.check_alignment(buf.as_ptr(), buf.len(), offset)?;
        self.file()?.read_at(buf, offset).map_err(errno)
    }

    fn read_forward(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.check_alignment(buf.as_ptr(), buf.len(), 0)?;
        let mut file = self.file()?;
        file.read(buf).map_err(errno)
    }

    fn write_pos(&mut self, buf: &[u8], offset: u64) -> Result<usize, Errno> {
        self.check_alignment(buf.as_ptr(), buf.len(), offset)?;
        let n = self.file()?.write_at(buf, offset).map_err(errno)?;
        Ok(self.wrote(n))
    }

    fn write_forward(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        self.check_alignment(buf.as_ptr(), buf.len(), 0)?;
        let mut file = self.file()?;
        let n = file.write(buf).map_err(errno)?;
        Ok(self.wrote(n))
    }

    fn append(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        self.check_alignment(buf.as_ptr(), buf.len(), 0)?;
        let mut file = self.file()?;
        if !self.mode.append {
            file.seek(SeekFrom::End(0)).map_err(errno)?;
        }
        let n = file.write(buf).map_err(errno)?;
        Ok(self.wrote(n))
    }

    fn truncate(&mut self, len: u64) -> Result<(), Errno> {
        self.file()?.set_len(len).map_err(errno)
    }

    fn extend(&mut self, len: u64) -> Result<(), Errno> {
        if len < self.size()? {
            return Err(Errno::EINVAL);
        }
        self.file()?.set_len(len).map_err(errno)
    }

    #[cfg(target_os = "linux")]
    fn allocate(&mut self) -> Result<(), Errno> {
        let len = self.size()?;
        let fd = self.file()?.as_raw_fd();
        // `posix_fallocate` returns the error number rather than setting `errno`.
        match unsafe { libc::posix_fallocate(fd, 0, len as libc::off_t) } {
            0 => Ok(()),
            err => Err(Errno::from_raw(err)),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn allocate(&mut self) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn size(&self) -> Result<u64, Errno> {
        Ok(self.file()?.metadata().map_err(errno)?.len())
    }

    fn position(&mut self) -> Result<u64, Errno> {
        let mut file = self.file()?;
        file.stream_position().map_err(errno)
    }

    fn set_pos(&mut self, pos: u64) -> Result<(), Errno> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(pos)).map(drop).map_err(errno)
    }

    fn sync(&mut self) -> Result<(), Errno> {
        self.file()?.sync_all().map_err(errno)?;
        self.unsynced_bytes = 0;
        Ok(())
    }

    fn sync_on_write(&mut self) -> Result<(), Errno> {
        if self.autosync_period > 0 && self.unsynced_bytes >= self.autosync_period {
            self.sync()
        } else {
            Ok(())
        }
    }

    fn set_autosync(&mut self, bytes: u64) {
        self.autosync_period = bytes;
    }

    fn autosync(&self) -> u64 {
        self.autosync_period
    }

    fn set_block_size_and_alignment(&mut self, block_size: usize, alignment: usize) {
        assert!(alignment == 0 || alignment.is_power_of_two());
        self.block_size = block_size;
        self.alignment = alignment;
    }

    #[cfg(target_os = "linux")]
    fn set_direct_io(&mut self, direct_sync: bool) -> Result<(), Errno> {
        self.file()?;
        self.direct_io = true;
        self.direct_sync = direct_sync;
        if let Err(err) = self.reopen() {
            // The old descriptor is still in place, so the file stays usable without O_DIRECT.
            self.direct_io = false;
            self.direct_sync = false;
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_direct_io(&mut self, _direct_sync: bool) -> Result<(), Errno> {
        self.file()?;
        Err(Errno::ENOTSUP)
    }

    fn is_direct_io(&self) -> bool {
        self.direct_io
    }

    fn reopen_with_sync(&mut self, path: &Path) -> Result<(), Errno> {
        self.file()?;
        self.path = path.to_path_buf();
        self.sync_mode = true;
        if let Err(err) = self.reopen() {
            self.sync_mode = false;
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_rw(dir: &tempfile::TempDir, name: &str) -> (PosixFile, PathBuf) {
        let path = dir.path().join(name);
        let mut file = PosixFile::new();
        file.create(&path).unwrap();
        file.open(&path, OpenMode::new(Access::ReadWrite)).unwrap();
        (file, path)
    }

    #[test]
    fn test_create_reports_exists_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut file = PosixFile::new();
        file.create(&path).unwrap();
        assert_eq!(file.create(&path), Err(Errno::EEXIST));
        assert_eq!(
            file.create(&dir.path().join("missing").join("f")),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn test_positional_and_forward_io() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, _) = open_rw(&dir, "io");

        assert_eq!(file.write_pos(b"world", 6).unwrap(), 5);
        assert_eq!(file.write_forward(b"hello ").unwrap(), 6);
        assert_eq!(file.position().unwrap(), 6);
        assert_eq!(file.size().unwrap(), 11);

        let mut buf = [0u8; 11];
        assert_eq!(file.read_pos(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello world");

        assert_eq!(file.append(b"!").unwrap(), 1);
        file.set_pos(0).unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(file.read_forward(&mut buf).unwrap(), 12);
        assert_eq!(&buf, b"hello world!");
        file.close().unwrap();
    }

    #[test]
    fn test_extend_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, _) = open_rw(&dir, "extend");
        file.extend(8192).unwrap();
        assert_eq!(file.size().unwrap(), 8192);
        assert_eq!(file.extend(10), Err(Errno::EINVAL));
        file.truncate(0).unwrap();
        assert_eq!(file.size().unwrap(), 0);
    }

    #[test]
    fn test_autosync_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, _) = open_rw(&dir, "autosync");
        file.set_autosync(10);
        file.write_forward(&[1; 4]).unwrap();
        file.sync_on_write().unwrap();
        assert_eq!(file.unsynced_bytes, 4);
        file.write_forward(&[1; 6]).unwrap();
        file.sync_on_write().unwrap();
        assert_eq!(file.unsynced_bytes, 0);
        file.set_autosync(0);
        assert_eq!(file.autosync(), 0);
    }

    #[test]
    fn test_close_twice_is_ebadf() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, path) = open_rw(&dir, "close");
        file.close().unwrap();
        assert!(!file.is_open());
        assert_eq!(file.close(), Err(Errno::EBADF));
        file.remove(&path).unwrap();
        assert_eq!(file.remove(&path), Err(Errno::ENOENT));
    }

    #[test]
    fn test_reopen_with_sync_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, path) = open_rw(&dir, "sync");
        file.write_forward(b"abc").unwrap();
        file.reopen_with_sync(&path).unwrap();
        assert!(file.is_sync_mode());
        assert_eq!(file.position().unwrap(), 3);
        file.write_forward(b"def").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_unaligned_direct_io_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, _) = open_rw(&dir, "direct");
        file.set_block_size_and_alignment(32768, 4096);
        if file.set_direct_io(false).is_err() {
            // The filesystem under the temp dir does not support O_DIRECT.
            return;
        }
        assert!(file.is_direct_io());
        assert_eq!(file.write_pos(&[0u8; 100], 0), Err(Errno::EINVAL));
    }
}
