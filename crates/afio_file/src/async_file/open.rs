//! Opening a file: an ordered chain of steps, each selected by an [`OpenFlags`] bit.
//!
//! The first step that fails stops the chain, and the file is cleaned up: closed if it was
//! opened, and removed if this open created it.

use std::{fs, time::Instant};

use afio_aligned_bytes::AlignedBuffer;
use afio_io::FileHandle;
use tracing::{debug, warn};

use super::AsyncFile;
use crate::{
    error::{translate_errno, FsError, FsErrorKind},
    open_flags::OpenFlags,
    request::OpenParams,
};

/// Stream compression needs a POSIX-style file underneath. Elsewhere `GZ` is ignored.
const COMPRESSION_AVAILABLE: bool = cfg!(unix);

impl<H: FileHandle> AsyncFile<H> {
    /// Opens (and optionally creates, truncates, checks, initialises...) the file described by
    /// `params`.
    ///
    /// Returns the file size if `READ_SIZE` was requested. On error no file is open, and a file
    /// created by this call has been removed again.
    ///
    /// ## Panics
    /// - If the flags break an invariant (see [`OpenFlags::validate`]). Nothing has been touched
    ///   on disk at that point.
    /// - If a file is already open.
    /// - If `GZ` is combined with `READ_WRITE`.
    pub fn open(
        &mut self,
        params: &mut OpenParams,
        user_data: u64,
    ) -> Result<Option<u64>, FsError> {
        let flags = params.flags;
        if let Err(msg) = flags.validate() {
            panic!("invalid open flags {flags:?} for {:?}: {msg}", params.path);
        }
        assert!(
            !self.file.is_open(),
            "open of {:?} while {:?} is still open",
            params.path,
            self.path
        );
        self.path.clone_from(&params.path);
        self.open_flags = flags;

        let created = self.create_file(flags)?;
        let result = self.open_steps(params, user_data, created);
        if result.is_err() {
            self.cleanup_failed_open(created);
        }
        result
    }

    /// Returns `true` if this call created the file.
    fn create_file(&mut self, flags: OpenFlags) -> Result<bool, FsError> {
        if !flags.creates() {
            return Ok(false);
        }
        let mut result = self.file.create(&self.path);
        if let Err(errno) = result {
            if translate_errno(errno) == FsErrorKind::FileDoesNotExist {
                self.create_parent_dirs();
                result = self.file.create(&self.path);
            }
        }
        match result {
            Ok(()) => Ok(true),
            // Someone else got there first, which is what CREATE_IF_NONE is for.
            Err(errno)
                if flags.contains(OpenFlags::CREATE_IF_NONE)
                    && translate_errno(errno) == FsErrorKind::FileExists =>
            {
                Ok(false)
            }
            Err(errno) => Err(errno.into()),
        }
    }

    fn create_parent_dirs(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        match fs::create_dir_all(parent) {
            Ok(()) => debug!(dir = ?parent, "created missing directories"),
            // The retried create reports the failure.
            Err(err) => debug!(dir = ?parent, "failed to create directories: {err}"),
        }
    }

    fn open_steps(
        &mut self,
        params: &mut OpenParams,
        user_data: u64,
        created: bool,
    ) -> Result<Option<u64>, FsError> {
        let flags = params.flags;
        let mode = flags.open_mode().ok_or(FsError::InvalidParameters)?;
        self.file.open(&self.path, mode)?;

        if flags.contains(OpenFlags::TRUNCATE) && !created {
            self.file.truncate(0)?;
        }

        if flags.contains(OpenFlags::CHECK_SIZE) {
            let size = self.file.size()?;
            if size != params.file_size {
                debug!(
                    path = ?self.path,
                    expected = params.file_size,
                    actual = size,
                    "file size mismatch"
                );
                return Err(FsError::InvalidFileSize);
            }
        }

        if flags.contains(OpenFlags::INIT) {
            self.initialise(params, user_data)?;
        }

        let gz = flags.contains(OpenFlags::GZ) && COMPRESSION_AVAILABLE;
        if flags.contains(OpenFlags::DIRECT) && gz {
            // The codec does its I/O in unaligned, arbitrary-length pieces.
            warn!(
                path = ?self.path,
                "direct I/O is not supported on compressed files, continuing without"
            );
        } else if flags.contains(OpenFlags::DIRECT) {
            self.file.set_block_size_and_alignment(
                self.config.direct_block_size,
                self.config.direct_alignment,
            );
            if let Err(errno) = self
                .file
                .set_direct_io(flags.contains(OpenFlags::DIRECT_SYNC))
            {
                warn!(path = ?self.path, "failed to enable direct I/O, continuing without: {errno}");
            }
        }

        if flags.contains(OpenFlags::SYNC) {
            self.file.reopen_with_sync(&self.path)?;
        }

        let file_size = if flags.contains(OpenFlags::READ_SIZE) {
            Some(self.file.size()?)
        } else {
            None
        };

        if gz {
            let oflag = flags.posix_flags().ok_or(FsError::InvalidParameters)?;
            if let Err(errno) = self.compression.bind(oflag) {
                panic!(
                    "cannot open {:?} as a compressed stream with {flags:?}: {errno}",
                    self.path
                );
            }
            self.use_gz = true;
        }

        if flags.contains(OpenFlags::AUTOSYNC) {
            self.file.set_autosync(params.auto_sync_size);
        }

        Ok(file_size)
    }

    /// Fills the new file with pages from the requester's [`PageFiller`](crate::PageFiller),
    /// `init_pages` pages per write.
    ///
    /// Leaves the file synced, positioned at 0 and with auto-sync off.
    fn initialise(&mut self, params: &mut OpenParams, user_data: u64) -> Result<(), FsError> {
        let page_size = params.page_size as usize;
        let file_size = params.file_size;
        let has_filler = params.page_filler.is_some();
        let filler = match params.page_filler.as_mut() {
            Some(filler) if page_size > 0 => filler,
            _ => {
                debug!(
                    path = ?self.path,
                    page_size,
                    has_filler,
                    "INIT needs a page size and a page filler"
                );
                return Err(FsError::InvalidParameters);
            }
        };

        self.file.set_autosync(self.config.init_autosync_bytes);
        self.file.extend(file_size)?;
        let size = self.file.size()?;
        assert_eq!(
            size, file_size,
            "{:?} has the wrong size after being extended",
            self.path
        );
        if let Err(errno) = self.file.allocate() {
            debug!(path = ?self.path, "failed to preallocate, continuing: {errno}");
        }
        let position = self.file.position()?;
        assert_eq!(position, 0, "INIT must start at the beginning of the file");

        let chunk_capacity = self.config.init_pages as usize * page_size;
        if self
            .init_buffer
            .as_ref()
            .is_some_and(|buf| buf.capacity() < chunk_capacity)
        {
            self.init_buffer = None;
        }
        let align = self.config.buffer_alignment();
        let buffer = self
            .init_buffer
            .get_or_insert_with(|| AlignedBuffer::with_capacity(chunk_capacity, align));

        let start = Instant::now();
        let mut offset = 0;
        let mut index = 0u32;
        let mut writes = 0u64;
        while offset < file_size {
            buffer.clear();
            while buffer.len() + page_size <= chunk_capacity
                && offset + (buffer.len() as u64) < file_size
            {
                let page_start = buffer.len();
                buffer.set_len(page_start + page_size);
                filler.fill_page(user_data, index, &mut buffer.as_mut_slice()[page_start..]);
                index += 1;
            }

            let mut chunk = buffer.as_slice();
            while !chunk.is_empty() {
                let n = self.file.write_forward(chunk)?;
                assert_ne!(n, 0, "write during INIT of {:?} made no progress", self.path);
                if n != chunk.len() {
                    debug!(n, requested = chunk.len(), "partial write during INIT");
                }
                chunk = &chunk[n..];
                writes += 1;
            }
            self.file.sync_on_write()?;
            offset += buffer.len() as u64;
        }

        self.file.sync()?;
        debug!(
            path = ?self.path,
            bytes = file_size,
            pages = index,
            writes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "initialised file"
        );
        self.file.set_pos(0)?;
        self.file.set_autosync(0);
        Ok(())
    }

    fn cleanup_failed_open(&mut self, created: bool) {
        if self.file.is_open() {
            if let Err(errno) = self.file.close() {
                warn!(path = ?self.path, "failed to close after failed open: {errno}");
            }
        }
        self.reset_compression();
        if created {
            if let Err(errno) = self.file.remove(&self.path) {
                warn!(path = ?self.path, "failed to remove file after failed open: {errno}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AsyncFileConfig;

    fn async_file() -> AsyncFile {
        AsyncFile::new(AsyncFileConfig::default()).unwrap()
    }

    #[test]
    #[should_panic(expected = "DIRECT_SYNC requires DIRECT")]
    fn test_direct_sync_without_direct_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = OpenParams::new(
            dir.path().join("f"),
            OpenFlags::CREATE | OpenFlags::DIRECT_SYNC,
        );
        let _ = async_file().open(&mut params, 0);
    }

    #[test]
    fn test_create_on_existing_file_fails_but_create_if_none_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists");
        fs::write(&path, b"hello").unwrap();
        let mut file = async_file();

        let mut params = OpenParams::new(&path, OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
        let err = file.open(&mut params, 0).unwrap_err();
        assert_eq!(err.kind(), FsErrorKind::FileExists);
        assert!(!file.is_open());
        // The existing file was not created by the failed call, so it must survive.
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        let mut params = OpenParams::new(&path, OpenFlags::CREATE_IF_NONE | OpenFlags::READ_SIZE);
        assert_eq!(file.open(&mut params, 0), Ok(Some(5)));
        file.close().unwrap();
    }

    #[test]
    fn test_init_without_filler_removes_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init");
        let flags = OpenFlags::CREATE | OpenFlags::READ_WRITE | OpenFlags::INIT;
        let mut params = OpenParams::new(&path, flags)
            .file_size(4096)
            .page_size(4096);
        let mut file = async_file();
        assert_eq!(file.open(&mut params, 0), Err(FsError::InvalidParameters));
        assert!(!file.is_open());
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_access_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut params = OpenParams::new(&path, OpenFlags::CREATE | OpenFlags::READ_WRITE_MASK);
        let mut file = async_file();
        assert_eq!(file.open(&mut params, 0), Err(FsError::InvalidParameters));
        assert!(!path.exists());
    }

    #[test]
    #[should_panic(expected = "as a compressed stream")]
    fn test_gz_read_write_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = OpenParams::new(
            dir.path().join("f.zst"),
            OpenFlags::CREATE | OpenFlags::READ_WRITE | OpenFlags::GZ,
        );
        let _ = async_file().open(&mut params, 0);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = OpenParams::new(dir.path().join("missing"), OpenFlags::READ_ONLY);
        let err = async_file().open(&mut params, 0).unwrap_err();
        assert_eq!(err.kind(), FsErrorKind::FileDoesNotExist);
        assert_eq!(err.code(), libc::ENOENT as u32);
    }
}
