use std::{
    path::{Path, PathBuf},
    thread::ThreadId,
};

use afio_aligned_bytes::AlignedBuffer;
use afio_io::{FileHandle, PosixFile};
use anyhow::Context;
use tracing::debug;

use crate::{
    coalescer::WriteCoalescer,
    compression::CompressionContext,
    config::AsyncFileConfig,
    error::FsError,
    open_flags::OpenFlags,
    request::{Action, Page, Request},
    stream::FileStream,
};

mod open;

/// Executes file requests, one at a time, against one file at a time.
///
/// An `AsyncFile` is long-lived: it is created once, and then opens, uses and closes many files
/// in turn, reusing its buffers. It is driven by exactly one worker thread at a time, which must
/// [`attach`](Self::attach) before executing requests and [`detach`](Self::detach) afterwards.
#[derive(Debug)]
pub struct AsyncFile<H: FileHandle = PosixFile> {
    file: H,
    path: PathBuf,
    open_flags: OpenFlags,

    compression: CompressionContext,
    /// `true` while the open file is accessed through `compression`.
    use_gz: bool,

    /// `None` if write coalescing is disabled.
    coalescer: Option<WriteCoalescer>,
    /// Staging buffer for `INIT`. Allocated by the first `INIT` open, then reused.
    init_buffer: Option<AlignedBuffer>,

    config: AsyncFileConfig,
    thread: Option<ThreadId>,
}

impl AsyncFile<PosixFile> {
    pub fn new(config: AsyncFileConfig) -> anyhow::Result<Self> {
        Self::with_handle(PosixFile::new(), config)
    }
}

impl<H: FileHandle> AsyncFile<H> {
    pub fn with_handle(file: H, config: AsyncFileConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid AsyncFileConfig")?;
        let compression =
            CompressionContext::new(config.compression_level, config.compression_buffer_size)?;
        let coalescer = (config.write_buffer_size > 0)
            .then(|| WriteCoalescer::new(config.write_buffer_size, config.buffer_alignment()));
        Ok(Self {
            file,
            path: PathBuf::new(),
            open_flags: OpenFlags::empty(),
            compression,
            use_gz: false,
            coalescer,
            init_buffer: None,
            config,
            thread: None,
        })
    }

    /// Binds this executor to the worker thread `thread`.
    ///
    /// ## Panics
    /// Panics if the executor is already attached to a thread.
    pub fn attach(&mut self, thread: ThreadId) {
        assert!(
            self.thread.is_none(),
            "AsyncFile {:?} attached to {thread:?} while still attached to {:?}",
            self.path,
            self.thread
        );
        self.thread = Some(thread);
    }

    /// ## Panics
    /// Panics unless the executor is currently attached to `thread`.
    pub fn detach(&mut self, thread: ThreadId) {
        assert_eq!(
            self.thread,
            Some(thread),
            "AsyncFile {:?} detached by a thread it is not attached to",
            self.path
        );
        self.thread = None;
    }

    pub fn attached_thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    pub fn is_compressed(&self) -> bool {
        self.use_gz
    }

    /// The flags the current (or last) file was opened with.
    pub fn open_flags(&self) -> OpenFlags {
        self.open_flags
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &AsyncFileConfig {
        &self.config
    }

    pub fn file(&self) -> &H {
        &self.file
    }

    /// Runs `request` to completion, storing its results and error on it.
    pub fn execute(&mut self, request: &mut Request) {
        let user_data = request.user_data;
        let result = match &mut request.action {
            Action::Open(params) => match self.open(params, user_data) {
                Ok(file_size) => {
                    request.file_size = file_size;
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Action::Read { pages, partial } => {
                self.read(pages, *partial, &mut request.bytes_read)
            }
            Action::Write { pages } => self.write(pages),
            Action::Append { buf } => self.append(buf.as_slice()),
            Action::Sync => self.sync(),
            Action::Close => self.close(),
        };
        if let Err(err) = result {
            debug!(
                action = request.action.name(),
                user_data,
                path = ?self.path,
                "request failed: {err}"
            );
        }
        request.error = result.err();
    }

    fn stream(&mut self) -> FileStream<'_, H> {
        let compression = self.use_gz.then_some(&mut self.compression);
        FileStream::new(&mut self.file, compression)
    }

    /// Reads each page in turn. `bytes_read` counts every byte placed in any page.
    pub fn read(
        &mut self,
        pages: &mut [Page],
        partial: bool,
        bytes_read: &mut u64,
    ) -> Result<(), FsError> {
        let mut stream = self.stream();
        for page in pages.iter_mut() {
            stream.read_page(page.buf.as_mut_slice(), page.offset, partial, bytes_read)?;
        }
        Ok(())
    }

    /// Writes each page at its offset.
    ///
    /// With coalescing enabled, a request of several pages must have contiguous offsets.
    /// The pages are then copied into the staging buffer and written in as few calls as the
    /// buffer's capacity allows.
    pub fn write(&mut self, pages: &[Page]) -> Result<(), FsError> {
        let chunk_size = self.config.write_chunk_size;
        let compression = self.use_gz.then_some(&mut self.compression);
        let mut stream = FileStream::new(&mut self.file, compression);

        match &mut self.coalescer {
            Some(coalescer) if pages.len() > 1 => {
                // Check everything up front, so that a bad request writes nothing at all.
                WriteCoalescer::check_contiguous(pages)?;
                for run in coalescer.runs(pages) {
                    let run = &pages[run];
                    if let [page] = run {
                        stream.write_page(page.buf.as_slice(), page.offset, chunk_size)?;
                    } else {
                        let staged = coalescer.stage(run);
                        stream.write_page(staged, run[0].offset, chunk_size)?;
                    }
                }
            }
            _ => {
                for page in pages {
                    stream.write_page(page.buf.as_slice(), page.offset, chunk_size)?;
                }
            }
        }
        stream.sync_on_write()
    }

    pub fn append(&mut self, buf: &[u8]) -> Result<(), FsError> {
        let mut stream = self.stream();
        stream.append_all(buf)?;
        stream.sync_on_write()
    }

    pub fn sync(&mut self) -> Result<(), FsError> {
        self.stream().sync()
    }

    /// Syncs (if the file is writable) and closes the file.
    ///
    /// The compression context goes back to its unbound state whatever happens.
    /// If both the sync and the close fail, the close error is reported.
    ///
    /// ## Panics
    /// Panics if no file is open.
    pub fn close(&mut self) -> Result<(), FsError> {
        assert!(
            self.file.is_open(),
            "close on already closed file {:?}",
            self.path
        );
        let synced = if self.open_flags.is_writable() {
            self.sync()
        } else {
            Ok(())
        };
        let closed = self.stream().close();
        self.reset_compression();
        closed.and(synced)
    }

    fn reset_compression(&mut self) {
        if self.use_gz || self.compression.mode().is_some() {
            self.compression.reset();
        }
        self.use_gz = false;
    }
}
