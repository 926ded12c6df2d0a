use std::{fmt, path::PathBuf};

use afio_aligned_bytes::AlignedBuffer;

use crate::{error::FsError, open_flags::OpenFlags};

/// Supplies page contents while a file is initialised with [`OpenFlags::INIT`].
///
/// Called synchronously, once per page, with page indices counting up from zero.
pub trait PageFiller: Send {
    fn fill_page(&mut self, user_data: u64, index: u32, page: &mut [u8]);
}

impl<F> PageFiller for F
where
    F: FnMut(u64, u32, &mut [u8]) + Send,
{
    fn fill_page(&mut self, user_data: u64, index: u32, page: &mut [u8]) {
        self(user_data, index, page)
    }
}

/// Parameters of an [`Action::Open`].
pub struct OpenParams {
    pub path: PathBuf,
    pub flags: OpenFlags,
    /// The expected size for `CHECK_SIZE`, or the size to initialise to for `INIT`.
    pub file_size: u64,
    pub page_size: u32,
    pub auto_sync_size: u64,
    pub page_filler: Option<Box<dyn PageFiller>>,
}

impl OpenParams {
    pub fn new(path: impl Into<PathBuf>, flags: OpenFlags) -> Self {
        Self {
            path: path.into(),
            flags,
            file_size: 0,
            page_size: 0,
            auto_sync_size: 0,
            page_filler: None,
        }
    }

    pub fn file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn auto_sync_size(mut self, auto_sync_size: u64) -> Self {
        self.auto_sync_size = auto_sync_size;
        self
    }

    pub fn page_filler(mut self, page_filler: impl PageFiller + 'static) -> Self {
        self.page_filler = Some(Box::new(page_filler));
        self
    }
}

impl fmt::Debug for OpenParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenParams")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("file_size", &self.file_size)
            .field("page_size", &self.page_size)
            .field("auto_sync_size", &self.auto_sync_size)
            .field("page_filler", &self.page_filler.is_some())
            .finish()
    }
}

/// One contiguous region of a read or write. For reads, `buf.len()` bytes are read.
#[derive(Debug)]
pub struct Page {
    pub buf: AlignedBuffer,
    pub offset: u64,
}

impl Page {
    pub fn new(buf: AlignedBuffer, offset: u64) -> Self {
        Self { buf, offset }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The offset just past the end of this page.
    pub fn end(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }
}

#[derive(Debug)]
pub enum Action {
    Open(OpenParams),
    /// With `partial`, reaching end of file early is not an error.
    Read {
        pages: Vec<Page>,
        partial: bool,
    },
    Write {
        pages: Vec<Page>,
    },
    Append {
        buf: AlignedBuffer,
    },
    Sync,
    Close,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Open(_) => "open",
            Action::Read { partial: false, .. } => "read",
            Action::Read { partial: true, .. } => "readPartial",
            Action::Write { .. } => "write",
            Action::Append { .. } => "append",
            Action::Sync => "sync",
            Action::Close => "close",
        }
    }
}

/// One file operation: built by the caller, executed once by an
/// [`AsyncFile`](crate::AsyncFile), and handed back with its results filled in.
#[derive(Debug)]
pub struct Request {
    pub action: Action,
    /// Opaque to the executor. Passed to the page filler during `INIT`.
    pub user_data: u64,
    pub error: Option<FsError>,
    /// Set by `Open`. `None` means the size is unknown (`READ_SIZE` was not requested).
    pub file_size: Option<u64>,
    /// Set by `Read`: the total number of bytes placed into the pages.
    pub bytes_read: u64,
}

impl Request {
    pub fn new(action: Action, user_data: u64) -> Self {
        Self {
            action,
            user_data,
            error: None,
            file_size: None,
            bytes_read: 0,
        }
    }

    pub fn open(params: OpenParams, user_data: u64) -> Self {
        Self::new(Action::Open(params), user_data)
    }

    pub fn read(pages: Vec<Page>, user_data: u64) -> Self {
        Self::new(
            Action::Read {
                pages,
                partial: false,
            },
            user_data,
        )
    }

    pub fn read_partial(pages: Vec<Page>, user_data: u64) -> Self {
        Self::new(
            Action::Read {
                pages,
                partial: true,
            },
            user_data,
        )
    }

    pub fn write(pages: Vec<Page>, user_data: u64) -> Self {
        Self::new(Action::Write { pages }, user_data)
    }

    pub fn append(buf: AlignedBuffer, user_data: u64) -> Self {
        Self::new(Action::Append { buf }, user_data)
    }

    pub fn sync(user_data: u64) -> Self {
        Self::new(Action::Sync, user_data)
    }

    pub fn close(user_data: u64) -> Self {
        Self::new(Action::Close, user_data)
    }

    pub fn result(&self) -> Result<(), FsError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The error as a wire code. `0` is success.
    pub fn error_code(&self) -> u32 {
        self.error.map_or(0, |err| err.code())
    }

    /// The file size as the (high, low) 32-bit words sent back to the opener.
    /// An unknown size is sent as all ones.
    pub fn file_size_words(&self) -> (u32, u32) {
        match self.file_size {
            Some(size) => ((size >> 32) as u32, (size & 0xFFFF_FFFF) as u32),
            None => (u32::MAX, u32::MAX),
        }
    }

    /// Hands back the page buffers of a read or write.
    pub fn into_pages(self) -> Vec<Page> {
        match self.action {
            Action::Read { pages, .. } | Action::Write { pages } => pages,
            _ => Vec::new(),
        }
    }
}
