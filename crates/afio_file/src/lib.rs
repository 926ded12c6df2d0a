#![doc = include_str!("../README.md")]

mod async_file;
mod coalescer;
mod compression;
mod config;
mod error;
mod io_thread;
mod open_flags;
mod request;
mod stream;

pub use afio_aligned_bytes::AlignedBuffer;
pub use afio_io::{Access, Errno, FileHandle, OpenMode, PosixFile};

pub use async_file::AsyncFile;
pub use config::AsyncFileConfig;
pub use error::{code, translate_errno, FsError, FsErrorKind};
pub use io_thread::{IoThread, Job};
pub use open_flags::OpenFlags;
pub use request::{Action, OpenParams, Page, PageFiller, Request};
