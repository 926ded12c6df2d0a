use afio_io::{Errno, FileHandle};
use tracing::{debug, error};

use crate::{compression::CompressionContext, error::FsError};

/// The open file, seen either as raw bytes or through the compression codec.
///
/// Built per operation from the executor's fields, so that the operation code is written once
/// for both kinds of file.
pub(crate) enum FileStream<'a, H: FileHandle> {
    Raw(&'a mut H),
    Compressed(&'a mut H, &'a mut CompressionContext),
}

impl<'a, H: FileHandle> FileStream<'a, H> {
    pub(crate) fn new(file: &'a mut H, compression: Option<&'a mut CompressionContext>) -> Self {
        match compression {
            Some(ctx) => FileStream::Compressed(file, ctx),
            None => FileStream::Raw(file),
        }
    }

    /// One read call. Compressed streams ignore `offset`: they always read from their position.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        match self {
            FileStream::Raw(file) => file.read_pos(buf, offset),
            FileStream::Compressed(file, ctx) => ctx.read(&mut **file, buf),
        }
    }

    /// One positional write call.
    ///
    /// ## Panics
    /// Compressed streams can only be appended to, so this panics for them.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, Errno> {
        match self {
            FileStream::Raw(file) => file.write_pos(buf, offset),
            FileStream::Compressed(..) => {
                panic!("positional write at offset {offset} on a compressed file; use append")
            }
        }
    }

    /// One append call.
    fn append(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        match self {
            FileStream::Raw(file) => file.append(buf),
            FileStream::Compressed(file, ctx) => ctx.write(&mut **file, buf),
        }
    }

    /// Reads `buf.len()` bytes starting at `offset`, retrying short reads.
    ///
    /// Every byte placed into `buf` is added to `bytes_read`, even if the call then fails.
    /// Reaching the end of the file first is a `ReadUnderflow`, unless `partial` is set, in which
    /// case the read succeeds with whatever was read.
    pub(crate) fn read_page(
        &mut self,
        buf: &mut [u8],
        offset: u64,
        partial: bool,
        bytes_read: &mut u64,
    ) -> Result<(), FsError> {
        if let FileStream::Compressed(file, ctx) = self {
            let current = ctx.position();
            if offset < current {
                debug!(offset, current, "backwards read on a compressed file");
                return Err(FsError::InvalidParameters);
            }
            if offset > current {
                // Seeking is not supported. Reads past the end of the data are tolerated, though.
                if !ctx.at_end(&mut **file)? {
                    debug!(offset, current, "forward seek on a compressed file");
                    return Err(FsError::InvalidParameters);
                }
                return if partial {
                    Ok(())
                } else {
                    Err(FsError::ReadUnderflow)
                };
            }
        }

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            *bytes_read += n as u64;
            if n == 0 {
                if partial {
                    return Ok(());
                }
                debug!(
                    offset,
                    requested = buf.len(),
                    filled,
                    "read underflow"
                );
                return Err(FsError::ReadUnderflow);
            }
            if filled + n < buf.len() {
                debug!(n, remaining = buf.len() - filled, "partial read");
            }
            filled += n;
        }
        Ok(())
    }

    /// Writes all of `buf` at `offset`, at most `chunk_size` bytes per call, retrying short
    /// writes.
    ///
    /// ## Panics
    /// Panics if the OS accepts zero bytes, or if this is a compressed stream.
    pub(crate) fn write_page(
        &mut self,
        mut buf: &[u8],
        mut offset: u64,
        chunk_size: usize,
    ) -> Result<(), FsError> {
        while !buf.is_empty() {
            let chunk = buf.len().min(chunk_size);
            let n = self.write_at(&buf[..chunk], offset).map_err(|errno| {
                error!(offset, len = chunk, "write failed: {errno}");
                FsError::Os(errno)
            })?;
            assert_ne!(n, 0, "write at offset {offset} made no progress");
            if n != chunk {
                debug!(n, requested = chunk, "partial write");
            }
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    /// Appends all of `buf`, retrying short writes.
    ///
    /// ## Panics
    /// Panics if the OS accepts zero bytes.
    pub(crate) fn append_all(&mut self, mut buf: &[u8]) -> Result<(), FsError> {
        while !buf.is_empty() {
            let n = self.append(buf)?;
            assert_ne!(n, 0, "append made no progress");
            buf = &buf[n..];
        }
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<(), FsError> {
        match self {
            FileStream::Raw(file) => file.sync()?,
            FileStream::Compressed(file, ctx) => {
                ctx.flush(&mut **file)?;
                file.sync()?;
            }
        }
        Ok(())
    }

    pub(crate) fn sync_on_write(&mut self) -> Result<(), FsError> {
        match self {
            FileStream::Raw(file) | FileStream::Compressed(file, _) => file.sync_on_write()?,
        }
        Ok(())
    }

    /// Closes the file. A compressed stream is finished first; the handle is closed either way.
    pub(crate) fn close(&mut self) -> Result<(), FsError> {
        match self {
            FileStream::Raw(file) => file.close()?,
            FileStream::Compressed(file, ctx) => {
                let finished = ctx.finish(&mut **file);
                let closed = file.close();
                finished.and(closed)?;
            }
        }
        Ok(())
    }
}
