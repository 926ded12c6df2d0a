//! Transparent stream compression for files opened with `GZ`.
//!
//! A compressed file is a sequence of zstd frames. It can only be read front to back, and only
//! be written by appending, so there is no seeking: the context tracks the position in the
//! uncompressed stream and the executor enforces forward-only access.

use std::io;

use afio_io::{Errno, FileHandle};
use nix::fcntl::OFlag;
use tracing::error;
use zstd::stream::raw::{Decoder, Encoder, Operation, OutBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamMode {
    Read,
    Write,
}

fn codec_errno(err: io::Error) -> Errno {
    error!("compressed stream error: {err}");
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Writes all of `bytes` at the handle's current position.
fn write_out<H: FileHandle>(file: &mut H, mut bytes: &[u8]) -> Result<(), Errno> {
    while !bytes.is_empty() {
        let n = file.write_forward(bytes)?;
        assert_ne!(n, 0, "write_forward made no progress");
        bytes = &bytes[n..];
    }
    Ok(())
}

/// Encoder and decoder state plus their I/O buffers.
///
/// Everything is allocated once. `reset` returns the context to its unbound state so that the
/// next file opened by the same executor reuses the buffers.
pub(crate) struct CompressionContext {
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,

    /// Compressed bytes read from the file and not yet decoded: `inbuf[in_pos..in_len]`.
    inbuf: Vec<u8>,
    in_pos: usize,
    in_len: usize,

    /// Scratch space for encoder output on its way to the file.
    outbuf: Vec<u8>,

    mode: Option<StreamMode>,
    /// Position in the uncompressed stream.
    position: u64,
    /// Set once the file is exhausted at a frame boundary.
    eof: bool,
    /// `true` while the decoder sits between frames.
    frame_done: bool,
}

impl CompressionContext {
    pub(crate) fn new(level: i32, buffer_size: usize) -> io::Result<Self> {
        Ok(Self {
            encoder: Encoder::new(level)?,
            decoder: Decoder::new()?,
            inbuf: vec![0; buffer_size],
            in_pos: 0,
            in_len: 0,
            outbuf: vec![0; buffer_size],
            mode: None,
            position: 0,
            eof: false,
            frame_done: true,
        })
    }

    /// Binds the context to the file the executor has just opened.
    ///
    /// A compressed stream is either read or written, so `O_RDWR` is rejected with `EINVAL`.
    pub(crate) fn bind(&mut self, oflag: OFlag) -> Result<(), Errno> {
        assert!(self.mode.is_none(), "compression context is already bound");
        let access = oflag & OFlag::O_ACCMODE;
        let mode = if access == OFlag::O_RDONLY {
            StreamMode::Read
        } else if access == OFlag::O_WRONLY {
            StreamMode::Write
        } else {
            return Err(Errno::EINVAL);
        };
        self.mode = Some(mode);
        Ok(())
    }

    pub(crate) fn mode(&self) -> Option<StreamMode> {
        self.mode
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// Returns `true` once every byte of the stream has been decoded.
    ///
    /// A read that consumes exactly the remaining data can stop before the decoder has seen the
    /// end of the file, so this feeds the decoder whatever is left, without room for output,
    /// until it either wants to produce bytes or runs out of file. Input read here is kept for
    /// the next `read`.
    pub(crate) fn at_end<H: FileHandle>(&mut self, file: &mut H) -> Result<bool, Errno> {
        if self.mode != Some(StreamMode::Read) {
            return Ok(false);
        }
        while !self.eof {
            if self.in_pos == self.in_len {
                let n = file.read_forward(&mut self.inbuf)?;
                if n == 0 {
                    // Mid-frame, the next `read` reports the truncation.
                    self.eof = self.frame_done;
                    return Ok(self.eof);
                }
                self.in_pos = 0;
                self.in_len = n;
            }
            let status = self
                .decoder
                .run_on_buffers(&self.inbuf[self.in_pos..self.in_len], &mut [])
                .map_err(codec_errno)?;
            self.in_pos += status.bytes_read;
            self.frame_done = status.remaining == 0;
            if status.bytes_read == 0 {
                // The decoder has output waiting.
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decodes up to `buf.len()` bytes. Returns fewer only at the end of the stream.
    pub(crate) fn read<H: FileHandle>(
        &mut self,
        file: &mut H,
        buf: &mut [u8],
    ) -> Result<usize, Errno> {
        if self.mode != Some(StreamMode::Read) {
            return Err(Errno::EBADF);
        }
        let mut produced = 0;
        while produced < buf.len() && !self.eof {
            if self.in_pos == self.in_len {
                // Drain output the decoder is still holding before reading more from the file.
                let status = self
                    .decoder
                    .run_on_buffers(&[], &mut buf[produced..])
                    .map_err(codec_errno)?;
                if status.bytes_written > 0 {
                    produced += status.bytes_written;
                    self.frame_done = status.remaining == 0;
                    continue;
                }
                let n = file.read_forward(&mut self.inbuf)?;
                if n == 0 {
                    if !self.frame_done {
                        error!("compressed stream ends in the middle of a frame");
                        return Err(Errno::EIO);
                    }
                    self.eof = true;
                    break;
                }
                self.in_pos = 0;
                self.in_len = n;
            }
            let status = self
                .decoder
                .run_on_buffers(&self.inbuf[self.in_pos..self.in_len], &mut buf[produced..])
                .map_err(codec_errno)?;
            self.in_pos += status.bytes_read;
            produced += status.bytes_written;
            self.frame_done = status.remaining == 0;
        }
        self.position += produced as u64;
        Ok(produced)
    }

    /// Encodes all of `buf`, writing compressed output to the end of the file as it is produced.
    pub(crate) fn write<H: FileHandle>(&mut self, file: &mut H, buf: &[u8]) -> Result<usize, Errno> {
        if self.mode != Some(StreamMode::Write) {
            return Err(Errno::EBADF);
        }
        let mut consumed = 0;
        while consumed < buf.len() {
            let status = self
                .encoder
                .run_on_buffers(&buf[consumed..], &mut self.outbuf)
                .map_err(codec_errno)?;
            consumed += status.bytes_read;
            write_out(file, &self.outbuf[..status.bytes_written])?;
        }
        self.position += consumed as u64;
        Ok(consumed)
    }

    /// Pushes everything the encoder is buffering out to the file, without ending the frame.
    pub(crate) fn flush<H: FileHandle>(&mut self, file: &mut H) -> Result<(), Errno> {
        if self.mode != Some(StreamMode::Write) {
            return Ok(());
        }
        loop {
            let (remaining, written) = {
                let mut out = OutBuffer::around(self.outbuf.as_mut_slice());
                let remaining = self.encoder.flush(&mut out).map_err(codec_errno)?;
                (remaining, out.pos())
            };
            write_out(file, &self.outbuf[..written])?;
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    /// Ends the current frame. Must be called before a written file is closed.
    pub(crate) fn finish<H: FileHandle>(&mut self, file: &mut H) -> Result<(), Errno> {
        if self.mode != Some(StreamMode::Write) {
            return Ok(());
        }
        loop {
            let (remaining, written) = {
                let mut out = OutBuffer::around(self.outbuf.as_mut_slice());
                let remaining = self.encoder.finish(&mut out, true).map_err(codec_errno)?;
                (remaining, out.pos())
            };
            write_out(file, &self.outbuf[..written])?;
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    /// Returns to the unbound state. Buffers are kept.
    pub(crate) fn reset(&mut self) {
        if let Err(err) = self.encoder.reinit() {
            error!("failed to reset zstd encoder: {err}");
        }
        if let Err(err) = self.decoder.reinit() {
            error!("failed to reset zstd decoder: {err}");
        }
        self.in_pos = 0;
        self.in_len = 0;
        self.mode = None;
        self.position = 0;
        self.eof = false;
        self.frame_done = true;
    }
}

impl std::fmt::Debug for CompressionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionContext")
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("eof", &self.eof)
            .field("buffer_size", &self.inbuf.len())
            .finish()
    }
}
