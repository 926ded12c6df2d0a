use afio_io::{Access, OpenMode};
use bitflags::bitflags;
use nix::fcntl::OFlag;

bitflags! {
    /// Options for opening a file.
    ///
    /// The bit layout is shared with the components that send open requests, so it must not
    /// change. Bits this crate does not know about are kept as they are.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        // Read-only is the absence of both bits below, i.e. `(flags & READ_WRITE_MASK) == 0`.
        const WRITE_ONLY = 0x1;
        const READ_WRITE = 0x2;
        const READ_WRITE_MASK = 0x3;

        const APPEND = 0x8;
        /// Open the file in OS-synchronous mode (`O_SYNC`).
        const SYNC = 0x10;
        const CREATE = 0x100;
        const TRUNCATE = 0x200;
        /// Sync automatically every `auto_sync_size` bytes written.
        const AUTOSYNC = 0x400;
        const CREATE_IF_NONE = 0x800;
        /// Pre-fill the whole file with pages supplied by the requester.
        const INIT = 0x1000;
        const CHECK_SIZE = 0x2000;
        const DIRECT = 0x4000;
        /// Compress the file as a stream.
        const GZ = 0x8000;
        const READ_SIZE = 0x40000;
        /// Direct I/O with synchronous write-through. Requires `DIRECT`.
        const DIRECT_SYNC = 0x80000;

        // Unknown bits must round-trip.
        const _ = !0;
    }
}

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags::empty();

    /// Decodes the read/write mode group. Returns `None` for the invalid value `0x3`.
    pub fn access(&self) -> Option<Access> {
        match self.bits() & Self::READ_WRITE_MASK.bits() {
            0 => Some(Access::ReadOnly),
            0x1 => Some(Access::WriteOnly),
            0x2 => Some(Access::ReadWrite),
            _ => None,
        }
    }

    /// The mode the raw file is opened with: the access bits and `APPEND`.
    pub fn open_mode(&self) -> Option<OpenMode> {
        self.access()
            .map(|access| OpenMode::new(access).append(self.contains(Self::APPEND)))
    }

    /// `true` if the file may be written to, i.e. it must be synced before it is closed.
    pub fn is_writable(&self) -> bool {
        self.intersects(Self::WRITE_ONLY | Self::READ_WRITE | Self::APPEND)
    }

    pub fn creates(&self) -> bool {
        self.intersects(Self::CREATE | Self::CREATE_IF_NONE)
    }

    /// Checks the combinations that can never be honoured.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.contains(Self::INIT | Self::GZ) {
            return Err("INIT and GZ are mutually exclusive");
        }
        if self.contains(Self::DIRECT_SYNC) && !self.contains(Self::DIRECT) {
            return Err("DIRECT_SYNC requires DIRECT");
        }
        Ok(())
    }

    /// The POSIX open flags a compressed stream is bound with.
    pub fn posix_flags(&self) -> Option<OFlag> {
        let mut oflag = match self.access()? {
            Access::ReadOnly => OFlag::O_RDONLY,
            Access::WriteOnly => OFlag::O_WRONLY,
            Access::ReadWrite => OFlag::O_RDWR,
        };
        if self.creates() {
            oflag |= OFlag::O_CREAT;
        }
        if self.contains(Self::TRUNCATE) {
            oflag |= OFlag::O_TRUNC;
        }
        if self.contains(Self::APPEND) {
            oflag |= OFlag::O_APPEND;
        }
        Some(oflag)
    }
}
