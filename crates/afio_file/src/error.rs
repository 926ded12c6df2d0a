use afio_io::Errno;
use thiserror::Error;

/// Wire codes for the failures the executor raises itself. They sit well above any errno value,
/// so a code can always be told apart from a raw OS error number.
pub mod code {
    pub const NONE: u32 = 0;
    pub const INVALID_PARAMETERS: u32 = 2807;
    pub const UNKNOWN: u32 = 2808;
    pub const FILE_DOES_NOT_EXIST: u32 = 2810;
    pub const READ_UNDERFLOW: u32 = 2811;
    pub const FILE_EXISTS: u32 = 2812;
    pub const INVALID_FILE_SIZE: u32 = 2813;
}

/// The error stored on a [`Request`](crate::Request) when an operation fails.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// An OS call failed. Use [`FsError::kind`] rather than matching on the errno.
    #[error("file system error: {0} ({:?})", kind_of(.0))]
    Os(Errno),

    #[error("invalid parameters")]
    InvalidParameters,

    #[error("file does not exist")]
    FileDoesNotExist,

    #[error("file exists")]
    FileExists,

    #[error("file size does not match the expected size")]
    InvalidFileSize,

    #[error("read underflow: end of file reached before the request was satisfied")]
    ReadUnderflow,

    #[error("unknown file system error")]
    Unknown,
}

impl FsError {
    /// The stable classification of this error.
    pub fn kind(&self) -> FsErrorKind {
        match self {
            FsError::Os(errno) => translate_errno(*errno),
            FsError::InvalidParameters => FsErrorKind::InvalidParameters,
            FsError::FileDoesNotExist => FsErrorKind::FileDoesNotExist,
            FsError::FileExists => FsErrorKind::FileExists,
            FsError::InvalidFileSize => FsErrorKind::InvalidFileSize,
            FsError::ReadUnderflow => FsErrorKind::ReadUnderflow,
            FsError::Unknown => FsErrorKind::Unknown,
        }
    }

    /// The value reported on the wire: the raw errno for OS failures, a [`code`] otherwise.
    pub fn code(&self) -> u32 {
        match self {
            FsError::Os(errno) => *errno as i32 as u32,
            FsError::InvalidParameters => code::INVALID_PARAMETERS,
            FsError::FileDoesNotExist => code::FILE_DOES_NOT_EXIST,
            FsError::FileExists => code::FILE_EXISTS,
            FsError::InvalidFileSize => code::INVALID_FILE_SIZE,
            FsError::ReadUnderflow => code::READ_UNDERFLOW,
            FsError::Unknown => code::UNKNOWN,
        }
    }

    /// Decodes a wire code. `0` means success and yields `None`.
    pub fn from_code(value: u32) -> Option<FsError> {
        Some(match value {
            code::NONE => return None,
            code::INVALID_PARAMETERS => FsError::InvalidParameters,
            code::UNKNOWN => FsError::Unknown,
            code::FILE_DOES_NOT_EXIST => FsError::FileDoesNotExist,
            code::READ_UNDERFLOW => FsError::ReadUnderflow,
            code::FILE_EXISTS => FsError::FileExists,
            code::INVALID_FILE_SIZE => FsError::InvalidFileSize,
            errno => FsError::Os(Errno::from_raw(errno as i32)),
        })
    }
}

impl From<Errno> for FsError {
    fn from(errno: Errno) -> Self {
        FsError::Os(errno)
    }
}

/// Classification of a failure, independent of the platform's errno numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsErrorKind {
    HardwareFailed,
    EnvironmentError,
    NoSpaceLeftOnDevice,
    PermissionDenied,
    InvalidParameters,
    FileDoesNotExist,
    FileExists,
    InvalidFileSize,
    ReadUnderflow,
    OutOfResources,
    Unknown,
}

fn kind_of(errno: &Errno) -> FsErrorKind {
    translate_errno(*errno)
}

/// Maps an OS error number onto the engine's error taxonomy.
pub fn translate_errno(errno: Errno) -> FsErrorKind {
    use Errno::*;
    match errno {
        ENOENT => FsErrorKind::FileDoesNotExist,
        EEXIST => FsErrorKind::FileExists,
        ENOSPC | EDQUOT => FsErrorKind::NoSpaceLeftOnDevice,
        EACCES | EPERM | EROFS => FsErrorKind::PermissionDenied,
        EINVAL | EFBIG | EISDIR | ENOTDIR | ENAMETOOLONG | EBADF => {
            FsErrorKind::InvalidParameters
        }
        EMFILE | ENFILE | ENOMEM => FsErrorKind::OutOfResources,
        EIO | ENXIO | ENODEV => FsErrorKind::HardwareFailed,
        // ENOTSUP is an alias of EOPNOTSUPP on Linux, not a variant of its own.
        EOPNOTSUPP | ENOSYS => FsErrorKind::EnvironmentError,
        errno if errno == Errno::ENOTSUP => FsErrorKind::EnvironmentError,
        _ => FsErrorKind::Unknown,
    }
}
