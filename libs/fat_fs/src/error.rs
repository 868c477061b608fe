use core::fmt;

use block_device_api::IoError;

/// Every failure the filesystem reports.
///
/// Nothing is retried or repaired internally: the error surfaces with the
/// on-disk structures exactly as they were before the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Mutation attempted on a read-only device, filesystem or object.
    ReadOnly,
    /// The object was removed, or the filesystem it belongs to was closed.
    InvalidState,
    /// The filesystem has been closed.
    Closed,
    /// The boot sector does not describe a FAT volume.
    UnknownFormat(&'static str),
    /// The block device failed.
    Io(IoError),
    /// Not enough free clusters (or root directory slots).
    NoSpace,
    AlreadyExists,
    NotFound,
    InvalidName,
    /// Access beyond the end of a file.
    OutOfRange,
    /// FAT files cannot exceed 4 GiB - 1.
    FileTooLarge,
    NotADirectory,
    NotAFile,
    InvalidArgument(&'static str),
    /// On-disk structures are inconsistent (looping or broken chain, ...).
    Corrupted(&'static str),
}

impl From<IoError> for FsError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::ReadOnly => FsError::ReadOnly,
            other => FsError::Io(other),
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::ReadOnly => f.write_str("read-only"),
            FsError::InvalidState => f.write_str("object is no longer valid"),
            FsError::Closed => f.write_str("filesystem is closed"),
            FsError::UnknownFormat(why) => write!(f, "unknown filesystem: {why}"),
            FsError::Io(err) => write!(f, "i/o error: {err}"),
            FsError::NoSpace => f.write_str("no space left on volume"),
            FsError::AlreadyExists => f.write_str("entry already exists"),
            FsError::NotFound => f.write_str("entry not found"),
            FsError::InvalidName => f.write_str("name cannot be stored on FAT"),
            FsError::OutOfRange => f.write_str("access beyond end of file"),
            FsError::FileTooLarge => f.write_str("file size limit exceeded"),
            FsError::NotADirectory => f.write_str("not a directory"),
            FsError::NotAFile => f.write_str("not a file"),
            FsError::InvalidArgument(why) => write!(f, "invalid argument: {why}"),
            FsError::Corrupted(why) => write!(f, "corrupted volume: {why}"),
        }
    }
}
