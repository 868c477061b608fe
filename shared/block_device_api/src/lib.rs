//! Byte-addressed block device contract shared by the filesystem and the
//! media that back it.
//!
//! A device is a flat array of `size()` bytes grouped into sectors of
//! `sector_size()` bytes. Every transfer is whole-buffer: it either moves all
//! requested bytes or fails, there is no short read or short write.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

use core::fmt;

mod mem;
pub use mem::MemDisk;

#[cfg(feature = "std")]
mod file;
#[cfg(feature = "std")]
pub use file::FileDisk;

// ─── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The device has been closed.
    Closed,
    /// A write was attempted on a read-only device.
    ReadOnly,
    /// The transfer does not fit inside the device.
    OutOfRange { offset: u64, len: usize, size: u64 },
    /// The medium reported a failure.
    Media(&'static str),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Closed => f.write_str("device is closed"),
            IoError::ReadOnly => f.write_str("device is read-only"),
            IoError::OutOfRange { offset, len, size } => write!(
                f,
                "transfer of {len} bytes at offset {offset:#x} exceeds device size {size:#x}"
            ),
            IoError::Media(what) => write!(f, "media error: {what}"),
        }
    }
}

// ─── Device trait ──────────────────────────────────────────────────────────────

pub trait BlockDevice {
    /// Total size in bytes.
    fn size(&self) -> u64;

    fn sector_size(&self) -> u32;

    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError>;

    /// Store `buf` at `offset`. Read-only devices fail with `IoError::ReadOnly`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), IoError>;

    /// Make every previous write durable.
    fn flush(&mut self) -> Result<(), IoError>;

    fn close(&mut self) -> Result<(), IoError>;

    fn is_closed(&self) -> bool;

    fn is_read_only(&self) -> bool;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn size(&self) -> u64 { (**self).size() }
    fn sector_size(&self) -> u32 { (**self).sector_size() }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), IoError> {
        (**self).write_at(offset, buf)
    }
    fn flush(&mut self) -> Result<(), IoError> { (**self).flush() }
    fn close(&mut self) -> Result<(), IoError> { (**self).close() }
    fn is_closed(&self) -> bool { (**self).is_closed() }
    fn is_read_only(&self) -> bool { (**self).is_read_only() }
}

/// Validate a transfer against the device bounds. Shared by the provided
/// implementations so they reject the same requests.
pub fn check_range(offset: u64, len: usize, size: u64) -> Result<(), IoError> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(IoError::OutOfRange { offset, len, size }),
    }
}
