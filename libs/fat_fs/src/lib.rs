//! FAT12/16/32 filesystem over a [`BlockDevice`].
//!
//! ```text
//! FileSystem ── root() ──▶ Directory ── entry()/entries() ──▶ DirEntry
//!                              ▲                                 │
//!                              └──────── directory() ────────────┤
//!                                                    file() ──▶ File
//! ```
//!
//! Handles are views: they hold the position of an on-disk record and read
//! it again on every call. Every mutating call either completes or leaves
//! the FAT and the directory records exactly as they were.
//!
//! `no_std` + `alloc`; the `std` feature adds a host clock and file-backed
//! devices.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

mod bpb;
mod codec;
mod dir;
mod entry;
mod error;
mod file;
mod format;
mod fs;
mod lifecycle;
mod table;
mod time;

#[cfg(test)]
mod test_support;

pub use block_device_api::{BlockDevice, IoError, MemDisk};
#[cfg(feature = "std")]
pub use block_device_api::FileDisk;

pub use bpb::{BiosParameterBlock, FatType, FsInfo, MediaDescriptor};
pub use codec::{
    exact_short_name, generate_short_name, lfn_checksum, long_records, names_match, validate_name, Attributes,
    LongRecord, ShortRecord, RECORD_SIZE,
};
pub use dir::{Directory, Entries};
pub use entry::DirEntry;
pub use error::FsError;
pub use file::File;
pub use format::{format_volume, FormatOptions};
pub use fs::{create, FileSystem, FsOptions};
pub use time::{DateTime, NullTimeProvider, TimeProvider, MAX_YEAR, MIN_YEAR};
#[cfg(feature = "std")]
pub use time::SystemTimeProvider;
