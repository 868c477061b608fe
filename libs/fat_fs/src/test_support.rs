//! Disks, images and logging shared by the unit tests.

use std::cell::Cell;
use std::fmt::Display;
use std::io::{Cursor, Read, Write};
use std::rc::Rc;
use std::string::String;
use std::sync::Once;
use std::vec::Vec;

use block_device_api::{BlockDevice, IoError, MemDisk};
use log::{Level, LevelFilter, Log};
use owo_colors::OwoColorize;

// ─── Logger ────────────────────────────────────────────────────────────────────

struct TestLogger;

static LOGGER: TestLogger = TestLogger;
static INIT: Once = Once::new();

enum Color {
    Default,
    Gray,
    BrightRed,
    BrightYellow,
    BrightBlue,
    BrightCyan,
    BrightMagenta,
}

fn paint(color: Color, string: impl Display) -> String {
    match color {
        Color::Default => format!("{string}"),
        Color::Gray => format!("{}", string.dimmed()),
        Color::BrightRed => format!("{}", string.bright_red()),
        Color::BrightYellow => format!("{}", string.bright_yellow()),
        Color::BrightBlue => format!("{}", string.bright_blue()),
        Color::BrightCyan => format!("{}", string.bright_cyan()),
        Color::BrightMagenta => format!("{}", string.bright_magenta()),
    }
}

impl Log for TestLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        let level = record.level();
        let tag = paint(
            match level {
                Level::Error => Color::BrightRed,
                Level::Warn => Color::BrightYellow,
                Level::Info => Color::BrightBlue,
                Level::Debug => Color::BrightCyan,
                Level::Trace => Color::BrightMagenta,
            },
            format_args!("{level:5} "),
        );
        let target = paint(Color::Gray, format_args!("[{}] ", record.target()));
        // eprintln! goes through the test harness's output capture
        eprintln!("{tag}{target}{}", paint(Color::Default, record.args()));
    }

    fn flush(&self) {}
}

/// Route `log` output to the test's stderr. Safe to call from every test.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        log::set_max_level(LevelFilter::max());
        let _ = log::set_logger(&LOGGER);
    });
}

// ─── Reference images ──────────────────────────────────────────────────────────

fn fatfs_image(size: usize, options: fatfs::FormatVolumeOptions) -> MemDisk {
    let mut cursor = Cursor::new(vec![0u8; size]);
    fatfs::format_volume(&mut cursor, options).expect("format_volume failed");
    MemDisk::from_vec(cursor.into_inner())
}

/// 16 MiB FAT16 with 2 KiB clusters and a 512-entry root.
pub(crate) fn fat16_disk() -> MemDisk {
    fatfs_image(
        16 * 1024 * 1024,
        fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat16).bytes_per_cluster(2048),
    )
}

pub(crate) fn fat16_disk_labelled(label: &[u8; 11]) -> MemDisk {
    fatfs_image(
        16 * 1024 * 1024,
        fatfs::FormatVolumeOptions::new()
            .fat_type(fatfs::FatType::Fat16)
            .bytes_per_cluster(2048)
            .volume_label(*label),
    )
}

/// 1.44 MB floppy-sized FAT12.
pub(crate) fn fat12_disk() -> MemDisk {
    fatfs_image(1_474_560, fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat12))
}

pub(crate) fn fat32_disk() -> MemDisk {
    fatfs_image(40 * 1024 * 1024, fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat32))
}

/// Write a file into the root directory via `fatfs`.
pub(crate) fn write_via_fatfs(disk: &mut MemDisk, name: &str, content: &[u8]) {
    let mut cursor = Cursor::new(disk.data_mut());
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).expect("FileSystem::new failed");
    let mut f = fs.root_dir().create_file(name).expect("create_file failed");
    f.truncate().unwrap();
    f.write_all(content).unwrap();
}

/// Read a file from the disk via `fatfs`. `path` may contain `/`.
pub(crate) fn read_via_fatfs(disk: &mut MemDisk, path: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(disk.data_mut());
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
    let mut f = fs.root_dir().open_file(path).unwrap();
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).unwrap();
    buf
}

/// Long names in a directory as `fatfs` sees them, without `.` and `..`.
pub(crate) fn list_via_fatfs_at(disk: &mut MemDisk, dir: &str) -> Vec<String> {
    let mut cursor = Cursor::new(disk.data_mut());
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
    let root = fs.root_dir();
    let dir = if dir.is_empty() { root } else { root.open_dir(dir).unwrap() };
    dir.iter()
        .map(|e| e.unwrap().file_name())
        .filter(|n| n != "." && n != "..")
        .collect()
}

pub(crate) fn list_via_fatfs(disk: &mut MemDisk) -> Vec<String> {
    list_via_fatfs_at(disk, "")
}

// ─── Failure injection ─────────────────────────────────────────────────────────

/// Fails exactly one write: once armed with `n`, the next `n` writes go
/// through and the one after that returns a media error.
pub(crate) struct FailingDisk<'a> {
    disk:  &'a mut MemDisk,
    armed: Rc<Cell<Option<u32>>>,
}

impl<'a> FailingDisk<'a> {
    pub(crate) fn new(disk: &'a mut MemDisk) -> (Self, Rc<Cell<Option<u32>>>) {
        let armed = Rc::new(Cell::new(None));
        (Self { disk, armed: armed.clone() }, armed)
    }

    pub(crate) fn data(&self) -> &[u8] { self.disk.data() }
}

impl BlockDevice for FailingDisk<'_> {
    fn size(&self) -> u64 { self.disk.size() }
    fn sector_size(&self) -> u32 { self.disk.sector_size() }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.disk.read_at(offset, buf)
    }
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), IoError> {
        match self.armed.get() {
            Some(0) => {
                self.armed.set(None);
                Err(IoError::Media("injected write failure"))
            }
            Some(n) => {
                self.armed.set(Some(n - 1));
                self.disk.write_at(offset, buf)
            }
            None => self.disk.write_at(offset, buf),
        }
    }
    fn flush(&mut self) -> Result<(), IoError> { self.disk.flush() }
    fn close(&mut self) -> Result<(), IoError> { self.disk.close() }
    fn is_closed(&self) -> bool { self.disk.is_closed() }
    fn is_read_only(&self) -> bool { self.disk.is_read_only() }
}
