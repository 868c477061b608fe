use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{check_range, BlockDevice, IoError};

/// Block device backed by a disk image on the host filesystem.
pub struct FileDisk {
    file:        Option<File>,
    size:        u64,
    sector_size: u32,
    read_only:   bool,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(!read_only).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file: Some(file), size, sector_size: 512, read_only })
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    fn file(&mut self) -> Result<&mut File, IoError> {
        self.file.as_mut().ok_or(IoError::Closed)
    }
}

fn media(err: std::io::Error, what: &'static str) -> IoError {
    log::error!("image file {what} failed: {err}");
    IoError::Media(what)
}

impl BlockDevice for FileDisk {
    fn size(&self) -> u64 { self.size }

    fn sector_size(&self) -> u32 { self.sector_size }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        check_range(offset, buf.len(), self.size)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| media(e, "seek"))?;
        file.read_exact(buf).map_err(|e| media(e, "read"))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), IoError> {
        if self.read_only {
            return Err(IoError::ReadOnly);
        }
        check_range(offset, buf.len(), self.size)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| media(e, "seek"))?;
        file.write_all(buf).map_err(|e| media(e, "write"))
    }

    fn flush(&mut self) -> Result<(), IoError> {
        let read_only = self.read_only;
        let file = self.file()?;
        if read_only {
            return Ok(());
        }
        file.sync_all().map_err(|e| media(e, "sync"))
    }

    fn close(&mut self) -> Result<(), IoError> {
        self.file = None;
        Ok(())
    }

    fn is_closed(&self) -> bool { self.file.is_none() }

    fn is_read_only(&self) -> bool { self.read_only }
}
