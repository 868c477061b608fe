use alloc::vec;
use alloc::vec::Vec;

use crate::{check_range, BlockDevice, IoError};

/// Block device backed by a `Vec<u8>`.
///
/// Used for RAM disks and as the mock disk in filesystem tests.
pub struct MemDisk {
    data:        Vec<u8>,
    sector_size: u32,
    read_only:   bool,
    closed:      bool,
    flushes:     u32,
}

impl MemDisk {
    /// A zero-filled disk of `size` bytes with 512-byte sectors.
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0u8; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, sector_size: 512, read_only: false, closed: false, flushes: 0 }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn data(&self) -> &[u8] { &self.data }

    pub fn data_mut(&mut self) -> &mut Vec<u8> { &mut self.data }

    pub fn into_inner(self) -> Vec<u8> { self.data }

    /// Number of successful `flush()` calls so far.
    pub fn flush_count(&self) -> u32 { self.flushes }

    fn check_open(&self) -> Result<(), IoError> {
        if self.closed { Err(IoError::Closed) } else { Ok(()) }
    }
}

impl BlockDevice for MemDisk {
    fn size(&self) -> u64 { self.data.len() as u64 }

    fn sector_size(&self) -> u32 { self.sector_size }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_open()?;
        check_range(offset, buf.len(), self.size())?;
        let off = offset as usize;
        buf.copy_from_slice(&self.data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), IoError> {
        self.check_open()?;
        if self.read_only {
            return Err(IoError::ReadOnly);
        }
        check_range(offset, buf.len(), self.size())?;
        let off = offset as usize;
        self.data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        self.check_open()?;
        self.flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IoError> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool { self.closed }

    fn is_read_only(&self) -> bool { self.read_only }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_bytes() {
        let mut disk = MemDisk::new(4096);
        disk.write_at(510, &[0x55, 0xAA]).unwrap();
        let mut sig = [0u8; 2];
        disk.read_at(510, &mut sig).unwrap();
        assert_eq!(sig, [0x55, 0xAA]);
    }

    #[test]
    fn write_past_end_is_rejected_whole() {
        let mut disk = MemDisk::new(1024);
        let err = disk.write_at(1020, &[1u8; 8]).unwrap_err();
        assert_eq!(err, IoError::OutOfRange { offset: 1020, len: 8, size: 1024 });
        assert!(disk.data()[1020..].iter().all(|&b| b == 0), "no partial write");
    }

    #[test]
    fn read_only_disk_refuses_writes() {
        let mut disk = MemDisk::new(1024).with_read_only(true);
        assert_eq!(disk.write_at(0, &[1]), Err(IoError::ReadOnly));
        let mut b = [0u8; 1];
        assert!(disk.read_at(0, &mut b).is_ok());
    }

    #[test]
    fn closed_disk_refuses_everything() {
        let mut disk = MemDisk::new(1024);
        disk.close().unwrap();
        assert!(disk.is_closed());
        let mut b = [0u8; 1];
        assert_eq!(disk.read_at(0, &mut b), Err(IoError::Closed));
        assert_eq!(disk.flush(), Err(IoError::Closed));
    }

    #[test]
    fn borrowed_disk_forwards_to_owner() {
        fn stamp<D: BlockDevice>(mut dev: D) {
            dev.write_at(4, b"abcd").unwrap();
            dev.flush().unwrap();
        }
        let mut disk = MemDisk::new(1024);
        stamp(&mut disk);
        assert_eq!(&disk.data()[4..8], b"abcd");
        assert_eq!(disk.flush_count(), 1);
    }
}
