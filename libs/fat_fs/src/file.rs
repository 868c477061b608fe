use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use block_device_api::BlockDevice;

use crate::codec::{Attributes, ShortRecord};
use crate::fs::Volume;
use crate::lifecycle::Guard;
use crate::FsError;

/// Contents of a regular file.
///
/// Holds only the position of the file's directory record; size and start
/// cluster are read from it on every call.
pub struct File<D: BlockDevice> {
    vol:   Rc<RefCell<Volume<D>>>,
    guard: Guard,
    pos:   u64,
}

impl<D: BlockDevice> File<D> {
    pub(crate) fn new(vol: Rc<RefCell<Volume<D>>>, guard: Guard, pos: u64) -> Self {
        Self { vol, guard, pos }
    }

    pub fn is_valid(&self) -> bool { self.guard.is_valid() }

    pub fn is_read_only(&self) -> bool { self.guard.read_only() }

    pub fn length(&self) -> Result<u64, FsError> {
        self.guard.check_valid()?;
        Ok(self.vol.borrow_mut().read_short(self.pos)?.size as u64)
    }

    /// Clusters currently linked into the file's chain.
    pub fn cluster_count(&self) -> Result<u32, FsError> {
        self.guard.check_valid()?;
        let mut vol = self.vol.borrow_mut();
        let start = vol.read_short(self.pos)?.first_cluster();
        Ok(vol.fat.chain_vec(start)?.len() as u32)
    }

    /// Fill `buf` from `offset`. The whole range must lie inside the file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), FsError> {
        self.guard.check_valid()?;
        let mut vol = self.vol.borrow_mut();
        let vol = &mut *vol;
        let rec = vol.read_short(self.pos)?;
        let end = offset.checked_add(buf.len() as u64).ok_or(FsError::OutOfRange)?;
        if end > rec.size as u64 {
            return Err(FsError::OutOfRange);
        }
        let mut done = 0;
        for (at, len) in extents(vol, rec.first_cluster(), offset, buf.len())? {
            vol.dev.read_at(at, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Store `data` at `offset`, growing the file when it ends past the
    /// current length. Bytes between the old end and `offset` read as zero.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), FsError> {
        self.guard.check_writable()?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= u32::MAX as u64)
            .ok_or(FsError::FileTooLarge)?;
        if data.is_empty() {
            return Ok(());
        }
        let pos = self.pos;
        self.vol.borrow_mut().transact(|vol| {
            let mut rec = vol.read_short(pos)?;
            let old_len = rec.size as u64;
            if end > old_len {
                reserve(vol, &mut rec, end)?;
                if offset > old_len {
                    zero_range(vol, rec.first_cluster(), old_len, offset)?;
                }
                rec.size = end as u32;
            }
            write_range(vol, rec.first_cluster(), offset, data)?;
            touch(vol, &mut rec);
            vol.write_record(pos, &rec.encode())
        })
    }

    /// Truncate or extend the file. Shrinking to 0 releases every cluster
    /// but keeps the entry.
    pub fn set_length(&self, length: u64) -> Result<(), FsError> {
        self.guard.check_writable()?;
        let new_size = u32::try_from(length).map_err(|_| FsError::FileTooLarge)?;
        let pos = self.pos;
        self.vol.borrow_mut().transact(|vol| {
            let mut rec = vol.read_short(pos)?;
            let old_len = rec.size as u64;
            if length == old_len {
                return Ok(());
            }
            if length < old_len {
                let keep = length.div_ceil(vol.cluster_size() as u64) as u32;
                vol.fat.truncate_chain(rec.first_cluster(), keep)?;
                if keep == 0 {
                    rec.set_first_cluster(0);
                }
            } else {
                reserve(vol, &mut rec, length)?;
                zero_range(vol, rec.first_cluster(), old_len, length)?;
            }
            rec.size = new_size;
            touch(vol, &mut rec);
            vol.write_record(pos, &rec.encode())
        })
    }

    /// Write pending table state. Does not flush the device.
    pub fn flush(&self) -> Result<(), FsError> {
        self.guard.check_valid()?;
        if self.guard.read_only() {
            return Ok(());
        }
        let mut vol = self.vol.borrow_mut();
        let vol = &mut *vol;
        vol.fat.commit(&mut vol.dev, &vol.bpb)
    }
}

// ─── Helpers ───────────────────────────────────────────────────────────────────

fn touch<D: BlockDevice>(vol: &Volume<D>, rec: &mut ShortRecord) {
    if let Some(now) = vol.now() {
        rec.set_modified(Some(now));
    }
    rec.attributes |= Attributes::ARCHIVE;
}

/// Device ranges backing `len` bytes at `offset` in the chain at `start`,
/// with physically adjacent clusters merged.
fn extents<D: BlockDevice>(vol: &Volume<D>, start: u32, offset: u64, len: usize)
    -> Result<Vec<(u64, usize)>, FsError>
{
    let mut out: Vec<(u64, usize)> = Vec::new();
    if len == 0 {
        return Ok(out);
    }
    let cs = vol.cluster_size() as u64;
    let end = offset + len as u64;
    let mut at = offset;
    for (index, cluster) in vol.fat.chain(start).enumerate() {
        let cluster = cluster?;
        let index = index as u64;
        let cluster_end = (index + 1) * cs;
        if cluster_end <= at {
            continue;
        }
        let take = (end.min(cluster_end) - at) as usize;
        let dev = vol.bpb.cluster_offset(cluster) + (at - index * cs);
        match out.last_mut() {
            Some((prev, n)) if *prev + *n as u64 == dev => *n += take,
            _ => out.push((dev, take)),
        }
        at += take as u64;
        if at == end {
            return Ok(out);
        }
    }
    Err(FsError::Corrupted("file chain is shorter than its size"))
}

/// Make the chain long enough for `len` bytes, allocating a first cluster
/// for an empty file.
fn reserve<D: BlockDevice>(vol: &mut Volume<D>, rec: &mut ShortRecord, len: u64) -> Result<(), FsError> {
    let needed = len.div_ceil(vol.cluster_size() as u64) as u32;
    let chain = vol.fat.chain_vec(rec.first_cluster())?;
    let have = chain.len() as u32;
    if needed <= have {
        return Ok(());
    }
    match chain.last() {
        Some(&tail) => {
            vol.fat.extend_chain(tail, needed - have)?;
        }
        None => rec.set_first_cluster(vol.fat.allocate_chain(needed)?),
    }
    Ok(())
}

fn zero_range<D: BlockDevice>(vol: &mut Volume<D>, start: u32, from: u64, to: u64) -> Result<(), FsError> {
    let len = usize::try_from(to - from).map_err(|_| FsError::FileTooLarge)?;
    let zeros = vec![0u8; len.min(vol.cluster_size() as usize)];
    for (at, n) in extents(vol, start, from, len)? {
        let mut done = 0;
        while done < n {
            let step = (n - done).min(zeros.len());
            vol.dev.write_at(at + done as u64, &zeros[..step])?;
            done += step;
        }
    }
    Ok(())
}

fn write_range<D: BlockDevice>(vol: &mut Volume<D>, start: u32, offset: u64, data: &[u8]) -> Result<(), FsError> {
    let mut done = 0;
    for (at, len) in extents(vol, start, offset, data.len())? {
        vol.dev.write_at(at, &data[done..done + len])?;
        done += len;
    }
    Ok(())
}
