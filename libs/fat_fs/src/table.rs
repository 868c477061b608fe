//! In-memory File Allocation Table.
//!
//! The primary FAT is loaded whole at mount. Mutations only touch the
//! in-memory copy; the first write to a FAT sector saves its original bytes,
//! so the saved set is both the dirty set for `commit` and the undo log for
//! `rollback`. Each public filesystem operation ends with exactly one of the
//! two, which makes the table transactional per operation.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use block_device_api::BlockDevice;

use crate::bpb::{BiosParameterBlock, FatType};
use crate::FsError;

/// Decoded value of one table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FatEntry {
    Free,
    Next(u32),
    Bad,
    EndOfChain,
    /// Cluster 1's marker, or a value in the reserved range.
    Reserved,
}

pub(crate) struct FatTable {
    fat_type:    FatType,
    data:        Vec<u8>,
    sector_size: usize,
    max_cluster: u32,
    free:        u32,
    /// Where the next first-fit scan starts.
    next_free:   u32,
    undo:        BTreeMap<usize, Vec<u8>>,
    saved:       Option<(u32, u32)>,
}

impl FatTable {
    /// Read the authoritative FAT copy and count free clusters.
    pub(crate) fn load<D: BlockDevice>(dev: &mut D, bpb: &BiosParameterBlock) -> Result<Self, FsError> {
        let mut data = vec![0u8; bpb.fat_len() as usize];
        dev.read_at(bpb.fat_offset(bpb.active_fat.unwrap_or(0)), &mut data)?;
        let mut table = Self::from_bytes(bpb.fat_type, data, bpb.bytes_per_sector as usize, bpb.max_cluster());
        table.free = (2..=table.max_cluster).filter(|&c| table.raw(c) == 0).count() as u32;
        log::debug!("FAT loaded: {} of {} clusters free", table.free, bpb.cluster_count);
        Ok(table)
    }

    fn from_bytes(fat_type: FatType, data: Vec<u8>, sector_size: usize, max_cluster: u32) -> Self {
        Self {
            fat_type,
            data,
            sector_size,
            max_cluster,
            free: 0,
            next_free: 2,
            undo: BTreeMap::new(),
            saved: None,
        }
    }

    pub(crate) fn free_count(&self) -> u32 { self.free }

    pub(crate) fn next_free_hint(&self) -> u32 { self.next_free }

    /// Seed the scan position from an FSInfo hint; invalid hints are ignored.
    pub(crate) fn set_next_free_hint(&mut self, hint: u32) {
        if hint >= 2 && hint <= self.max_cluster {
            self.next_free = hint;
        }
    }

    pub(crate) fn is_dirty(&self) -> bool { !self.undo.is_empty() }

    // ─── Entry codec ───────────────────────────────────────────────────────────

    fn raw(&self, cluster: u32) -> u32 {
        let d = &self.data;
        match self.fat_type {
            FatType::Fat12 => {
                let off = (cluster + cluster / 2) as usize;
                let v = u16::from_le_bytes([d[off], d[off + 1]]) as u32;
                if cluster & 1 == 1 { v >> 4 } else { v & 0x0FFF }
            }
            FatType::Fat16 => {
                let off = cluster as usize * 2;
                u16::from_le_bytes([d[off], d[off + 1]]) as u32
            }
            FatType::Fat32 => {
                let off = cluster as usize * 4;
                u32::from_le_bytes([d[off], d[off + 1], d[off + 2], d[off + 3]]) & 0x0FFF_FFFF
            }
        }
    }

    fn byte_span(&self, cluster: u32) -> (usize, usize) {
        match self.fat_type {
            FatType::Fat12 => ((cluster + cluster / 2) as usize, 2),
            FatType::Fat16 => (cluster as usize * 2, 2),
            FatType::Fat32 => (cluster as usize * 4, 4),
        }
    }

    fn save_sectors(&mut self, cluster: u32) {
        if self.saved.is_none() {
            self.saved = Some((self.free, self.next_free));
        }
        let (off, len) = self.byte_span(cluster);
        for sector in off / self.sector_size..=(off + len - 1) / self.sector_size {
            if !self.undo.contains_key(&sector) {
                let start = sector * self.sector_size;
                let original = self.data[start..start + self.sector_size].to_vec();
                self.undo.insert(sector, original);
            }
        }
    }

    fn put(&mut self, cluster: u32, value: u32) {
        self.save_sectors(cluster);
        let old = self.raw(cluster);
        let d = &mut self.data;
        match self.fat_type {
            FatType::Fat12 => {
                let off = (cluster + cluster / 2) as usize;
                if cluster & 1 == 1 {
                    d[off] = (d[off] & 0x0F) | ((value << 4) as u8);
                    d[off + 1] = (value >> 4) as u8;
                } else {
                    d[off] = value as u8;
                    d[off + 1] = (d[off + 1] & 0xF0) | ((value >> 8) as u8 & 0x0F);
                }
            }
            FatType::Fat16 => {
                let off = cluster as usize * 2;
                d[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            FatType::Fat32 => {
                let off = cluster as usize * 4;
                let keep = u32::from_le_bytes([d[off], d[off + 1], d[off + 2], d[off + 3]]) & 0xF000_0000;
                d[off..off + 4].copy_from_slice(&(keep | (value & 0x0FFF_FFFF)).to_le_bytes());
            }
        }
        match (old == 0, value == 0) {
            (true, false) => self.free -= 1,
            (false, true) => self.free += 1,
            _ => {}
        }
    }

    pub(crate) fn entry(&self, cluster: u32) -> FatEntry {
        let v = self.raw(cluster);
        let ft = self.fat_type;
        match v {
            0 => FatEntry::Free,
            v if v >= ft.eoc_min() => FatEntry::EndOfChain,
            v if v == ft.bad_cluster() => FatEntry::Bad,
            v if v >= 2 && v <= self.max_cluster => FatEntry::Next(v),
            _ => FatEntry::Reserved,
        }
    }

    // ─── Chains ────────────────────────────────────────────────────────────────

    /// Lazy walk of the chain starting at `start`; a start of 0 is the empty
    /// chain. Each call starts over from `start`.
    pub(crate) fn chain(&self, start: u32) -> Chain<'_> {
        Chain { table: self, next: (start != 0).then_some(start), steps: 0 }
    }

    pub(crate) fn chain_vec(&self, start: u32) -> Result<Vec<u32>, FsError> {
        self.chain(start).collect()
    }

    /// Link `count` free clusters into a new chain and return its head.
    /// Nothing changes when there are not enough free clusters.
    pub(crate) fn allocate_chain(&mut self, count: u32) -> Result<u32, FsError> {
        if count == 0 {
            return Err(FsError::InvalidArgument("empty allocation"));
        }
        if count > self.free {
            return Err(FsError::NoSpace);
        }
        let mut picked = Vec::with_capacity(count as usize);
        let span = self.max_cluster - 1;
        let mut cursor = self.next_free;
        for _ in 0..span {
            if self.raw(cursor) == 0 {
                picked.push(cursor);
                if picked.len() == count as usize {
                    break;
                }
            }
            cursor = if cursor >= self.max_cluster { 2 } else { cursor + 1 };
        }
        if picked.len() < count as usize {
            return Err(FsError::NoSpace);
        }
        let eoc = self.fat_type.eoc();
        for pair in picked.windows(2) {
            self.put(pair[0], pair[1]);
        }
        let head = picked[0];
        let tail = picked[picked.len() - 1];
        self.put(tail, eoc);
        self.next_free = if tail >= self.max_cluster { 2 } else { tail + 1 };
        log::trace!("allocated {count} clusters starting at {head}");
        Ok(head)
    }

    /// Append `count` new clusters after `tail`, returning the first new one.
    pub(crate) fn extend_chain(&mut self, tail: u32, count: u32) -> Result<u32, FsError> {
        if self.entry(tail) != FatEntry::EndOfChain {
            return Err(FsError::Corrupted("extending from a cluster that is not a chain tail"));
        }
        let head = self.allocate_chain(count)?;
        self.put(tail, head);
        Ok(head)
    }

    /// Keep the first `keep` clusters of the chain and free the rest.
    /// `keep == 0` frees everything; the owner must clear its start cluster.
    pub(crate) fn truncate_chain(&mut self, start: u32, keep: u32) -> Result<(), FsError> {
        let clusters = self.chain_vec(start)?;
        if keep as usize >= clusters.len() {
            return Ok(());
        }
        if keep > 0 {
            self.put(clusters[keep as usize - 1], self.fat_type.eoc());
        }
        for &c in &clusters[keep as usize..] {
            self.put(c, 0);
        }
        if let Some(&first_freed) = clusters.get(keep as usize) {
            self.next_free = self.next_free.min(first_freed);
        }
        log::trace!("chain {start}: kept {keep}, freed {}", clusters.len() - keep as usize);
        Ok(())
    }

    pub(crate) fn free_chain(&mut self, start: u32) -> Result<(), FsError> {
        self.truncate_chain(start, 0)
    }

    // ─── Transactions ──────────────────────────────────────────────────────────

    /// Write every dirty sector to every FAT copy (only the active copy when
    /// mirroring is disabled). On a device error the copies that were already
    /// written are put back on a best-effort basis and the table rolls back.
    pub(crate) fn commit<D: BlockDevice>(&mut self, dev: &mut D, bpb: &BiosParameterBlock) -> Result<(), FsError> {
        if self.undo.is_empty() {
            self.saved = None;
            return Ok(());
        }
        let copies: Vec<u8> = match bpb.active_fat {
            Some(active) => vec![active],
            None => (0..bpb.fats).collect(),
        };
        let ss = self.sector_size;
        let sectors: Vec<usize> = self.undo.keys().copied().collect();
        let mut failure = None;
        'copies: for &copy in &copies {
            let base = bpb.fat_offset(copy);
            for &sector in &sectors {
                let bytes = &self.data[sector * ss..(sector + 1) * ss];
                if let Err(err) = dev.write_at(base + (sector * ss) as u64, bytes) {
                    log::error!("FAT commit failed on copy {copy}, sector {sector}: {err}");
                    failure = Some(err);
                    break 'copies;
                }
            }
        }
        if let Some(err) = failure {
            for &copy in &copies {
                let base = bpb.fat_offset(copy);
                for (&sector, original) in &self.undo {
                    let _ = dev.write_at(base + (sector * ss) as u64, original);
                }
            }
            self.rollback();
            return Err(err.into());
        }
        log::trace!("committed {} FAT sectors to {} copies", self.undo.len(), copies.len());
        self.undo.clear();
        self.saved = None;
        Ok(())
    }

    /// Discard every change since the last commit.
    pub(crate) fn rollback(&mut self) {
        let ss = self.sector_size;
        for (sector, original) in core::mem::take(&mut self.undo) {
            self.data[sector * ss..(sector + 1) * ss].copy_from_slice(&original);
        }
        if let Some((free, next_free)) = self.saved.take() {
            self.free = free;
            self.next_free = next_free;
        }
    }
}

pub(crate) struct Chain<'a> {
    table: &'a FatTable,
    next:  Option<u32>,
    steps: u32,
}

impl Iterator for Chain<'_> {
    type Item = Result<u32, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        let cluster = self.next.take()?;
        if cluster < 2 || cluster > self.table.max_cluster {
            return Some(Err(FsError::Corrupted("cluster number out of range")));
        }
        self.steps += 1;
        if self.steps > self.table.max_cluster {
            return Some(Err(FsError::Corrupted("cluster chain loops")));
        }
        match self.table.entry(cluster) {
            FatEntry::Next(n) => self.next = Some(n),
            FatEntry::EndOfChain => {}
            FatEntry::Free => return Some(Err(FsError::Corrupted("chain runs into a free cluster"))),
            FatEntry::Bad => return Some(Err(FsError::Corrupted("chain runs into a bad cluster"))),
            FatEntry::Reserved => return Some(Err(FsError::Corrupted("chain runs into a reserved value"))),
        }
        Some(Ok(cluster))
    }
}
