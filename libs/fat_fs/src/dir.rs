//! Directory storage and the `Directory` handle.
//!
//! A directory is a sequence of 32-byte slots: the fixed root region on
//! FAT12/16, a cluster chain everywhere else. `SlotCursor` hides the
//! difference and everything above it works on slot positions (absolute
//! device offsets).

use alloc::collections::BTreeSet;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use block_device_api::BlockDevice;

use crate::bpb::{BiosParameterBlock, FatType};
use crate::codec::{
    self, Attributes, LongNameBuilder, LongRecord, ShortRecord, DELETED_MARKER, END_MARKER, RECORD_SIZE,
};
use crate::entry::DirEntry;
use crate::fs::Volume;
use crate::lifecycle::Guard;
use crate::table::FatEntry;
use crate::FsError;

const SLOT: u64 = RECORD_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirLocation {
    /// FAT12/16 root directory between the FATs and the data region.
    RootRegion,
    /// First cluster of the directory's chain.
    Chain(u32),
}

impl DirLocation {
    pub(crate) fn root(bpb: &BiosParameterBlock) -> Self {
        match bpb.fat_type {
            FatType::Fat32 => DirLocation::Chain(bpb.root_cluster),
            _ => DirLocation::RootRegion,
        }
    }
}

// ─── Slot cursor ───────────────────────────────────────────────────────────────

pub(crate) struct SlotCursor {
    loc:     DirLocation,
    cluster: u32,
    index:   u32,
    steps:   u32,
    done:    bool,
}

impl SlotCursor {
    pub(crate) fn new(loc: DirLocation) -> Self {
        let cluster = match loc {
            DirLocation::RootRegion => 0,
            DirLocation::Chain(start) => start,
        };
        Self { loc, cluster, index: 0, steps: 0, done: false }
    }

    /// Device offset of the next slot, `None` once the storage is exhausted.
    pub(crate) fn next_pos<D>(&mut self, vol: &Volume<D>) -> Result<Option<u64>, FsError> {
        if self.done {
            return Ok(None);
        }
        let bpb = &vol.bpb;
        let pos = match self.loc {
            DirLocation::RootRegion => {
                if self.index >= bpb.root_entries as u32 {
                    self.done = true;
                    return Ok(None);
                }
                bpb.root_dir_offset() + self.index as u64 * SLOT
            }
            DirLocation::Chain(_) => {
                if self.index == bpb.cluster_size() / RECORD_SIZE as u32 {
                    match vol.fat.entry(self.cluster) {
                        FatEntry::Next(next) => {
                            self.steps += 1;
                            if self.steps > bpb.cluster_count {
                                return Err(FsError::Corrupted("directory chain loops"));
                            }
                            self.cluster = next;
                            self.index = 0;
                        }
                        FatEntry::EndOfChain => {
                            self.done = true;
                            return Ok(None);
                        }
                        _ => return Err(FsError::Corrupted("directory chain is broken")),
                    }
                }
                if !bpb.is_data_cluster(self.cluster) {
                    return Err(FsError::Corrupted("directory cluster out of range"));
                }
                bpb.cluster_offset(self.cluster) + self.index as u64 * SLOT
            }
        };
        self.index += 1;
        Ok(Some(pos))
    }

    /// Cluster of the last slot handed out; the chain tail once exhausted.
    pub(crate) fn cluster(&self) -> u32 { self.cluster }
}

// ─── Record scanner ────────────────────────────────────────────────────────────

/// An entry found in a directory: its short record, where that record lives
/// and the long-name records in front of it.
pub(crate) struct Located {
    pub(crate) record:        ShortRecord,
    pub(crate) pos:           u64,
    pub(crate) long_name:     Option<String>,
    pub(crate) lfn_positions: Vec<u64>,
}

impl Located {
    pub(crate) fn name(&self) -> String {
        self.long_name.clone().unwrap_or_else(|| self.record.display_name())
    }

    fn matches(&self, name: &str) -> bool {
        self.long_name.as_deref().is_some_and(|long| codec::names_match(long, name))
            || codec::names_match(&self.record.display_name(), name)
    }
}

pub(crate) enum Slot {
    End,
    Free,
    Entry(Located),
    /// Long-name part, volume label or dot entry.
    Other,
}

#[derive(Default)]
pub(crate) struct Scanner {
    names:     LongNameBuilder,
    positions: Vec<u64>,
}

impl Scanner {
    fn reset(&mut self) {
        self.names.reset();
        self.positions.clear();
    }

    pub(crate) fn feed(&mut self, pos: u64, raw: &[u8; RECORD_SIZE]) -> Slot {
        match raw[0] {
            END_MARKER => {
                self.reset();
                Slot::End
            }
            DELETED_MARKER => {
                self.reset();
                Slot::Free
            }
            _ if codec::is_long_record(raw) => {
                if let Some(rec) = LongRecord::decode(raw) {
                    self.names.push(&rec);
                    if self.names.is_empty() {
                        self.positions.clear();
                    } else {
                        if rec.is_last() {
                            self.positions.clear();
                        }
                        self.positions.push(pos);
                    }
                }
                Slot::Other
            }
            _ => {
                let record = ShortRecord::decode(raw);
                if record.is_volume_label() || record.is_dot() {
                    self.reset();
                    return Slot::Other;
                }
                let long_name = self.names.finish(record.raw_name());
                let lfn_positions = if long_name.is_some() {
                    core::mem::take(&mut self.positions)
                } else {
                    self.positions.clear();
                    Vec::new()
                };
                Slot::Entry(Located { record, pos, long_name, lfn_positions })
            }
        }
    }
}

// ─── Storage operations ────────────────────────────────────────────────────────

/// Every entry of the directory, in slot order.
pub(crate) fn list<D: BlockDevice>(vol: &mut Volume<D>, loc: DirLocation) -> Result<Vec<Located>, FsError> {
    let mut cursor = SlotCursor::new(loc);
    let mut scanner = Scanner::default();
    let mut out = Vec::new();
    while let Some(pos) = cursor.next_pos(vol)? {
        let raw = vol.read_record(pos)?;
        match scanner.feed(pos, &raw) {
            Slot::End => break,
            Slot::Entry(found) => out.push(found),
            Slot::Free | Slot::Other => {}
        }
    }
    Ok(out)
}

pub(crate) fn find<D: BlockDevice>(vol: &mut Volume<D>, loc: DirLocation, name: &str)
    -> Result<Option<Located>, FsError>
{
    let mut cursor = SlotCursor::new(loc);
    let mut scanner = Scanner::default();
    while let Some(pos) = cursor.next_pos(vol)? {
        let raw = vol.read_record(pos)?;
        match scanner.feed(pos, &raw) {
            Slot::End => break,
            Slot::Entry(found) if found.matches(name) => return Ok(Some(found)),
            _ => {}
        }
    }
    Ok(None)
}

/// Raw name of the volume-label record, if the directory has one.
pub(crate) fn find_volume_label<D: BlockDevice>(vol: &mut Volume<D>, loc: DirLocation)
    -> Result<Option<[u8; 11]>, FsError>
{
    let mut cursor = SlotCursor::new(loc);
    while let Some(pos) = cursor.next_pos(vol)? {
        let raw = vol.read_record(pos)?;
        if raw[0] == END_MARKER {
            break;
        }
        if raw[0] == DELETED_MARKER || codec::is_long_record(&raw) {
            continue;
        }
        let rec = ShortRecord::decode(&raw);
        if rec.is_volume_label() {
            return Ok(Some(rec.name));
        }
    }
    Ok(None)
}

/// Slot map of a directory, used to place new records.
struct Layout {
    slots:  Vec<u64>,
    free:   Vec<bool>,
    /// First byte of each slot.
    first:  Vec<u8>,
    /// Index of the end-of-directory slot.
    end:    Option<usize>,
    tail:   u32,
    short:  BTreeSet<[u8; 11]>,
}

fn layout<D: BlockDevice>(vol: &mut Volume<D>, loc: DirLocation, name: &str) -> Result<Layout, FsError> {
    let mut cursor = SlotCursor::new(loc);
    let mut scanner = Scanner::default();
    let mut l = Layout {
        slots: Vec::new(),
        free: Vec::new(),
        first: Vec::new(),
        end: None,
        tail: 0,
        short: BTreeSet::new(),
    };
    while let Some(pos) = cursor.next_pos(vol)? {
        let raw = vol.read_record(pos)?;
        l.slots.push(pos);
        l.first.push(raw[0]);
        if l.end.is_some() {
            l.free.push(true);
            continue;
        }
        let slot = scanner.feed(pos, &raw);
        l.free.push(matches!(slot, Slot::End | Slot::Free));
        match slot {
            Slot::End => l.end = Some(l.slots.len() - 1),
            Slot::Entry(found) => {
                if found.matches(name) {
                    return Err(FsError::AlreadyExists);
                }
                l.short.insert(found.record.name);
            }
            Slot::Free | Slot::Other => {}
        }
    }
    l.tail = cursor.cluster();
    Ok(l)
}

/// Store `records` in the first run of free slots, growing a chained
/// directory when no run is long enough. Returns the slot of each record.
fn insert<D: BlockDevice>(vol: &mut Volume<D>, loc: DirLocation, mut l: Layout, records: &[[u8; RECORD_SIZE]])
    -> Result<Vec<u64>, FsError>
{
    let needed = records.len();
    let mut start = None;
    let mut run = 0;
    for (i, &free) in l.free.iter().enumerate() {
        run = if free { run + 1 } else { 0 };
        if run == needed {
            start = Some(i + 1 - needed);
            break;
        }
    }

    let start = match (start, loc) {
        (Some(start), _) => start,
        (None, DirLocation::RootRegion) => return Err(FsError::NoSpace),
        (None, DirLocation::Chain(_)) => {
            let old_len = l.slots.len();
            let trailing = l.free.iter().rev().take_while(|&&f| f).count();
            let per_cluster = (vol.cluster_size() / RECORD_SIZE as u32) as usize;
            let clusters = (needed - trailing).div_ceil(per_cluster) as u32;
            let first_new = vol.fat.extend_chain(l.tail, clusters)?;
            let added = vol.fat.chain_vec(first_new)?;
            vol.zero_clusters(&added)?;
            log::debug!("directory grew by {clusters} cluster(s)");
            for c in added {
                let base = vol.bpb.cluster_offset(c);
                for i in 0..per_cluster as u64 {
                    l.slots.push(base + i * SLOT);
                    l.free.push(true);
                    l.first.push(0);
                }
            }
            old_len - trailing
        }
    };

    for (i, raw) in records.iter().enumerate() {
        vol.write_record(l.slots[start + i], raw)?;
    }
    let last = start + needed - 1;
    // Slots past the end marker may hold garbage; keep the directory
    // terminated right after the new records.
    if l.end.is_some_and(|end| last >= end) {
        if let Some(&next) = l.slots.get(last + 1) {
            if l.first[last + 1] != END_MARKER {
                vol.write_record(next, &[0u8; RECORD_SIZE])?;
            }
        }
    }
    Ok(l.slots[start..=last].to_vec())
}

/// Start cluster `..` should record for children of `loc`.
fn parent_link(bpb: &BiosParameterBlock, loc: DirLocation) -> u32 {
    match loc {
        DirLocation::Chain(c) if !(bpb.fat_type == FatType::Fat32 && c == bpb.root_cluster) => c,
        _ => 0,
    }
}

/// Create an entry named `name` in `loc`. Directories get one zeroed cluster
/// seeded with `.` and `..`.
pub(crate) fn add<D: BlockDevice>(vol: &mut Volume<D>, loc: DirLocation, name: &str, directory: bool)
    -> Result<Located, FsError>
{
    codec::validate_name(name)?;
    let l = layout(vol, loc, name)?;

    let (short, nt_flags, long) = match codec::exact_short_name(name) {
        Some((raw, flags)) if !l.short.contains(&raw) => (raw, flags, false),
        _ => (codec::generate_short_name(name, |n| l.short.contains(n))?, 0, true),
    };

    let now = vol.now();
    let attrs = if directory { Attributes::DIRECTORY } else { Attributes::ARCHIVE };
    let mut record = ShortRecord::new(short, attrs);
    record.nt_flags = nt_flags;
    record.set_created(now);
    record.set_modified(now);
    record.set_accessed(now);

    if directory {
        let cluster = vol.fat.allocate_chain(1)?;
        vol.zero_clusters(&[cluster])?;
        let base = vol.bpb.cluster_offset(cluster);
        let dot = ShortRecord::dot(1, cluster, now);
        let dotdot = ShortRecord::dot(2, parent_link(&vol.bpb, loc), now);
        vol.dev.write_at(base, &dot.encode())?;
        vol.dev.write_at(base + SLOT, &dotdot.encode())?;
        record.set_first_cluster(cluster);
    }

    let mut raws = Vec::new();
    let long_name = if long {
        let checksum = codec::lfn_checksum(&short);
        raws.extend(codec::long_records(name, checksum).iter().map(LongRecord::encode));
        Some(String::from(name))
    } else {
        None
    };
    raws.push(record.encode());

    let mut lfn_positions = insert(vol, loc, l, &raws)?;
    let pos = lfn_positions.pop().ok_or(FsError::Corrupted("no slot for short record"))?;
    log::debug!("created {} {name:?}", if directory { "directory" } else { "file" });
    Ok(Located { record, pos, long_name, lfn_positions })
}

/// Remove the entry named `name`, freeing its data and, for a directory,
/// everything below it. Returns the position of the removed short record.
pub(crate) fn remove<D: BlockDevice>(vol: &mut Volume<D>, loc: DirLocation, name: &str) -> Result<u64, FsError> {
    let found = find(vol, loc, name)?.ok_or(FsError::NotFound)?;
    let start = found.record.first_cluster();

    if found.record.is_directory() && start != 0 {
        free_tree(vol, start)?;
    } else if start != 0 {
        vol.fat.free_chain(start)?;
    }

    for &p in found.lfn_positions.iter().chain(core::iter::once(&found.pos)) {
        let mut raw = vol.read_record(p)?;
        raw[0] = DELETED_MARKER;
        vol.write_record(p, &raw)?;
    }
    log::debug!("removed {:?}", found.name());
    Ok(found.pos)
}

/// Free a directory's chain and every chain reachable below it. Chains are
/// collected first so walking never reads a freed cluster.
fn free_tree<D: BlockDevice>(vol: &mut Volume<D>, root: u32) -> Result<(), FsError> {
    let mut pending = vec![root];
    let mut seen = BTreeSet::new();
    let mut chains = Vec::new();
    while let Some(dir) = pending.pop() {
        if !seen.insert(dir) {
            return Err(FsError::Corrupted("directory tree contains a cycle"));
        }
        for child in list(vol, DirLocation::Chain(dir))? {
            let c = child.record.first_cluster();
            if c == 0 {
                continue;
            }
            if child.record.is_directory() {
                pending.push(c);
            } else {
                chains.push(c);
            }
        }
        chains.push(dir);
    }
    for c in chains {
        vol.fat.free_chain(c)?;
    }
    Ok(())
}

// ─── Directory handle ──────────────────────────────────────────────────────────

pub struct Directory<D: BlockDevice> {
    vol:     Rc<RefCell<Volume<D>>>,
    guard:   Guard,
    loc:     DirLocation,
    is_root: bool,
}

impl<D: BlockDevice> Directory<D> {
    pub(crate) fn new(vol: Rc<RefCell<Volume<D>>>, guard: Guard, loc: DirLocation, is_root: bool) -> Self {
        Self { vol, guard, loc, is_root }
    }

    pub fn is_valid(&self) -> bool { self.guard.is_valid() }

    pub fn is_root(&self) -> bool { self.is_root }

    pub fn is_read_only(&self) -> bool { self.guard.read_only() }

    /// Lazy walk over the entries. Each call starts from the first slot.
    pub fn entries(&self) -> Result<Entries<D>, FsError> {
        self.guard.check_valid()?;
        Ok(Entries {
            vol: self.vol.clone(),
            guard: self.guard.clone(),
            cursor: SlotCursor::new(self.loc),
            scanner: Scanner::default(),
            done: false,
        })
    }

    /// Case-insensitive lookup by long or short name.
    pub fn entry(&self, name: &str) -> Result<Option<DirEntry<D>>, FsError> {
        self.guard.check_valid()?;
        let mut vol = self.vol.borrow_mut();
        let found = find(&mut *vol, self.loc, name)?;
        Ok(found.map(|found| DirEntry::new(self.vol.clone(), &mut *vol, &self.guard, found)))
    }

    pub fn add_file(&self, name: &str) -> Result<DirEntry<D>, FsError> {
        self.add(name, false)
    }

    pub fn add_directory(&self, name: &str) -> Result<DirEntry<D>, FsError> {
        self.add(name, true)
    }

    fn add(&self, name: &str, directory: bool) -> Result<DirEntry<D>, FsError> {
        self.guard.check_writable()?;
        let mut vol = self.vol.borrow_mut();
        let loc = self.loc;
        let found = vol.transact(|vol| add(vol, loc, name, directory))?;
        Ok(DirEntry::new(self.vol.clone(), &mut *vol, &self.guard, found))
    }

    /// Delete `name`. Handles to it, and to anything below it, stop working.
    pub fn remove(&self, name: &str) -> Result<(), FsError> {
        self.guard.check_writable()?;
        let mut vol = self.vol.borrow_mut();
        let loc = self.loc;
        let pos = vol.transact(|vol| remove(vol, loc, name))?;
        vol.registry.retire(pos);
        Ok(())
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

/// Iterator returned by [`Directory::entries`].
pub struct Entries<D: BlockDevice> {
    vol:     Rc<RefCell<Volume<D>>>,
    guard:   Guard,
    cursor:  SlotCursor,
    scanner: Scanner,
    done:    bool,
}

impl<D: BlockDevice> Iterator for Entries<D> {
    type Item = Result<DirEntry<D>, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(err) = self.guard.check_valid() {
            self.done = true;
            return Some(Err(err));
        }
        let mut vol = self.vol.borrow_mut();
        loop {
            let step = self.cursor.next_pos(&*vol).and_then(|pos| match pos {
                Some(pos) => vol.read_record(pos).map(|raw| Some((pos, raw))),
                None => Ok(None),
            });
            let (pos, raw) = match step {
                Ok(Some(slot)) => slot,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            match self.scanner.feed(pos, &raw) {
                Slot::End => {
                    self.done = true;
                    return None;
                }
                Slot::Entry(found) => {
                    return Some(Ok(DirEntry::new(self.vol.clone(), &mut *vol, &self.guard, found)));
                }
                Slot::Free | Slot::Other => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{create, FileSystem, FsOptions, NullTimeProvider};
    use alloc::format;
    use alloc::string::ToString;
    use block_device_api::{IoError, MemDisk};

    fn names(dir: &Directory<&mut MemDisk>) -> Vec<String> {
        dir.entries().unwrap().map(|e| e.unwrap().name().unwrap().to_string()).collect()
    }

    // ── lookup ──

    #[test]
    fn lookup_is_case_insensitive_on_both_names() {
        let mut disk = fat16_disk();
        let fs = create(&mut disk, false).unwrap();
        let root = fs.root().unwrap();
        root.add_file("Holiday Photos.zip").unwrap();
        let by_long = root.entry("HOLIDAY PHOTOS.ZIP").unwrap().unwrap();
        assert_eq!(by_long.name().unwrap(), "Holiday Photos.zip");
        assert_eq!(by_long.short_name().unwrap(), "HOLIDA~1.ZIP");
        let by_short = root.entry("holida~1.zip").unwrap().unwrap();
        assert_eq!(by_short.start_cluster().unwrap(), by_long.start_cluster().unwrap());
        assert!(root.entry("Holiday").unwrap().is_none());
    }

    #[test]
    fn entries_restart_and_skip_removed() {
        let mut disk = fat16_disk();
        let fs = create(&mut disk, false).unwrap();
        let root = fs.root().unwrap();
        for name in ["ONE", "TWO", "THREE"] {
            root.add_file(name).unwrap();
        }
        root.remove("TWO").unwrap();
        assert_eq!(names(&root), ["ONE", "THREE"]);
        assert_eq!(names(&root), ["ONE", "THREE"]);
        // the freed slot is reused
        root.add_file("FOUR").unwrap();
        assert_eq!(names(&root), ["ONE", "FOUR", "THREE"]);
    }

    #[test]
    fn lowercase_short_names_keep_their_case() {
        let mut disk = fat16_disk();
        {
            let fs = create(&mut disk, false).unwrap();
            let root = fs.root().unwrap();
            let e = root.add_file("readme.txt").unwrap();
            assert_eq!(e.name().unwrap(), "readme.txt");
            assert_eq!(e.short_name().unwrap(), "readme.txt");
        }
        let fs = create(&mut disk, true).unwrap();
        let root = fs.root().unwrap();
        assert_eq!(names(&root), ["readme.txt"]);
        // no long-name records were needed
        let vol = fs.volume().borrow();
        let at = vol.bpb.root_dir_offset() as usize;
        let region = &vol.dev.data()[at..vol.bpb.data_offset() as usize];
        assert!(region.chunks(RECORD_SIZE).any(|r| &r[..11] == b"README  TXT"));
        assert!(!region.chunks(RECORD_SIZE).any(|r| r[0] != 0 && r[11] == 0x0F));
    }

    // ── add ──

    #[test]
    fn duplicates_and_bad_names_are_rejected() {
        let mut disk = fat16_disk();
        let fs = create(&mut disk, false).unwrap();
        let root = fs.root().unwrap();
        root.add_file("Report.doc").unwrap();
        assert_eq!(root.add_file("REPORT.DOC").err(), Some(FsError::AlreadyExists));
        assert_eq!(root.add_directory("report.doc").err(), Some(FsError::AlreadyExists));
        for bad in ["", ".", "..", "a/b", "what?", "trailing."] {
            assert_eq!(root.add_file(bad).err(), Some(FsError::InvalidName), "{bad:?}");
        }
        assert_eq!(names(&root), ["Report.doc"]);
    }

    #[test]
    fn aliases_count_up() {
        let mut disk = fat16_disk();
        let fs = create(&mut disk, false).unwrap();
        let root = fs.root().unwrap();
        let a = root.add_file("Long file name one.txt").unwrap();
        let b = root.add_file("Long file name two.txt").unwrap();
        assert_eq!(a.short_name().unwrap(), "LONGFI~1.TXT");
        assert_eq!(b.short_name().unwrap(), "LONGFI~2.TXT");
    }

    #[test]
    fn new_directory_has_dot_links() {
        let mut disk = fat16_disk();
        let fs = create(&mut disk, false).unwrap();
        let root = fs.root().unwrap();
        let outer = root.add_directory("OUTER").unwrap();
        let outer_start = outer.start_cluster().unwrap();
        let inner = outer.directory().unwrap().add_directory("INNER").unwrap();
        let inner_start = inner.start_cluster().unwrap();
        assert!(inner.directory().unwrap().entries().unwrap().next().is_none());

        let vol = fs.volume().borrow();
        let read = |cluster: u32, slot: u64| {
            let at = (vol.bpb.cluster_offset(cluster) + slot * SLOT) as usize;
            let mut raw = [0u8; RECORD_SIZE];
            raw.copy_from_slice(&vol.dev.data()[at..at + RECORD_SIZE]);
            ShortRecord::decode(&raw)
        };
        assert_eq!(read(outer_start, 0).first_cluster(), outer_start);
        assert_eq!(read(outer_start, 1).first_cluster(), 0);
        assert_eq!(read(inner_start, 0).first_cluster(), inner_start);
        assert_eq!(read(inner_start, 1).first_cluster(), outer_start);
        assert_eq!(read(inner_start, 2).name[0], END_MARKER);
    }

    #[test]
    fn fixed_root_fills_up() {
        let mut disk = fat12_disk();
        let fs = create(&mut disk, false).unwrap();
        let capacity = fs.geometry().root_entries as usize;
        let root = fs.root().unwrap();
        let mut added = 0;
        loop {
            match root.add_file(&format!("F{added}")) {
                Ok(_) => added += 1,
                Err(err) => {
                    assert_eq!(err, FsError::NoSpace);
                    break;
                }
            }
        }
        // a volume-label record may hold one slot
        assert!(added == capacity || added + 1 == capacity, "{added} of {capacity}");
        let free = fs.free_space().unwrap();
        assert_eq!(root.add_directory("DIR").err(), Some(FsError::NoSpace));
        assert_eq!(fs.free_space().unwrap(), free);
        assert_eq!(root.entries().unwrap().count(), added);
    }

    #[test]
    fn chained_directory_grows() {
        let mut disk = fat32_disk();
        {
            let fs = create(&mut disk, false).unwrap();
            let root = fs.root().unwrap();
            let dir = root.add_directory("Many files").unwrap();
            let per_cluster = fs.cluster_size() as usize / RECORD_SIZE;
            let sub = dir.directory().unwrap();
            // each name takes a long record and a short one
            for i in 0..per_cluster {
                sub.add_file(&format!("Item {i:03}.dat")).unwrap();
            }
            assert!(dir.length().unwrap() > fs.cluster_size() as u64);
            assert_eq!(sub.entries().unwrap().count(), per_cluster);
        }
        let listed = list_via_fatfs_at(&mut disk, "Many files");
        assert!(listed.iter().any(|n| n == "Item 000.dat"));
        assert!(listed.iter().any(|n| n == "Item 005.dat"));
    }

    // ── remove ──

    #[test]
    fn remove_frees_the_whole_tree() {
        let mut disk = fat16_disk();
        let fs = create(&mut disk, false).unwrap();
        let root = fs.root().unwrap();
        let free = fs.free_space().unwrap();
        let top = root.add_directory("TOP").unwrap().directory().unwrap();
        let mid = top.add_directory("MID").unwrap().directory().unwrap();
        mid.add_file("DEEP.BIN").unwrap().file().unwrap().write(0, &[1; 10_000]).unwrap();
        top.add_file("A.TXT").unwrap().file().unwrap().write(0, b"a").unwrap();
        assert!(fs.free_space().unwrap() < free);
        root.remove("top").unwrap();
        assert_eq!(fs.free_space().unwrap(), free);
        assert!(root.entry("TOP").unwrap().is_none());
        assert_eq!(root.remove("TOP").err(), Some(FsError::NotFound));
    }

    #[test]
    fn removal_invalidates_handles_below() {
        let mut disk = fat16_disk();
        let fs = create(&mut disk, false).unwrap();
        let root = fs.root().unwrap();
        let x = root.add_directory("x").unwrap().directory().unwrap();
        let y_entry = x.add_file("y").unwrap();
        let y = y_entry.file().unwrap();
        let x_again = root.entry("X").unwrap().unwrap();
        root.remove("x").unwrap();
        assert!(!x.is_valid());
        assert!(!x_again.is_valid());
        assert_eq!(y.length(), Err(FsError::InvalidState));
        assert_eq!(y_entry.name().err(), Some(FsError::InvalidState));
        assert_eq!(x.add_file("z").err(), Some(FsError::InvalidState));
        assert!(root.is_valid());
    }

    #[test]
    fn removed_long_name_leaves_no_orphans() {
        let mut disk = fat16_disk();
        {
            let fs = create(&mut disk, false).unwrap();
            let root = fs.root().unwrap();
            root.add_file("A rather long name.txt").unwrap();
            root.add_file("KEEP.TXT").unwrap();
            root.remove("a rather long name.TXT").unwrap();
        }
        assert_eq!(list_via_fatfs(&mut disk), ["KEEP.TXT"]);
    }

    // ── interop ──

    #[test]
    fn fatfs_reads_our_tree() {
        let mut disk = fat16_disk();
        {
            let fs = create(&mut disk, false).unwrap();
            let docs = fs.root().unwrap().add_directory("Documents").unwrap().directory().unwrap();
            let f = docs.add_file("Meeting notes.md").unwrap().file().unwrap();
            f.write(0, b"# agenda\n").unwrap();
        }
        assert_eq!(list_via_fatfs(&mut disk), ["Documents"]);
        assert_eq!(read_via_fatfs(&mut disk, "Documents/Meeting notes.md"), b"# agenda\n");
    }

    #[test]
    fn we_read_fatfs_tree() {
        let mut disk = fat32_disk();
        {
            let mut cursor = std::io::Cursor::new(disk.data_mut());
            let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
            let dir = fs.root_dir().create_dir("Music").unwrap();
            use std::io::Write;
            dir.create_file("Track 01 - Intro.flac").unwrap().write_all(b"fLaC").unwrap();
        }
        let fs = create(&mut disk, true).unwrap();
        let music = fs.root().unwrap().entry("music").unwrap().unwrap();
        assert!(music.is_directory().unwrap());
        let music = music.directory().unwrap();
        assert_eq!(names(&music), ["Track 01 - Intro.flac"]);
        let track = music.entry("TRACK 01 - INTRO.FLAC").unwrap().unwrap();
        assert_eq!(track.length().unwrap(), 4);
    }

    // ── read-only ──

    #[test]
    fn read_only_leaves_device_untouched() {
        let mut disk = fat16_disk();
        {
            let fs = create(&mut disk, false).unwrap();
            let root = fs.root().unwrap();
            root.add_directory("SUB").unwrap();
            root.add_file("F.TXT").unwrap().file().unwrap().write(0, b"data").unwrap();
        }
        let snapshot = disk.data().to_vec();
        {
            let fs = create(&mut disk, true).unwrap();
            let root = fs.root().unwrap();
            assert!(root.is_read_only());
            assert_eq!(root.add_file("NEW").err(), Some(FsError::ReadOnly));
            assert_eq!(root.add_directory("NEW").err(), Some(FsError::ReadOnly));
            assert_eq!(root.remove("F.TXT").err(), Some(FsError::ReadOnly));
            let sub = root.entry("SUB").unwrap().unwrap().directory().unwrap();
            assert_eq!(sub.add_file("X").err(), Some(FsError::ReadOnly));
            assert_eq!(root.flush(), Ok(()));
        }
        assert!(disk.data() == &snapshot[..]);
    }

    // ── atomicity ──

    /// Re-run `op` with a write failure injected at every successive write
    /// until it succeeds. After each failure the metadata region, the free
    /// count and the listing must match the state before the call.
    fn assert_atomic(prepare: impl Fn(&Directory<FailingDisk<'_>>), op: impl Fn(&Directory<FailingDisk<'_>>) -> Result<(), FsError>) {
        init_logger();
        let base = {
            let mut disk = fat16_disk();
            {
                let (dev, _) = FailingDisk::new(&mut disk);
                let fs = FileSystem::mount(dev, FsOptions::new().time_provider(NullTimeProvider)).unwrap();
                prepare(&fs.root().unwrap());
            }
            disk.into_inner()
        };
        for fail_after in 0..200 {
            let mut disk = MemDisk::from_vec(base.clone());
            let (dev, armed) = FailingDisk::new(&mut disk);
            let fs = FileSystem::mount(dev, FsOptions::new().time_provider(NullTimeProvider)).unwrap();
            let root = fs.root().unwrap();
            let free = fs.free_space().unwrap();
            let listing: Vec<String> =
                root.entries().unwrap().map(|e| e.unwrap().name().unwrap().to_string()).collect();
            let meta_end = fs.geometry().data_offset() as usize;

            armed.set(Some(fail_after));
            match op(&root) {
                Ok(()) => return,
                Err(err) => assert_eq!(err, FsError::Io(IoError::Media("injected write failure"))),
            }
            assert_eq!(fs.free_space().unwrap(), free, "free space after failure {fail_after}");
            let after: Vec<String> =
                root.entries().unwrap().map(|e| e.unwrap().name().unwrap().to_string()).collect();
            assert_eq!(after, listing);
            let vol = fs.volume().borrow();
            assert!(vol.dev.data()[..meta_end] == base[..meta_end], "metadata changed after failure {fail_after}");
        }
        panic!("operation never succeeded");
    }

    #[test]
    fn failed_add_directory_changes_nothing() {
        assert_atomic(
            |root| {
                root.add_file("EXISTING.TXT").unwrap();
            },
            |root| root.add_directory("A directory with a long name").map(|_| ()),
        );
    }

    #[test]
    fn failed_write_changes_nothing() {
        assert_atomic(
            |root| {
                root.add_file("GROW.BIN").unwrap().file().unwrap().write(0, b"seed").unwrap();
            },
            |root| root.entry("GROW.BIN")?.ok_or(FsError::NotFound)?.file()?.write(0, &[0xCD; 9000]),
        );
    }

    #[test]
    fn failed_remove_changes_nothing() {
        assert_atomic(
            |root| {
                let sub = root.add_directory("Old stuff").unwrap().directory().unwrap();
                sub.add_file("a.bin").unwrap().file().unwrap().write(0, &[1; 5000]).unwrap();
            },
            |root| root.remove("OLD STUFF"),
        );
    }
}
