//! Mounting and the state every handle of one filesystem shares.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use block_device_api::BlockDevice;

use crate::bpb::{BiosParameterBlock, FatType, FsInfo};
use crate::codec::{ShortRecord, RECORD_SIZE};
use crate::dir::{self, DirLocation, Directory};
use crate::lifecycle::{Guard, Liveness, Registry};
use crate::table::FatTable;
use crate::time::{DateTime, TimeProvider};
use crate::FsError;

// ─── Options ───────────────────────────────────────────────────────────────────

pub struct FsOptions {
    read_only:     bool,
    time_provider: Box<dyn TimeProvider>,
}

impl FsOptions {
    pub fn new() -> Self {
        Self { read_only: false, time_provider: default_time_provider() }
    }

    /// Mount without ever writing to the device. Always on for read-only
    /// devices.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn time_provider(mut self, provider: impl TimeProvider + 'static) -> Self {
        self.time_provider = Box::new(provider);
        self
    }
}

impl Default for FsOptions {
    fn default() -> Self { Self::new() }
}

#[cfg(feature = "std")]
fn default_time_provider() -> Box<dyn TimeProvider> {
    Box::new(crate::time::SystemTimeProvider)
}

#[cfg(not(feature = "std"))]
fn default_time_provider() -> Box<dyn TimeProvider> {
    Box::new(crate::time::NullTimeProvider)
}

// ─── Volume ────────────────────────────────────────────────────────────────────

/// Device, geometry and table of a mounted volume. Handles reach it through
/// `Rc<RefCell<_>>` and never hold the borrow across calls.
pub(crate) struct Volume<D> {
    pub(crate) dev:      D,
    pub(crate) bpb:      BiosParameterBlock,
    pub(crate) fat:      FatTable,
    pub(crate) registry: Registry,
    clock:               Box<dyn TimeProvider>,
    /// Set by every successful mutation, cleared when FSInfo is rewritten.
    modified:            bool,
    /// Directory records overwritten by the running operation.
    record_undo:         Vec<(u64, [u8; RECORD_SIZE])>,
}

impl<D: BlockDevice> Volume<D> {
    pub(crate) fn now(&self) -> Option<DateTime> { self.clock.now() }

    pub(crate) fn cluster_size(&self) -> u32 { self.bpb.cluster_size() }

    pub(crate) fn read_record(&mut self, pos: u64) -> Result<[u8; RECORD_SIZE], FsError> {
        let mut raw = [0u8; RECORD_SIZE];
        self.dev.read_at(pos, &mut raw)?;
        Ok(raw)
    }

    pub(crate) fn read_short(&mut self, pos: u64) -> Result<ShortRecord, FsError> {
        Ok(ShortRecord::decode(&self.read_record(pos)?))
    }

    /// Overwrite a directory slot, remembering its old bytes until the
    /// running operation commits.
    pub(crate) fn write_record(&mut self, pos: u64, raw: &[u8; RECORD_SIZE]) -> Result<(), FsError> {
        if !self.record_undo.iter().any(|(p, _)| *p == pos) {
            let old = self.read_record(pos)?;
            self.record_undo.push((pos, old));
        }
        self.dev.write_at(pos, raw)?;
        Ok(())
    }

    pub(crate) fn zero_clusters(&mut self, clusters: &[u32]) -> Result<(), FsError> {
        let zeros = vec![0u8; self.cluster_size() as usize];
        for &c in clusters {
            self.dev.write_at(self.bpb.cluster_offset(c), &zeros)?;
        }
        Ok(())
    }

    /// Run one mutating operation. On success the FAT is committed to every
    /// copy; on any failure the table is rolled back and overwritten directory
    /// records are put back, so the volume structure is as it was before.
    pub(crate) fn transact<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, FsError>) -> Result<T, FsError> {
        self.record_undo.clear();
        let result = op(self).and_then(|value| {
            self.fat.commit(&mut self.dev, &self.bpb)?;
            Ok(value)
        });
        match result {
            Ok(value) => {
                self.record_undo.clear();
                self.modified = true;
                Ok(value)
            }
            Err(err) => {
                self.fat.rollback();
                for (pos, raw) in core::mem::take(&mut self.record_undo).into_iter().rev() {
                    if let Err(restore) = self.dev.write_at(pos, &raw) {
                        log::error!("could not restore directory record at {pos:#x}: {restore}");
                    }
                }
                log::debug!("operation rolled back: {err}");
                Err(err)
            }
        }
    }

    fn write_fs_info(&mut self) -> Result<(), FsError> {
        if self.bpb.fat_type != FatType::Fat32 || self.bpb.fs_info_sector == 0 {
            return Ok(());
        }
        let offset = self.bpb.sector_offset(self.bpb.fs_info_sector as u64);
        let mut sector = [0u8; 512];
        self.dev.read_at(offset, &mut sector)?;
        let info = FsInfo {
            free_cluster_count: Some(self.fat.free_count()),
            next_free_cluster:  Some(self.fat.next_free_hint()),
        };
        info.write(&mut sector);
        self.dev.write_at(offset, &sector)?;
        Ok(())
    }
}

// ─── FileSystem ────────────────────────────────────────────────────────────────

/// A mounted FAT volume.
///
/// Single-threaded: handles share the volume through `Rc`, so none of them
/// are `Send`. Attaching two filesystems to one device is not detected and
/// will corrupt it.
pub struct FileSystem<D: BlockDevice> {
    vol:       Rc<RefCell<Volume<D>>>,
    root:      Rc<Liveness>,
    bpb:       BiosParameterBlock,
    read_only: bool,
    closed:    bool,
}

impl<D: BlockDevice> FileSystem<D> {
    pub fn mount(mut dev: D, options: FsOptions) -> Result<Self, FsError> {
        if dev.size() < 512 {
            return Err(FsError::UnknownFormat("device smaller than a boot sector"));
        }
        let mut boot = [0u8; 512];
        dev.read_at(0, &mut boot)?;
        let bpb = BiosParameterBlock::parse(&boot)?;
        if bpb.volume_size() > dev.size() {
            return Err(FsError::UnknownFormat("volume larger than device"));
        }
        let read_only = options.read_only || dev.is_read_only();

        let mut fat = FatTable::load(&mut dev, &bpb)?;
        if bpb.fat_type == FatType::Fat32 && bpb.fs_info_sector != 0 {
            let mut sector = [0u8; 512];
            dev.read_at(bpb.sector_offset(bpb.fs_info_sector as u64), &mut sector)?;
            match FsInfo::parse(&sector) {
                Some(info) => {
                    if let Some(free) = info.free_cluster_count.filter(|&f| f != fat.free_count()) {
                        log::warn!("FSInfo free count {free} is stale, FAT has {}", fat.free_count());
                    }
                    if let Some(hint) = info.next_free_cluster {
                        fat.set_next_free_hint(hint);
                    }
                }
                None => log::warn!("FSInfo sector {} has bad signatures, ignoring it", bpb.fs_info_sector),
            }
        }

        log::info!(
            "mounted {:?} volume: {} clusters of {} bytes, {} free{}",
            bpb.fat_type,
            bpb.cluster_count,
            bpb.cluster_size(),
            fat.free_count(),
            if read_only { ", read-only" } else { "" },
        );
        log::debug!(
            "geometry: {} B/sector, {} reserved, {} FATs of {} sectors, {} root entries, data at {:#x}",
            bpb.bytes_per_sector,
            bpb.reserved_sectors,
            bpb.fats,
            bpb.sectors_per_fat,
            bpb.root_entries,
            bpb.data_offset(),
        );

        let vol = Volume {
            dev,
            bpb,
            fat,
            registry: Registry::default(),
            clock: options.time_provider,
            modified: false,
            record_undo: Vec::new(),
        };
        Ok(Self { vol: Rc::new(RefCell::new(vol)), root: Liveness::root(), bpb, read_only, closed: false })
    }

    fn check_open(&self) -> Result<(), FsError> {
        if self.closed { Err(FsError::Closed) } else { Ok(()) }
    }

    pub fn root(&self) -> Result<Directory<D>, FsError> {
        self.check_open()?;
        let guard = Guard::new(self.root.clone(), self.read_only);
        Ok(Directory::new(self.vol.clone(), guard, DirLocation::root(&self.bpb), true))
    }

    /// Bytes in the data region.
    pub fn total_space(&self) -> Result<u64, FsError> {
        self.check_open()?;
        Ok(self.bpb.cluster_count as u64 * self.bpb.cluster_size() as u64)
    }

    /// Bytes in free clusters.
    pub fn free_space(&self) -> Result<u64, FsError> {
        self.check_open()?;
        Ok(self.vol.borrow().fat.free_count() as u64 * self.bpb.cluster_size() as u64)
    }

    /// FAT reserves nothing for privileged writers, so this equals
    /// `free_space`.
    pub fn usable_space(&self) -> Result<u64, FsError> {
        self.free_space()
    }

    pub fn fat_type(&self) -> FatType { self.bpb.fat_type }

    pub fn cluster_size(&self) -> u32 { self.bpb.cluster_size() }

    pub fn geometry(&self) -> &BiosParameterBlock { &self.bpb }

    /// Label from the root directory's volume record, falling back to the
    /// boot sector. `NO NAME` counts as no label.
    pub fn volume_label(&self) -> Result<Option<String>, FsError> {
        self.check_open()?;
        let mut vol = self.vol.borrow_mut();
        let raw = match dir::find_volume_label(&mut *vol, DirLocation::root(&self.bpb))? {
            Some(raw) => Some(raw),
            None => self.bpb.volume_label,
        };
        Ok(raw.and_then(|raw| {
            let label: String = raw.iter().map(|&b| b as char).collect();
            let label = label.trim_end();
            (!label.is_empty() && label != "NO NAME").then(|| String::from(label))
        }))
    }

    pub fn is_read_only(&self) -> bool { self.read_only }

    pub fn is_closed(&self) -> bool { self.closed }

    #[cfg(test)]
    pub(crate) fn volume(&self) -> &Rc<RefCell<Volume<D>>> { &self.vol }

    /// Write pending table state and FSInfo hints, then flush the device.
    pub fn flush(&mut self) -> Result<(), FsError> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        let mut vol = self.vol.borrow_mut();
        let vol = &mut *vol;
        vol.fat.commit(&mut vol.dev, &vol.bpb)?;
        if vol.modified {
            vol.write_fs_info()?;
            vol.modified = false;
        }
        vol.dev.flush()?;
        Ok(())
    }

    /// Flush (unless read-only) and retire every handle. Closing twice is a
    /// no-op. The device itself stays open and belongs to the caller. A
    /// failed flush leaves the filesystem open.
    pub fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.root.invalidate();
        self.closed = true;
        log::info!("closed {:?} volume", self.bpb.fat_type);
        Ok(())
    }
}

impl<D: BlockDevice> Drop for FileSystem<D> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("closing filesystem on drop failed: {err}");
        }
    }
}

/// Mount the FAT volume on `device`.
pub fn create<D: BlockDevice>(device: D, read_only: bool) -> Result<FileSystem<D>, FsError> {
    FileSystem::mount(device, FsOptions::new().read_only(read_only))
}
