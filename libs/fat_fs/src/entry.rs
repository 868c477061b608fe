use alloc::rc::Rc;
use alloc::string::String;
use core::cell::RefCell;

use block_device_api::BlockDevice;

use crate::codec::{Attributes, ShortRecord};
use crate::dir::{DirLocation, Directory, Located};
use crate::file::File;
use crate::fs::Volume;
use crate::lifecycle::Guard;
use crate::time::DateTime;
use crate::FsError;

/// Attribute bits that define what an entry is rather than how it is used.
const STRUCTURAL: Attributes = Attributes::DIRECTORY.union(Attributes::VOLUME_ID);

#[derive(Default, Clone, Copy)]
struct Pending {
    created:    Option<Option<DateTime>>,
    modified:   Option<Option<DateTime>>,
    accessed:   Option<Option<DateTime>>,
    attributes: Option<Attributes>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.created.is_none() && self.modified.is_none() && self.accessed.is_none() && self.attributes.is_none()
    }

    fn apply(&self, rec: &mut ShortRecord) {
        if let Some(t) = self.created {
            rec.set_created(t);
        }
        if let Some(t) = self.modified {
            rec.set_modified(t);
        }
        if let Some(t) = self.accessed {
            rec.set_accessed(t);
        }
        if let Some(attrs) = self.attributes {
            rec.attributes = attrs;
        }
    }
}

/// One name in a directory.
///
/// Metadata is read from the on-disk record on every call, so it reflects
/// writes made through a [`File`] handle. Setters only touch this handle
/// until [`DirEntry::flush`].
pub struct DirEntry<D: BlockDevice> {
    vol:        Rc<RefCell<Volume<D>>>,
    guard:      Guard,
    pos:        u64,
    name:       String,
    short_name: String,
    pending:    RefCell<Pending>,
}

impl<D: BlockDevice> DirEntry<D> {
    pub(crate) fn new(vol_rc: Rc<RefCell<Volume<D>>>, vol: &mut Volume<D>, parent: &Guard, found: Located) -> Self {
        let liveness = vol.registry.node_for(found.pos, parent.liveness());
        Self {
            vol: vol_rc,
            guard: Guard::new(liveness, parent.read_only()),
            pos: found.pos,
            name: found.name(),
            short_name: found.record.display_name(),
            pending: RefCell::new(Pending::default()),
        }
    }

    fn record(&self) -> Result<ShortRecord, FsError> {
        self.guard.check_valid()?;
        let mut rec = self.vol.borrow_mut().read_short(self.pos)?;
        self.pending.borrow().apply(&mut rec);
        Ok(rec)
    }

    pub fn is_valid(&self) -> bool { self.guard.is_valid() }

    /// Long name when there is one, otherwise the short name.
    pub fn name(&self) -> Result<&str, FsError> {
        self.guard.check_valid()?;
        Ok(&self.name)
    }

    /// The 8.3 alias, as `NAME.EXT`.
    pub fn short_name(&self) -> Result<&str, FsError> {
        self.guard.check_valid()?;
        Ok(&self.short_name)
    }

    pub fn attributes(&self) -> Result<Attributes, FsError> {
        Ok(self.record()?.attributes)
    }

    pub fn is_directory(&self) -> Result<bool, FsError> {
        Ok(self.record()?.is_directory())
    }

    pub fn is_file(&self) -> Result<bool, FsError> {
        Ok(!self.record()?.is_directory())
    }

    /// First data cluster, 0 for an empty file.
    pub fn start_cluster(&self) -> Result<u32, FsError> {
        Ok(self.record()?.first_cluster())
    }

    /// Size field for files. Directories have no size field, so theirs is the
    /// space their chain occupies.
    pub fn length(&self) -> Result<u64, FsError> {
        let rec = self.record()?;
        if !rec.is_directory() {
            return Ok(rec.size as u64);
        }
        let vol = self.vol.borrow();
        let clusters = vol.fat.chain_vec(rec.first_cluster())?.len() as u64;
        Ok(clusters * vol.cluster_size() as u64)
    }

    pub fn created(&self) -> Result<Option<DateTime>, FsError> {
        Ok(self.record()?.created())
    }

    pub fn modified(&self) -> Result<Option<DateTime>, FsError> {
        Ok(self.record()?.modified())
    }

    pub fn accessed(&self) -> Result<Option<DateTime>, FsError> {
        Ok(self.record()?.accessed())
    }

    pub fn set_created(&self, time: Option<DateTime>) -> Result<(), FsError> {
        self.guard.check_writable()?;
        self.pending.borrow_mut().created = Some(time);
        Ok(())
    }

    pub fn set_modified(&self, time: Option<DateTime>) -> Result<(), FsError> {
        self.guard.check_writable()?;
        self.pending.borrow_mut().modified = Some(time);
        Ok(())
    }

    pub fn set_accessed(&self, time: Option<DateTime>) -> Result<(), FsError> {
        self.guard.check_writable()?;
        self.pending.borrow_mut().accessed = Some(time);
        Ok(())
    }

    /// Change the read-only, hidden, system and archive bits. The directory
    /// and volume-id bits cannot be changed.
    pub fn set_attributes(&self, attributes: Attributes) -> Result<(), FsError> {
        self.guard.check_writable()?;
        let current = self.record()?.attributes;
        if attributes.intersection(STRUCTURAL) != current.intersection(STRUCTURAL) {
            return Err(FsError::InvalidArgument("directory and volume-id bits are fixed"));
        }
        self.pending.borrow_mut().attributes = Some(attributes);
        Ok(())
    }

    /// Whether setters have run since the last flush.
    pub fn is_dirty(&self) -> bool { !self.pending.borrow().is_empty() }

    /// Write pending metadata over the current on-disk record. Does not
    /// flush the device.
    pub fn flush(&self) -> Result<(), FsError> {
        self.guard.check_valid()?;
        if !self.is_dirty() {
            return Ok(());
        }
        self.guard.check_writable()?;
        let pending = *self.pending.borrow();
        let pos = self.pos;
        self.vol.borrow_mut().transact(|vol| {
            let mut rec = vol.read_short(pos)?;
            pending.apply(&mut rec);
            vol.write_record(pos, &rec.encode())
        })?;
        *self.pending.borrow_mut() = Pending::default();
        Ok(())
    }

    pub fn file(&self) -> Result<File<D>, FsError> {
        if self.record()?.is_directory() {
            return Err(FsError::NotAFile);
        }
        Ok(File::new(self.vol.clone(), self.guard.clone(), self.pos))
    }

    pub fn directory(&self) -> Result<Directory<D>, FsError> {
        let rec = self.record()?;
        if !rec.is_directory() {
            return Err(FsError::NotADirectory);
        }
        let start = rec.first_cluster();
        if !self.vol.borrow().bpb.is_data_cluster(start) {
            return Err(FsError::Corrupted("directory without a cluster"));
        }
        Ok(Directory::new(self.vol.clone(), self.guard.clone(), DirLocation::Chain(start), false))
    }
}
