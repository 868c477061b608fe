//! Writing a fresh FAT volume onto a device.
//!
//! The FAT type follows from the cluster count, so a requested type is met by
//! searching for a cluster size that lands the count in that type's range.
//! Sectors per FAT are found by iterating until the table covers every
//! cluster that remains once the table itself is carved out.

use alloc::vec;
use alloc::vec::Vec;

use block_device_api::BlockDevice;

use crate::bpb::{FatType, FsInfo, MediaDescriptor, BOOT_SIGNATURE, DIR_ENTRY_SIZE};
use crate::codec::{ShortRecord, DELETED_MARKER, END_MARKER};
use crate::FsError;

const MIB: u64 = 1024 * 1024;
const FAT32_RESERVED_SECTORS: u16 = 32;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FS_INFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;
const MAX_CLUSTER_BYTES: u32 = 32 * 1024;
const NO_NAME: &[u8; 11] = b"NO NAME    ";

// ─── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FormatOptions {
    fat_type:            Option<FatType>,
    bytes_per_sector:    u16,
    sectors_per_cluster: Option<u8>,
    fats:                u8,
    root_entries:        u16,
    media:               MediaDescriptor,
    volume_id:           u32,
    volume_label:        Option<[u8; 11]>,
}

impl FormatOptions {
    pub fn new() -> Self {
        Self {
            fat_type: None,
            bytes_per_sector: 512,
            sectors_per_cluster: None,
            fats: 2,
            root_entries: 512,
            media: MediaDescriptor::Fixed,
            volume_id: 0,
            volume_label: None,
        }
    }

    /// Force a FAT width instead of picking one from the device size.
    pub fn fat_type(mut self, fat_type: FatType) -> Self {
        self.fat_type = Some(fat_type);
        self
    }

    pub fn bytes_per_sector(mut self, bytes: u16) -> Self {
        self.bytes_per_sector = bytes;
        self
    }

    pub fn sectors_per_cluster(mut self, sectors: u8) -> Self {
        self.sectors_per_cluster = Some(sectors);
        self
    }

    pub fn fats(mut self, fats: u8) -> Self {
        self.fats = fats;
        self
    }

    /// Fixed root directory capacity for FAT12/16, rounded up to whole
    /// sectors. Ignored on FAT32.
    pub fn root_entries(mut self, entries: u16) -> Self {
        self.root_entries = entries;
        self
    }

    pub fn media(mut self, media: MediaDescriptor) -> Self {
        self.media = media;
        self
    }

    pub fn volume_id(mut self, id: u32) -> Self {
        self.volume_id = id;
        self
    }

    /// Space-padded label, stored in the boot sector and as a root record.
    pub fn volume_label(mut self, label: [u8; 11]) -> Self {
        self.volume_label = Some(label);
        self
    }
}

impl Default for FormatOptions {
    fn default() -> Self { Self::new() }
}

// ─── Layout ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Layout {
    fat_type:            FatType,
    sectors_per_cluster: u8,
    reserved_sectors:    u16,
    root_entries:        u16,
    root_dir_sectors:    u32,
    total_sectors:       u32,
    sectors_per_fat:     u32,
    cluster_count:       u32,
}

impl Layout {
    /// Geometry for `fat_type` with `spc` sectors per cluster, or `None`
    /// when the device does not give a cluster count in the type's range.
    fn plan(opts: &FormatOptions, total_sectors: u32, fat_type: FatType, spc: u8) -> Option<Self> {
        let bps = opts.bytes_per_sector as u32;
        let (reserved_sectors, root_entries) = match fat_type {
            FatType::Fat32 => (FAT32_RESERVED_SECTORS, 0),
            _ => {
                let per_sector = bps / DIR_ENTRY_SIZE;
                let rounded = (opts.root_entries as u32).div_ceil(per_sector) * per_sector;
                (1, u16::try_from(rounded).ok()?)
            }
        };
        let root_dir_sectors = root_entries as u32 * DIR_ENTRY_SIZE / bps;
        let fixed = reserved_sectors as u32 + root_dir_sectors;

        let mut sectors_per_fat = 1u32;
        let cluster_count = loop {
            let table = (opts.fats as u32).checked_mul(sectors_per_fat)?;
            let data = total_sectors.checked_sub(fixed)?.checked_sub(table)?;
            let clusters = data / spc as u32;
            let needed = fat_type.table_bytes(clusters + 2).div_ceil(bps as u64) as u32;
            if needed <= sectors_per_fat {
                break clusters;
            }
            sectors_per_fat = needed;
        };

        if cluster_count == 0
            || FatType::from_cluster_count(cluster_count) != fat_type
            || cluster_count > fat_type.max_clusters()
        {
            return None;
        }
        Some(Self {
            fat_type,
            sectors_per_cluster: spc,
            reserved_sectors,
            root_entries,
            root_dir_sectors,
            total_sectors,
            sectors_per_fat,
            cluster_count,
        })
    }
}

/// FAT width for a device when none is requested.
fn default_fat_type(total_bytes: u64) -> FatType {
    if total_bytes < 4 * MIB {
        FatType::Fat12
    } else if total_bytes < 512 * MIB {
        FatType::Fat16
    } else {
        FatType::Fat32
    }
}

/// Customary cluster size for a volume of `total_bytes`.
fn preferred_cluster_bytes(fat_type: FatType, total_bytes: u64) -> u32 {
    match fat_type {
        FatType::Fat12 => 512,
        FatType::Fat16 => match total_bytes {
            b if b <= 32 * MIB => 512,
            b if b <= 64 * MIB => 1024,
            b if b <= 128 * MIB => 2048,
            b if b <= 256 * MIB => 4096,
            b if b <= 512 * MIB => 8192,
            b if b <= 1024 * MIB => 16384,
            _ => 32768,
        },
        FatType::Fat32 => match total_bytes {
            b if b <= 260 * MIB => 512,
            b if b <= 8192 * MIB => 4096,
            b if b <= 16384 * MIB => 8192,
            b if b <= 32768 * MIB => 16384,
            _ => 32768,
        },
    }
}

fn choose_layout(opts: &FormatOptions, total_sectors: u32) -> Result<Layout, FsError> {
    let bps = opts.bytes_per_sector as u32;
    let fat_type = opts.fat_type.unwrap_or_else(|| default_fat_type(total_sectors as u64 * bps as u64));

    if let Some(spc) = opts.sectors_per_cluster {
        if !spc.is_power_of_two() {
            return Err(FsError::InvalidArgument("sectors per cluster must be a power of two"));
        }
        return Layout::plan(opts, total_sectors, fat_type, spc)
            .ok_or(FsError::InvalidArgument("cluster size does not fit the FAT type on this device"));
    }

    // Prefer the customary size, then larger clusters, then smaller ones.
    let max_shift = (MAX_CLUSTER_BYTES / bps).max(1).trailing_zeros();
    let preferred = (preferred_cluster_bytes(fat_type, total_sectors as u64 * bps as u64) / bps).max(1);
    let start = preferred.trailing_zeros().min(max_shift);
    (start..=max_shift)
        .chain((0..start).rev())
        .find_map(|shift| Layout::plan(opts, total_sectors, fat_type, 1u8 << shift))
        .ok_or(FsError::InvalidArgument("device size does not suit the FAT type"))
}

// ─── Writing ───────────────────────────────────────────────────────────────────

fn boot_sector(opts: &FormatOptions, l: &Layout) -> Vec<u8> {
    let mut b = vec![0u8; opts.bytes_per_sector as usize];
    let fat32 = l.fat_type == FatType::Fat32;
    let jump: [u8; 3] = if fat32 { [0xEB, 0x58, 0x90] } else { [0xEB, 0x3C, 0x90] };
    b[0..3].copy_from_slice(&jump);
    b[3..11].copy_from_slice(b"MSWIN4.1");
    b[11..13].copy_from_slice(&opts.bytes_per_sector.to_le_bytes());
    b[13] = l.sectors_per_cluster;
    b[14..16].copy_from_slice(&l.reserved_sectors.to_le_bytes());
    b[16] = opts.fats;
    b[17..19].copy_from_slice(&l.root_entries.to_le_bytes());
    match u16::try_from(l.total_sectors) {
        Ok(small) if !fat32 => b[19..21].copy_from_slice(&small.to_le_bytes()),
        _ => b[32..36].copy_from_slice(&l.total_sectors.to_le_bytes()),
    }
    b[21] = opts.media.into();
    b[24..26].copy_from_slice(&63u16.to_le_bytes());
    b[26..28].copy_from_slice(&255u16.to_le_bytes());

    let ext = if fat32 {
        b[36..40].copy_from_slice(&l.sectors_per_fat.to_le_bytes());
        b[44..48].copy_from_slice(&FAT32_ROOT_CLUSTER.to_le_bytes());
        b[48..50].copy_from_slice(&FS_INFO_SECTOR.to_le_bytes());
        b[50..52].copy_from_slice(&BACKUP_BOOT_SECTOR.to_le_bytes());
        64
    } else {
        // FAT12/16 tables never reach 65536 sectors
        b[22..24].copy_from_slice(&(l.sectors_per_fat as u16).to_le_bytes());
        36
    };
    b[ext] = if opts.media == MediaDescriptor::Fixed { 0x80 } else { 0x00 };
    b[ext + 2] = 0x29;
    b[ext + 3..ext + 7].copy_from_slice(&opts.volume_id.to_le_bytes());
    b[ext + 7..ext + 18].copy_from_slice(opts.volume_label.as_ref().unwrap_or(NO_NAME));
    b[ext + 18..ext + 26].copy_from_slice(l.fat_type.label());
    b[510..512].copy_from_slice(&BOOT_SIGNATURE);
    b
}

/// Entries 0 and 1 (and the FAT32 root cluster) at the start of each FAT.
fn fat_head(media: MediaDescriptor, fat_type: FatType) -> Vec<u8> {
    let media: u8 = media.into();
    match fat_type {
        FatType::Fat12 => vec![media, 0xFF, 0xFF],
        FatType::Fat16 => vec![media, 0xFF, 0xFF, 0xFF],
        FatType::Fat32 => {
            let mut head = Vec::with_capacity(12);
            head.extend_from_slice(&(0x0FFF_FF00 | media as u32).to_le_bytes());
            head.extend_from_slice(&fat_type.eoc().to_le_bytes());
            head.extend_from_slice(&fat_type.eoc().to_le_bytes());
            head
        }
    }
}

fn zero_fill<D: BlockDevice>(dev: &mut D, offset: u64, len: u64) -> Result<(), FsError> {
    let chunk = vec![0u8; len.min(64 * 1024) as usize];
    let mut done = 0;
    while done < len {
        let step = (len - done).min(chunk.len() as u64);
        dev.write_at(offset + done, &chunk[..step as usize])?;
        done += step;
    }
    Ok(())
}

/// Write an empty FAT volume covering the whole device.
///
/// Data clusters are left as they are; only the boot area, the FATs and the
/// root directory are initialised.
pub fn format_volume<D: BlockDevice>(mut dev: D, options: FormatOptions) -> Result<(), FsError> {
    if dev.is_read_only() {
        return Err(FsError::ReadOnly);
    }
    let bps = options.bytes_per_sector;
    if !matches!(bps, 512 | 1024 | 2048 | 4096) {
        return Err(FsError::InvalidArgument("bytes per sector must be 512, 1024, 2048 or 4096"));
    }
    if options.fats == 0 {
        return Err(FsError::InvalidArgument("at least one FAT is required"));
    }
    if let Some(label) = options.volume_label {
        if label[0] == END_MARKER || label[0] == DELETED_MARKER || label[0] == b' ' {
            return Err(FsError::InvalidArgument("volume label cannot start with that byte"));
        }
    }
    let total_sectors = u32::try_from(dev.size() / bps as u64).unwrap_or(u32::MAX);
    let l = choose_layout(&options, total_sectors)?;

    let sector = |n: u64| n * bps as u64;
    let fat_bytes = sector(l.sectors_per_fat as u64);
    let fat_start = sector(l.reserved_sectors as u64);
    let root_start = fat_start + options.fats as u64 * fat_bytes;
    let data_start = root_start + sector(l.root_dir_sectors as u64);
    let cluster_bytes = sector(l.sectors_per_cluster as u64);

    zero_fill(&mut dev, 0, fat_start)?;
    let boot = boot_sector(&options, &l);
    dev.write_at(0, &boot)?;

    if l.fat_type == FatType::Fat32 {
        let mut info_sector = vec![0u8; bps as usize];
        FsInfo {
            free_cluster_count: Some(l.cluster_count - 1),
            next_free_cluster:  Some(FAT32_ROOT_CLUSTER + 1),
        }
        .write(&mut info_sector);
        dev.write_at(sector(FS_INFO_SECTOR as u64), &info_sector)?;
        dev.write_at(sector(BACKUP_BOOT_SECTOR as u64), &boot)?;
        dev.write_at(sector(BACKUP_BOOT_SECTOR as u64 + 1), &info_sector)?;
    }

    let head = fat_head(options.media, l.fat_type);
    for copy in 0..options.fats as u64 {
        let at = fat_start + copy * fat_bytes;
        zero_fill(&mut dev, at, fat_bytes)?;
        dev.write_at(at, &head)?;
    }

    let root_at = match l.fat_type {
        FatType::Fat32 => {
            zero_fill(&mut dev, data_start, cluster_bytes)?;
            data_start
        }
        _ => {
            zero_fill(&mut dev, root_start, sector(l.root_dir_sectors as u64))?;
            root_start
        }
    };
    if let Some(label) = options.volume_label {
        dev.write_at(root_at, &ShortRecord::volume_label(label).encode())?;
    }
    dev.flush()?;

    log::info!(
        "formatted {:?} volume: {} clusters of {} bytes, {} sectors per FAT",
        l.fat_type,
        l.cluster_count,
        cluster_bytes,
        l.sectors_per_fat,
    );
    Ok(())
}
