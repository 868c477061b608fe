//! Boot sector, BIOS Parameter Block and FAT32 FSInfo.
//!
//! Fields are decoded from their fixed little-endian offsets rather than by
//! casting the sector to a packed struct, so the parser never reads unaligned
//! memory and works on any buffer.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::FsError;

pub(crate) const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub(crate) const DIR_ENTRY_SIZE: u32 = 32;

// ─── FAT width ─────────────────────────────────────────────────────────────────

/// FAT width, derived from the cluster count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Microsoft's thresholds: fewer than 4085 clusters is FAT12, fewer than
    /// 65525 is FAT16, anything else FAT32.
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < 4085 {
            FatType::Fat12
        } else if clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    pub fn entry_bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }

    /// Bits of an entry that carry the value (FAT32 keeps 4 reserved bits).
    pub(crate) fn mask(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub(crate) fn bad_cluster(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }

    /// Smallest end-of-chain value; everything up to `mask()` ends a chain.
    pub(crate) fn eoc_min(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// End-of-chain value written by this implementation.
    pub(crate) fn eoc(self) -> u32 { self.mask() }

    /// Largest cluster count the width can address.
    pub(crate) fn max_clusters(self) -> u32 {
        match self {
            FatType::Fat12 => 4084,
            FatType::Fat16 => 65524,
            FatType::Fat32 => 0x0FFF_FFF5,
        }
    }

    /// Bytes needed to hold `entries` table entries.
    pub(crate) fn table_bytes(self, entries: u32) -> u64 {
        let entries = entries as u64;
        match self {
            FatType::Fat12 => (entries * 3 + 1) / 2,
            FatType::Fat16 => entries * 2,
            FatType::Fat32 => entries * 4,
        }
    }

    pub(crate) fn label(self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
            FatType::Fat32 => b"FAT32   ",
        }
    }
}

// ─── Media descriptor ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MediaDescriptor {
    Removable  = 0xF0,
    Fixed      = 0xF8,
    Floppy720  = 0xF9,
    Floppy320  = 0xFA,
    Floppy640  = 0xFB,
    Floppy180  = 0xFC,
    Floppy360  = 0xFD,
    Floppy160  = 0xFE,
    Floppy320D = 0xFF,
}

// ─── BIOS Parameter Block ──────────────────────────────────────────────────────

/// Volume geometry, parsed once at mount and immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct BiosParameterBlock {
    pub bytes_per_sector:    u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors:    u16,
    pub fats:                u8,
    /// Fixed root directory capacity; 0 on FAT32.
    pub root_entries:        u16,
    pub total_sectors:       u32,
    pub sectors_per_fat:     u32,
    pub media:               MediaDescriptor,
    pub hidden_sectors:      u32,
    /// FAT32 only: first cluster of the root directory.
    pub root_cluster:        u32,
    /// FAT32 only: sector of the FSInfo structure (0 when absent).
    pub fs_info_sector:      u16,
    /// FAT32 only: the FAT that is authoritative when mirroring is disabled.
    pub active_fat:          Option<u8>,
    pub volume_id:           Option<u32>,
    pub volume_label:        Option<[u8; 11]>,
    pub fat_type:            FatType,
    pub cluster_count:       u32,
    pub root_dir_sectors:    u32,
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

impl BiosParameterBlock {
    pub fn parse(boot: &[u8]) -> Result<Self, FsError> {
        if boot.len() < 512 {
            return Err(FsError::UnknownFormat("boot sector too small"));
        }
        if boot[510..512] != BOOT_SIGNATURE {
            return Err(FsError::UnknownFormat("missing boot signature"));
        }

        let bytes_per_sector = le16(boot, 11);
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FsError::UnknownFormat("invalid bytes per sector"));
        }
        let sectors_per_cluster = boot[13];
        if !sectors_per_cluster.is_power_of_two() {
            return Err(FsError::UnknownFormat("invalid sectors per cluster"));
        }
        let reserved_sectors = le16(boot, 14);
        if reserved_sectors == 0 {
            return Err(FsError::UnknownFormat("no reserved sectors"));
        }
        let fats = boot[16];
        if fats == 0 {
            return Err(FsError::UnknownFormat("no FAT copies"));
        }
        let root_entries = le16(boot, 17);
        let total_sectors = match le16(boot, 19) {
            0 => le32(boot, 32),
            v => v as u32,
        };
        if total_sectors == 0 {
            return Err(FsError::UnknownFormat("zero total sectors"));
        }
        let media = MediaDescriptor::try_from(boot[21])
            .map_err(|_| FsError::UnknownFormat("invalid media descriptor"))?;
        let fat_size_16 = le16(boot, 22);
        let sectors_per_fat = match fat_size_16 {
            0 => le32(boot, 36),
            v => v as u32,
        };
        if sectors_per_fat == 0 {
            return Err(FsError::UnknownFormat("zero sectors per FAT"));
        }
        let hidden_sectors = le32(boot, 28);

        let bps = bytes_per_sector as u32;
        let root_dir_sectors = (root_entries as u32 * DIR_ENTRY_SIZE + bps - 1) / bps;
        let system_sectors = (reserved_sectors as u64)
            + fats as u64 * sectors_per_fat as u64
            + root_dir_sectors as u64;
        let data_sectors = (total_sectors as u64)
            .checked_sub(system_sectors)
            .ok_or(FsError::UnknownFormat("metadata larger than volume"))?;
        let cluster_count = (data_sectors / sectors_per_cluster as u64) as u32;
        if cluster_count == 0 {
            return Err(FsError::UnknownFormat("no data clusters"));
        }
        let fat_type = FatType::from_cluster_count(cluster_count);

        let table_bytes = fat_type.table_bytes(cluster_count + 2);
        if table_bytes > sectors_per_fat as u64 * bps as u64 {
            return Err(FsError::UnknownFormat("FAT too small for cluster count"));
        }

        let mut bpb = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fats,
            root_entries,
            total_sectors,
            sectors_per_fat,
            media,
            hidden_sectors,
            root_cluster: 0,
            fs_info_sector: 0,
            active_fat: None,
            volume_id: None,
            volume_label: None,
            fat_type,
            cluster_count,
            root_dir_sectors,
        };

        let ext_offset = if fat_type == FatType::Fat32 {
            if root_entries != 0 || fat_size_16 != 0 {
                return Err(FsError::UnknownFormat("FAT32 volume with FAT16 fields"));
            }
            if le16(boot, 42) != 0 {
                return Err(FsError::UnknownFormat("unsupported FAT32 version"));
            }
            let ext_flags = le16(boot, 40);
            if ext_flags & 0x80 != 0 {
                let active = (ext_flags & 0x0F) as u8;
                if active >= fats {
                    return Err(FsError::UnknownFormat("active FAT out of range"));
                }
                bpb.active_fat = Some(active);
            }
            bpb.root_cluster = le32(boot, 44);
            if bpb.root_cluster < 2 || bpb.root_cluster > bpb.max_cluster() {
                return Err(FsError::UnknownFormat("root cluster out of range"));
            }
            bpb.fs_info_sector = match le16(boot, 48) {
                0xFFFF => 0,
                s if s >= reserved_sectors => 0,
                s => s,
            };
            64
        } else {
            if root_entries == 0 {
                return Err(FsError::UnknownFormat("FAT12/16 volume without root directory"));
            }
            36
        };

        // Extended boot signature: volume id and label are only meaningful
        // when it is present.
        if boot[ext_offset + 2] == 0x29 {
            bpb.volume_id = Some(le32(boot, ext_offset + 3));
            let mut label = [0u8; 11];
            label.copy_from_slice(&boot[ext_offset + 7..ext_offset + 18]);
            bpb.volume_label = Some(label);
        }

        Ok(bpb)
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// Highest valid cluster number.
    pub fn max_cluster(&self) -> u32 { self.cluster_count + 1 }

    pub(crate) fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.max_cluster()
    }

    pub(crate) fn sector_offset(&self, sector: u64) -> u64 {
        sector * self.bytes_per_sector as u64
    }

    pub(crate) fn fat_len(&self) -> u64 {
        self.sector_offset(self.sectors_per_fat as u64)
    }

    /// Device offset of FAT copy `index`.
    pub(crate) fn fat_offset(&self, index: u8) -> u64 {
        self.sector_offset(self.reserved_sectors as u64 + index as u64 * self.sectors_per_fat as u64)
    }

    /// Fixed FAT12/16 root region.
    pub(crate) fn root_dir_offset(&self) -> u64 {
        self.fat_offset(self.fats)
    }

    pub(crate) fn data_offset(&self) -> u64 {
        self.root_dir_offset() + self.sector_offset(self.root_dir_sectors as u64)
    }

    pub(crate) fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.cluster_size() as u64
    }

    /// Bytes the volume claims on its device.
    pub fn volume_size(&self) -> u64 {
        self.sector_offset(self.total_sectors as u64)
    }
}

// ─── FSInfo ────────────────────────────────────────────────────────────────────

const FSINFO_LEAD_SIG:   u32 = 0x4161_5252;
const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIG:  u32 = 0xAA55_0000;
const FSINFO_UNKNOWN:    u32 = 0xFFFF_FFFF;

/// FAT32 allocation hints. Both values may be stale and are never trusted
/// for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsInfo {
    pub free_cluster_count: Option<u32>,
    pub next_free_cluster:  Option<u32>,
}

impl FsInfo {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 512 {
            return None;
        }
        if le32(buf, 0) != FSINFO_LEAD_SIG
            || le32(buf, 0x1E4) != FSINFO_STRUCT_SIG
            || le32(buf, 0x1FC) != FSINFO_TRAIL_SIG
        {
            return None;
        }
        let known = |v: u32| if v == FSINFO_UNKNOWN { None } else { Some(v) };
        Some(Self {
            free_cluster_count: known(le32(buf, 0x1E8)),
            next_free_cluster:  known(le32(buf, 0x1EC)),
        })
    }

    /// Serialize into the first 512 bytes of `buf`, leaving the reserved
    /// areas as they are.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&FSINFO_LEAD_SIG.to_le_bytes());
        buf[0x1E4..0x1E8].copy_from_slice(&FSINFO_STRUCT_SIG.to_le_bytes());
        buf[0x1E8..0x1EC]
            .copy_from_slice(&self.free_cluster_count.unwrap_or(FSINFO_UNKNOWN).to_le_bytes());
        buf[0x1EC..0x1F0]
            .copy_from_slice(&self.next_free_cluster.unwrap_or(FSINFO_UNKNOWN).to_le_bytes());
        buf[0x1FC..0x200].copy_from_slice(&FSINFO_TRAIL_SIG.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16 MiB FAT16 boot sector: 512 B sectors, 4 sectors per cluster.
    fn fat16_boot() -> [u8; 512] {
        let mut b = [0u8; 512];
        b[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        b[11..13].copy_from_slice(&512u16.to_le_bytes());
        b[13] = 4;
        b[14..16].copy_from_slice(&1u16.to_le_bytes());
        b[16] = 2;
        b[17..19].copy_from_slice(&512u16.to_le_bytes());
        b[19..21].copy_from_slice(&32768u16.to_le_bytes());
        b[21] = 0xF8;
        b[22..24].copy_from_slice(&32u16.to_le_bytes());
        b[38] = 0x29;
        b[39..43].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        b[43..54].copy_from_slice(b"TESTVOL    ");
        b[510..512].copy_from_slice(&BOOT_SIGNATURE);
        b
    }

    #[test]
    fn parses_fat16_geometry() {
        let bpb = BiosParameterBlock::parse(&fat16_boot()).unwrap();
        assert_eq!(bpb.fat_type, FatType::Fat16);
        assert_eq!(bpb.cluster_size(), 2048);
        assert_eq!(bpb.root_dir_sectors, 32);
        // 32768 - 1 - 64 - 32 = 32671 data sectors
        assert_eq!(bpb.cluster_count, 32671 / 4);
        assert_eq!(bpb.fat_offset(1), 33 * 512);
        assert_eq!(bpb.root_dir_offset(), 65 * 512);
        assert_eq!(bpb.cluster_offset(2), 97 * 512);
        assert_eq!(bpb.volume_id, Some(0x1234_5678));
        assert_eq!(bpb.volume_label.as_ref(), Some(b"TESTVOL    "));
    }

    #[test]
    fn rejects_missing_signature() {
        let mut b = fat16_boot();
        b[511] = 0;
        assert!(matches!(BiosParameterBlock::parse(&b), Err(FsError::UnknownFormat(_))));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut b = fat16_boot();
        b[13] = 3;
        assert!(matches!(BiosParameterBlock::parse(&b), Err(FsError::UnknownFormat(_))));

        let mut b = fat16_boot();
        b[21] = 0x12;
        assert!(matches!(BiosParameterBlock::parse(&b), Err(FsError::UnknownFormat(_))));

        let mut b = fat16_boot();
        b[22..24].copy_from_slice(&1u16.to_le_bytes());
        assert!(matches!(BiosParameterBlock::parse(&b), Err(FsError::UnknownFormat(_))));
    }

    #[test]
    fn fat_type_thresholds() {
        assert_eq!(FatType::from_cluster_count(4084), FatType::Fat12);
        assert_eq!(FatType::from_cluster_count(4085), FatType::Fat16);
        assert_eq!(FatType::from_cluster_count(65524), FatType::Fat16);
        assert_eq!(FatType::from_cluster_count(65525), FatType::Fat32);
    }

    #[test]
    fn fsinfo_unknown_fields_are_none() {
        let mut buf = [0u8; 512];
        FsInfo { free_cluster_count: Some(77), next_free_cluster: None }.write(&mut buf);
        let info = FsInfo::parse(&buf).unwrap();
        assert_eq!(info.free_cluster_count, Some(77));
        assert_eq!(info.next_free_cluster, None);
        buf[0] = 0;
        assert!(FsInfo::parse(&buf).is_none());
    }
}
