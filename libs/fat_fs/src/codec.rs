//! 32-byte directory records.
//!
//! A short record is decoded field by field and keeps every raw byte, so a
//! record read from disk encodes back to exactly the same bytes. Long names
//! are stored as a run of VFAT records in front of the short record they
//! belong to, last part first.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::time::DateTime;
use crate::FsError;

pub const RECORD_SIZE: usize = 32;

/// First name byte of the slot that ends a directory.
pub(crate) const END_MARKER: u8 = 0x00;
/// First name byte of a deleted record.
pub(crate) const DELETED_MARKER: u8 = 0xE5;
/// Stored instead of a leading 0xE5 that belongs to the name itself.
const KANJI_ESCAPE: u8 = 0x05;

const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT:  u8 = 0x10;

const LFN_ATTR:      u8 = 0x0F;
const LFN_LAST:      u8 = 0x40;
const LFN_CHARS:     usize = 13;
const LFN_MAX_UNITS: usize = 255;
const LFN_MAX_PARTS: usize = 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;

        const _ = !0;
    }
}

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

// ─── Short record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortRecord {
    /// Raw 8.3 name, space padded, with the 0x05 escape left in place.
    pub name:           [u8; 11],
    pub attributes:     Attributes,
    pub nt_flags:       u8,
    pub created_tenths: u8,
    pub created_time:   u16,
    pub created_date:   u16,
    pub accessed_date:  u16,
    pub cluster_high:   u16,
    pub modified_time:  u16,
    pub modified_date:  u16,
    pub cluster_low:    u16,
    pub size:           u32,
}

impl ShortRecord {
    pub fn new(name: [u8; 11], attributes: Attributes) -> Self {
        Self {
            name,
            attributes,
            nt_flags: 0,
            created_tenths: 0,
            created_time: 0,
            created_date: 0,
            accessed_date: 0,
            cluster_high: 0,
            modified_time: 0,
            modified_date: 0,
            cluster_low: 0,
            size: 0,
        }
    }

    pub fn decode(raw: &[u8; RECORD_SIZE]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[0..11]);
        Self {
            name,
            attributes:     Attributes::from_bits_retain(raw[11]),
            nt_flags:       raw[12],
            created_tenths: raw[13],
            created_time:   le16(raw, 14),
            created_date:   le16(raw, 16),
            accessed_date:  le16(raw, 18),
            cluster_high:   le16(raw, 20),
            modified_time:  le16(raw, 22),
            modified_date:  le16(raw, 24),
            cluster_low:    le16(raw, 26),
            size:           u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut raw = [0u8; RECORD_SIZE];
        raw[0..11].copy_from_slice(&self.name);
        raw[11] = self.attributes.bits();
        raw[12] = self.nt_flags;
        raw[13] = self.created_tenths;
        raw[14..16].copy_from_slice(&self.created_time.to_le_bytes());
        raw[16..18].copy_from_slice(&self.created_date.to_le_bytes());
        raw[18..20].copy_from_slice(&self.accessed_date.to_le_bytes());
        raw[20..22].copy_from_slice(&self.cluster_high.to_le_bytes());
        raw[22..24].copy_from_slice(&self.modified_time.to_le_bytes());
        raw[24..26].copy_from_slice(&self.modified_date.to_le_bytes());
        raw[26..28].copy_from_slice(&self.cluster_low.to_le_bytes());
        raw[28..32].copy_from_slice(&self.size.to_le_bytes());
        raw
    }

    /// `.` or `..` record pointing at `cluster`.
    pub(crate) fn dot(dots: usize, cluster: u32, stamp: Option<DateTime>) -> Self {
        let mut name = [b' '; 11];
        name[..dots].fill(b'.');
        let mut rec = Self::new(name, Attributes::DIRECTORY);
        rec.set_first_cluster(cluster);
        rec.set_created(stamp);
        rec.set_modified(stamp);
        rec
    }

    pub(crate) fn volume_label(label: [u8; 11]) -> Self {
        Self::new(label, Attributes::VOLUME_ID | Attributes::ARCHIVE)
    }

    pub fn first_cluster(&self) -> u32 {
        ((self.cluster_high as u32) << 16) | self.cluster_low as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.cluster_high = (cluster >> 16) as u16;
        self.cluster_low = cluster as u16;
    }

    pub fn is_directory(&self) -> bool { self.attributes.contains(Attributes::DIRECTORY) }

    pub(crate) fn is_volume_label(&self) -> bool {
        self.attributes.contains(Attributes::VOLUME_ID) && !self.attributes.contains(Attributes::DIRECTORY)
    }

    pub(crate) fn is_dot(&self) -> bool {
        &self.name == b".          " || &self.name == b"..         "
    }

    /// The 11 name bytes as they compare for checksums and uniqueness:
    /// the 0x05 escape stays, case flags are ignored.
    pub fn raw_name(&self) -> &[u8; 11] { &self.name }

    /// `NAME.EXT`, honouring the NT lower-case flags. Bytes above 0x7F are
    /// taken as Latin-1.
    pub fn display_name(&self) -> String {
        let mut out = String::with_capacity(12);
        let (base, ext) = self.name.split_at(8);
        let push = |out: &mut String, part: &[u8], lower: bool, first_escaped: bool| {
            let end = part.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
            for (i, &b) in part[..end].iter().enumerate() {
                let b = if i == 0 && first_escaped && b == KANJI_ESCAPE { DELETED_MARKER } else { b };
                let c = b as char;
                out.push(if lower { c.to_ascii_lowercase() } else { c });
            }
        };
        push(&mut out, base, self.nt_flags & NT_LOWER_BASE != 0, true);
        if ext.iter().any(|&b| b != b' ') {
            out.push('.');
            push(&mut out, ext, self.nt_flags & NT_LOWER_EXT != 0, false);
        }
        out
    }

    pub fn created(&self) -> Option<DateTime> {
        DateTime::from_fat(self.created_date, self.created_time, self.created_tenths)
    }

    pub fn modified(&self) -> Option<DateTime> {
        DateTime::from_fat(self.modified_date, self.modified_time, 0)
    }

    pub fn accessed(&self) -> Option<DateTime> {
        DateTime::from_fat(self.accessed_date, 0, 0)
    }

    pub fn set_created(&mut self, t: Option<DateTime>) {
        (self.created_date, self.created_time, self.created_tenths) =
            t.map_or((0, 0, 0), |t| (t.fat_date(), t.fat_time(), t.fat_tenths()));
    }

    pub fn set_modified(&mut self, t: Option<DateTime>) {
        (self.modified_date, self.modified_time) = t.map_or((0, 0), |t| (t.fat_date(), t.fat_time()));
    }

    pub fn set_accessed(&mut self, t: Option<DateTime>) {
        self.accessed_date = t.map_or(0, |t| t.fat_date());
    }
}

// ─── Long-name records ─────────────────────────────────────────────────────────

/// Checksum of the short name a long-name run belongs to.
pub fn lfn_checksum(name: &[u8; 11]) -> u8 {
    name.iter().fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

const LFN_OFFSETS: [usize; LFN_CHARS] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongRecord {
    /// Sequence number, 1-based, with 0x40 on the last part.
    pub order:    u8,
    pub checksum: u8,
    pub units:    [u16; LFN_CHARS],
}

impl LongRecord {
    pub fn decode(raw: &[u8; RECORD_SIZE]) -> Option<Self> {
        if !is_long_record(raw) || raw[0] == DELETED_MARKER {
            return None;
        }
        let mut units = [0u16; LFN_CHARS];
        for (u, &off) in units.iter_mut().zip(LFN_OFFSETS.iter()) {
            *u = le16(raw, off);
        }
        Some(Self { order: raw[0], checksum: raw[13], units })
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut raw = [0u8; RECORD_SIZE];
        raw[0] = self.order;
        raw[11] = LFN_ATTR;
        raw[13] = self.checksum;
        for (&u, &off) in self.units.iter().zip(LFN_OFFSETS.iter()) {
            raw[off..off + 2].copy_from_slice(&u.to_le_bytes());
        }
        raw
    }

    fn index(&self) -> usize { (self.order & !LFN_LAST) as usize }

    pub(crate) fn is_last(&self) -> bool { self.order & LFN_LAST != 0 }
}

pub(crate) fn is_long_record(raw: &[u8; RECORD_SIZE]) -> bool {
    raw[11] & 0x3F == LFN_ATTR
}

/// Long-name records for `name`, in on-disk order (highest part first).
pub fn long_records(name: &str, checksum: u8) -> Vec<LongRecord> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let parts = units.len().div_ceil(LFN_CHARS);
    let mut out = Vec::with_capacity(parts);
    for part in (0..parts).rev() {
        let mut chunk = [0xFFFFu16; LFN_CHARS];
        let start = part * LFN_CHARS;
        let end = (start + LFN_CHARS).min(units.len());
        chunk[..end - start].copy_from_slice(&units[start..end]);
        if end - start < LFN_CHARS {
            chunk[end - start] = 0x0000;
        }
        let mut order = (part + 1) as u8;
        if part + 1 == parts {
            order |= LFN_LAST;
        }
        out.push(LongRecord { order, checksum, units: chunk });
    }
    out
}

/// Collects the long-name run preceding a short record while a directory is
/// scanned. Any gap, reordering or checksum mismatch discards what was
/// collected so the entry falls back to its short name.
#[derive(Default)]
pub(crate) struct LongNameBuilder {
    parts:    Vec<[u16; LFN_CHARS]>,
    checksum: u8,
    expected: usize,
}

impl LongNameBuilder {
    pub(crate) fn reset(&mut self) {
        self.parts.clear();
        self.expected = 0;
    }

    pub(crate) fn is_empty(&self) -> bool { self.parts.is_empty() }

    pub(crate) fn push(&mut self, rec: &LongRecord) {
        let index = rec.index();
        if rec.is_last() {
            self.reset();
            if index == 0 || index > LFN_MAX_PARTS {
                return;
            }
            self.checksum = rec.checksum;
            self.expected = index;
        } else if self.parts.is_empty() || rec.checksum != self.checksum || index != self.expected {
            self.reset();
            return;
        }
        self.parts.push(rec.units);
        self.expected = index - 1;
    }

    /// The long name, if a complete run for `short` was collected. Resets the
    /// builder either way.
    pub(crate) fn finish(&mut self, short: &[u8; 11]) -> Option<String> {
        let complete = !self.parts.is_empty() && self.expected == 0 && lfn_checksum(short) == self.checksum;
        let name = complete.then(|| {
            let units = self.parts.iter().rev().flat_map(|p| p.iter().copied()).take_while(|&u| u != 0);
            char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect::<String>()
        });
        self.reset();
        name.filter(|n| !n.is_empty())
    }
}

// ─── Names ─────────────────────────────────────────────────────────────────────

const SHORT_SPECIAL: &[u8] = b"!#$%&'()-@^_`{}~";

fn is_short_char(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit() || SHORT_SPECIAL.contains(&b)
}

/// Names FAT can store as a long name. Leading and trailing spaces and
/// trailing dots are rejected rather than silently stripped.
pub fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidName);
    }
    if name.starts_with(' ') || name.ends_with(' ') || name.ends_with('.') {
        return Err(FsError::InvalidName);
    }
    if name.encode_utf16().count() > LFN_MAX_UNITS {
        return Err(FsError::InvalidName);
    }
    if name.chars().any(|c| (c as u32) < 0x20 || "\"*/:<>?\\|".contains(c)) {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

/// Case-insensitive name comparison.
pub fn names_match(a: &str, b: &str) -> bool {
    a.chars().flat_map(char::to_uppercase).eq(b.chars().flat_map(char::to_uppercase))
}

/// Packs `name` into an 8.3 record name when it fits exactly. Each part may be
/// all upper or all lower case; lower case is recorded in the NT flags.
pub fn exact_short_name(name: &str) -> Option<([u8; 11], u8)> {
    let (base, ext) = match name.rfind('.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 || base.contains('.') {
        return None;
    }
    let mut raw = [b' '; 11];
    let mut flags = 0;
    for (part, dst, lower_flag) in [(base, 0, NT_LOWER_BASE), (ext, 8, NT_LOWER_EXT)] {
        let has_lower = part.bytes().any(|b| b.is_ascii_lowercase());
        let has_upper = part.bytes().any(|b| b.is_ascii_uppercase());
        if has_lower && has_upper {
            return None;
        }
        if has_lower {
            flags |= lower_flag;
        }
        for (i, b) in part.bytes().enumerate() {
            let b = b.to_ascii_uppercase();
            if !is_short_char(b) {
                return None;
            }
            raw[dst + i] = b;
        }
    }
    if raw[0] == DELETED_MARKER {
        raw[0] = KANJI_ESCAPE;
    }
    Some((raw, flags))
}

fn short_part(part: &str, max: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::with_capacity(max);
    let mut lossy = false;
    for c in part.chars() {
        if c == ' ' || c == '.' {
            lossy = true;
            continue;
        }
        let b = if c.is_ascii() { (c as u8).to_ascii_uppercase() } else { b'_' };
        let b = if is_short_char(b) { b } else { b'_' };
        if b == b'_' && c != '_' {
            lossy = true;
        }
        if out.len() == max {
            lossy = true;
            break;
        }
        out.push(b);
    }
    (out, lossy)
}

/// Generates a unique 8.3 alias for a long name: upper-cased, invalid
/// characters replaced by `_`, and a `~N` tail picked so that `taken` reports
/// it unused.
pub fn generate_short_name(name: &str, taken: impl Fn(&[u8; 11]) -> bool) -> Result<[u8; 11], FsError> {
    let trimmed = name.trim_start_matches(['.', ' ']);
    let (base, ext) = match trimmed.rfind('.') {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => (trimmed, ""),
    };
    let (mut base, _) = short_part(base, 8);
    let (ext, _) = short_part(ext, 3);
    if base.is_empty() {
        base.push(b'_');
    }

    let mut raw = [b' '; 11];
    raw[8..8 + ext.len()].copy_from_slice(&ext);
    for n in 1u32..=999_999 {
        let mut tail = [0u8; 8];
        let mut digits = 0;
        let mut v = n;
        while v > 0 {
            digits += 1;
            tail[8 - digits] = b'0' + (v % 10) as u8;
            v /= 10;
        }
        let tail = &tail[8 - digits..];
        let keep = base.len().min(7 - digits);
        raw[..8].fill(b' ');
        raw[..keep].copy_from_slice(&base[..keep]);
        raw[keep] = b'~';
        raw[keep + 1..keep + 1 + digits].copy_from_slice(tail);
        if !taken(&raw) {
            return Ok(raw);
        }
    }
    Err(FsError::NoSpace)
}
