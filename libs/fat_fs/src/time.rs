//! FAT timestamps.
//!
//! Dates count years from 1980 in 7 bits, so the representable range is
//! 1980-01-01 to 2107-12-31. Modification times have 2-second resolution,
//! creation times add a 10 ms field, access stamps carry only a date.
//! An all-zero field means the writer did not record it.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTime {
    pub year:   u16,
    pub month:  u8,
    pub day:    u8,
    pub hour:   u8,
    pub minute: u8,
    pub second: u8,
    pub millis: u16,
}

pub const MIN_YEAR: u16 = 1980;
pub const MAX_YEAR: u16 = 2107;

impl DateTime {
    /// `None` when any field is outside what a FAT record can hold.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8, millis: u16)
        -> Option<Self>
    {
        let valid = (MIN_YEAR..=MAX_YEAR).contains(&year)
            && (1..=12).contains(&month)
            && (1..=days_in_month(year, month)).contains(&day)
            && hour < 24
            && minute < 60
            && second < 60
            && millis < 1000;
        valid.then_some(Self { year, month, day, hour, minute, second, millis })
    }

    pub fn date(year: u16, month: u8, day: u8) -> Option<Self> {
        Self::new(year, month, day, 0, 0, 0, 0)
    }

    /// Decode a date word, a time word and the creation 10 ms count.
    pub fn from_fat(date: u16, time: u16, tenths: u8) -> Option<Self> {
        if date == 0 {
            return None;
        }
        let year = MIN_YEAR + (date >> 9);
        let month = ((date >> 5) & 0x0F) as u8;
        let day = (date & 0x1F) as u8;
        let hour = (time >> 11) as u8;
        let minute = ((time >> 5) & 0x3F) as u8;
        let mut second = ((time & 0x1F) * 2) as u8;
        let mut millis = 0;
        if tenths < 200 {
            second += tenths / 100;
            millis = (tenths % 100) as u16 * 10;
        }
        Self::new(year, month, day, hour, minute, second, millis)
    }

    pub fn fat_date(&self) -> u16 {
        ((self.year - MIN_YEAR) << 9) | ((self.month as u16) << 5) | self.day as u16
    }

    pub fn fat_time(&self) -> u16 {
        ((self.hour as u16) << 11) | ((self.minute as u16) << 5) | (self.second as u16 / 2)
    }

    /// Hundredths of a second past the 2-second slot of `fat_time`, 0..=199.
    pub fn fat_tenths(&self) -> u8 {
        (self.second % 2) * 100 + (self.millis / 10) as u8
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

fn is_leap(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

// ─── Clock ─────────────────────────────────────────────────────────────────────

/// Source of "now" for stamping created and modified records.
pub trait TimeProvider {
    /// `None` leaves the timestamp fields zeroed.
    fn now(&self) -> Option<DateTime>;
}

/// Records no timestamps. The default, since `no_std` hosts have no clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTimeProvider;

impl TimeProvider for NullTimeProvider {
    fn now(&self) -> Option<DateTime> { None }
}

/// Host wall clock, in UTC.
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

#[cfg(feature = "std")]
impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Option<DateTime> {
        let since = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).ok()?;
        from_unix(since.as_secs(), since.subsec_millis() as u16)
    }
}

/// Civil UTC date from seconds since 1970 (days-from-civil inverse).
#[cfg_attr(not(feature = "std"), allow(dead_code))]
fn from_unix(secs: u64, millis: u16) -> Option<DateTime> {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    let year = u16::try_from(year).ok()?;
    DateTime::new(
        year,
        month,
        day,
        (rem / 3600) as u8,
        (rem / 60 % 60) as u8,
        (rem % 60) as u8,
        millis,
    )
}
