//! ### GEMDOS packing module
//!
//! Functions to help pack or unpack dates, times, and attributes.
//! GEMDOS packs timestamps the same way FAT does: the date is
//! `day | month<<5 | (year-1980)<<9`, the time is `sec/2 | min<<5 | hour<<11`.
//! On the wire these travel as big-endian words through the transport.

use chrono::{Datelike,Timelike};
use std::time::SystemTime;
use super::types::attrib;

/// pack the date into the GEMDOS format, if the year is not between 1980
/// and 2107 it will be pegged to the nearest representable date.
pub fn pack_date(time: Option<chrono::NaiveDateTime>) -> u16 {
    let now = match time {
        Some(t) => t,
        _ => chrono::Local::now().naive_local()
    };
    let year = match now.year() {
        y if y < 1980 => {
            log::warn!("date prior to reference date, pegging to reference date");
            1980
        },
        y if y > 2107 => {
            log::warn!("date is pegged to maximum of 2107");
            2107
        },
        y => y
    };
    now.day() as u16 + ((now.month() as u16) << 5) + ((year as u16 - 1980) << 9)
}

pub fn pack_time(time: Option<chrono::NaiveDateTime>) -> u16 {
    let now = match time {
        Some(t) => t,
        _ => chrono::Local::now().naive_local()
    };
    (now.second() as u16) / 2 + ((now.minute() as u16) << 5) + ((now.hour() as u16) << 11)
}

pub fn unpack_date(gemdos_date: u16) -> Option<chrono::NaiveDate> {
    if gemdos_date==0 {
        return None;
    }
    let year = 1980 + (gemdos_date >> 9) as i32;
    let month = ((gemdos_date & 0b0000_0001_1110_0000) >> 5) as u32;
    let day = (gemdos_date & 0b1_1111) as u32;
    chrono::NaiveDate::from_ymd_opt(year, month, day)
}

pub fn unpack_time(gemdos_time: u16) -> Option<chrono::NaiveTime> {
    let hour = (gemdos_time >> 11) as u32;
    let min = ((gemdos_time & 0b0000_0111_1110_0000) >> 5) as u32;
    let sec2 = (gemdos_time & 0b1_1111) as u32;
    chrono::NaiveTime::from_hms_opt(hour, min, sec2*2)
}

/// combine packed date and time into a local datetime
pub fn unpack_datetime(gemdos_date: u16,gemdos_time: u16) -> Option<chrono::NaiveDateTime> {
    match (unpack_date(gemdos_date),unpack_time(gemdos_time)) {
        (Some(d),Some(t)) => Some(d.and_time(t)),
        _ => None
    }
}

/// host file clock to the local datetime we pack for the guest
pub fn datetime_from_system(st: SystemTime) -> chrono::NaiveDateTime {
    chrono::DateTime::<chrono::Local>::from(st).naive_local()
}

/// guest supplied local datetime to a host file clock
pub fn system_from_datetime(ndt: chrono::NaiveDateTime) -> SystemTime {
    use chrono::TimeZone;
    match chrono::Local.from_local_datetime(&ndt).earliest() {
        Some(local) => SystemTime::from(local),
        None => SystemTime::from(chrono::Utc.from_utc_datetime(&ndt))
    }
}

/// Fold what the host can tell us about a file into the guest attribute byte.
/// Hosts have no hidden bit; the convention of hiding dot names is used instead.
pub fn attributes_to_guest(read_only: bool,is_dir: bool,hidden: bool) -> u8 {
    let mut ans = 0;
    if read_only {
        ans |= attrib::READ_ONLY;
    }
    if is_dir {
        ans |= attrib::DIRECTORY;
    }
    if hidden {
        ans |= attrib::HIDDEN;
    }
    ans
}
