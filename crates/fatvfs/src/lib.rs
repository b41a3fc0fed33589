#![no_std]

// Shared vocabulary between the FAT engine contract and the volume adapter.

extern crate alloc;

mod error;
mod flags;

use alloc::string::String;
use bitflags::bitflags;

pub use error::{FatCode, FatOutcome, VfsError, VfsResult};
pub use flags::{translate_flags, AccessMode, OpenFlags, SeekWhence};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FileAttr: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

impl FileAttr {
    pub fn file_type(&self) -> FileType {
        if self.contains(Self::DIRECTORY) {
            FileType::Dir
        } else {
            FileType::File
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub size: u64,
    pub file_type: FileType,
    pub mode: u16,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: u64,
    pub attributes: FileAttr,
}

impl Metadata {
    pub fn new(name: String, size: u64, attributes: FileAttr, mtime: u64) -> Self {
        let file_type = attributes.file_type();
        let mode = match (file_type, attributes.contains(FileAttr::READ_ONLY)) {
            (FileType::Dir, _) => 0o755,
            (FileType::File, true) => 0o444,
            (FileType::File, false) => 0o644,
        };
        Self {
            name,
            size,
            file_type,
            mode,
            mtime,
            attributes,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

/// Converts a FAT date/time pair into seconds since the Unix epoch.
///
/// A zero or malformed date maps to the epoch itself.
pub fn fat_timestamp(date: u16, time: u16) -> u64 {
    let year = 1980 + (date >> 9) as i64;
    let month = ((date >> 5) & 0x0f) as i64;
    let day = (date & 0x1f) as i64;
    if month == 0 || month > 12 || day == 0 {
        return 0;
    }
    let hours = (time >> 11) as u64;
    let minutes = ((time >> 5) & 0x3f) as u64;
    let seconds = (time & 0x1f) as u64 * 2;
    let days = days_from_civil(year, month, day) as u64;
    days * 86_400 + hours * 3_600 + minutes * 60 + seconds
}

/// Packs a calendar date into the FAT on-disk date format.
pub const fn fat_date(year: u16, month: u16, day: u16) -> u16 {
    ((year - 1980) << 9) | (month << 5) | day
}

fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year / 400;
    let yoe = year - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
