use fatvfs::fat_date;

use crate::block::VolumeId;

pub const DEFAULT_VOLUME_ID: VolumeId = 0;
pub const SECTOR_SIZE: usize = 512;
/// Largest sector size the built-in engine accepts.
pub const MAX_SECTOR_SIZE: usize = 4096;
/// Size reported for the synthetic root record.
pub const ROOT_CAPACITY: u64 = 512 * 1024 * 1024;
pub const MAX_OPEN_OBJECTS: usize = 64;
/// Timestamp written into directory entries; the engine has no clock.
pub const NORTC_DATE: u16 = fat_date(2024, 1, 1);
pub const NORTC_TIME: u16 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Refuse every operation that would modify the medium.
    pub read_only: bool,
    /// Size reported by `stat("/")`.
    pub root_capacity: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            root_capacity: ROOT_CAPACITY,
        }
    }
}
