//! FAT volume adapter: pluggable block devices, a FAT32 engine reached
//! through a sector bridge, and a POSIX-style session/handle layer on top.

pub mod block;
pub mod config;
pub mod engine;
pub mod fat32;
pub mod file;
pub mod image;
mod mkfs;
pub mod volume;

pub use block::{shared, BlockDevice, DeviceError, DeviceRegistry, DiskBridge, DiskIo, SharedDevice, VolumeId};
pub use config::VolumeConfig;
pub use engine::{DirCursor, FatEngine, FileCursor, FileInfo};
pub use fat32::Fat32Engine;
pub use fatvfs::{
    translate_flags, AccessMode, FatCode, FileAttr, FileType, Metadata, OpenFlags, SeekWhence, VfsError, VfsResult,
};
pub use file::{FileHandle, HandleMode};
pub use image::ImageDevice;
pub use volume::{HandleId, Volume};
