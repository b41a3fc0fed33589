//! Contract of the FAT filesystem engine driven by the volume adapter.
//!
//! Paths carry a volume prefix (`"<id>:/dir/file"`). Every primitive reports
//! failure as a [`FatCode`](fatvfs::FatCode); open objects are opaque cursor tokens that the
//! caller owns and hands back exactly once to `close`/`closedir`.
//!
//! Engines may accept a narrower name space than they can read. The built-in
//! [`Fat32Engine`](crate::Fat32Engine) lists long file names but only creates
//! 8.3 names: `open` with a create mode, `mkdir` and `rename` report
//! `FatCode::InvalidName` for anything longer (`hello_world.txt`, say).

use fatvfs::{fat_timestamp, AccessMode, FatOutcome, FileAttr, Metadata};

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FileCursor(u64);

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DirCursor(u64);

impl FileCursor {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl DirCursor {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Directory record as reported by `stat` and `readdir`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub attrib: FileAttr,
    pub fdate: u16,
    pub ftime: u16,
}

impl FileInfo {
    /// `readdir` signals the end of a directory with an empty name.
    pub fn is_end(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.attrib.contains(FileAttr::DIRECTORY)
    }

    pub fn to_metadata(&self) -> Metadata {
        Metadata::new(
            self.name.clone(),
            self.size,
            self.attrib,
            fat_timestamp(self.fdate, self.ftime),
        )
    }
}

pub trait FatEngine: Send {
    fn mount(&mut self, prefix: &str) -> FatOutcome<()>;
    fn unmount(&mut self, prefix: &str) -> FatOutcome<()>;
    /// Lays out an empty filesystem on the drive named by `prefix`.
    fn mkfs(&mut self, prefix: &str) -> FatOutcome<()>;

    fn open(&mut self, path: &str, mode: AccessMode) -> FatOutcome<FileCursor>;
    fn close(&mut self, file: FileCursor) -> FatOutcome<()>;
    /// Returns the number of bytes read; fewer than requested at end of file.
    fn read(&mut self, file: &FileCursor, buf: &mut [u8]) -> FatOutcome<usize>;
    /// Returns the number of bytes written; fewer than requested when the
    /// medium is full.
    fn write(&mut self, file: &FileCursor, buf: &[u8]) -> FatOutcome<usize>;
    fn lseek(&mut self, file: &FileCursor, offset: u64) -> FatOutcome<()>;
    fn tell(&self, file: &FileCursor) -> FatOutcome<u64>;
    fn size(&self, file: &FileCursor) -> FatOutcome<u64>;
    /// Cuts the file at the current position.
    fn truncate(&mut self, file: &FileCursor) -> FatOutcome<()>;
    fn sync(&mut self, file: &FileCursor) -> FatOutcome<()>;

    fn opendir(&mut self, path: &str) -> FatOutcome<DirCursor>;
    fn closedir(&mut self, dir: DirCursor) -> FatOutcome<()>;
    fn readdir(&mut self, dir: &DirCursor) -> FatOutcome<FileInfo>;

    fn stat(&mut self, path: &str) -> FatOutcome<FileInfo>;
    fn unlink(&mut self, path: &str) -> FatOutcome<()>;
    fn mkdir(&mut self, path: &str) -> FatOutcome<()>;
    fn rename(&mut self, old: &str, new: &str) -> FatOutcome<()>;
}
