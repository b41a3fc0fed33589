use std::fmt;
use std::io::{self, SeekFrom};
use std::sync::Arc;

use fatvfs::{FatCode, FatOutcome, Metadata, SeekWhence, VfsError, VfsResult};
use log::warn;
use spin::Mutex;

use crate::engine::{FatEngine, FileCursor};
use crate::volume::{HandleId, VolumeState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleMode {
    File,
    Directory,
}

/// An open file or directory on a mounted [`Volume`](crate::Volume).
///
/// Every operation fails with [`VfsError::Invalid`] once the handle is
/// closed or its volume has been unmounted.
pub struct FileHandle {
    state: Arc<Mutex<VolumeState>>,
    id: Option<HandleId>,
    path: String,
    mode: HandleMode,
    info: Metadata,
    append: bool,
}

impl FileHandle {
    pub(crate) fn new(
        state: Arc<Mutex<VolumeState>>,
        id: HandleId,
        path: String,
        mode: HandleMode,
        info: Metadata,
        append: bool,
    ) -> Self {
        Self {
            state,
            id: Some(id),
            path,
            mode,
            info,
            append,
        }
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn is_dir(&self) -> bool {
        self.mode == HandleMode::Directory
    }

    pub fn is_append(&self) -> bool {
        self.append
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    fn handle_id(&self) -> VfsResult<HandleId> {
        self.id.ok_or(VfsError::Invalid)
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut dyn FatEngine, &FileCursor) -> FatOutcome<T>) -> VfsResult<T> {
        if self.is_dir() {
            return Err(VfsError::Invalid);
        }
        let id = self.handle_id()?;
        self.state.lock().with_file(id, op)
    }

    /// Reads at the cursor. `Ok(0)` for a non-empty `buf` means end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        if buf.is_empty() {
            return self.with_file(|_, _| Ok(0));
        }
        self.with_file(|engine, file| engine.read(file, buf))
    }

    /// Writes at the cursor, or at end of file for append handles. A short
    /// write means the volume is full.
    pub fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        let append = self.append;
        let written = self.with_file(|engine, file| {
            if append {
                let end = engine.size(file)?;
                engine.lseek(file, end)?;
            }
            engine.write(file, buf)
        })?;
        if written < buf.len() {
            return Err(VfsError::VolumeFull { written });
        }
        Ok(written)
    }

    /// Reads at `offset` without moving the cursor.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.with_file(|engine, file| {
            let saved = engine.tell(file)?;
            let result = engine.lseek(file, offset).and_then(|_| engine.read(file, buf));
            let restored = engine.lseek(file, saved);
            let read = result?;
            restored?;
            Ok(read)
        })
    }

    /// Writes at `offset` without moving the cursor.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let written = self.with_file(|engine, file| {
            let saved = engine.tell(file)?;
            let result = engine.lseek(file, offset).and_then(|_| engine.write(file, buf));
            let restored = engine.lseek(file, saved);
            let written = result?;
            restored?;
            Ok(written)
        })?;
        if written < buf.len() {
            return Err(VfsError::VolumeFull { written });
        }
        Ok(written)
    }

    /// Moves the cursor and returns the new position.
    ///
    /// `End` is relative to the live cursor for append handles, whose size
    /// may have grown since open, and to the size captured at open time
    /// otherwise.
    pub fn seek(&mut self, offset: i64, whence: SeekWhence) -> VfsResult<u64> {
        let append = self.append;
        let cached = self.info.size;
        let base = self.with_file(|engine, file| match whence {
            SeekWhence::Set => Ok(0),
            SeekWhence::Cur => engine.tell(file),
            SeekWhence::End if append => engine.tell(file),
            SeekWhence::End => Ok(cached),
        })?;
        let target = base
            .checked_add_signed(offset)
            .ok_or(VfsError::Invalid)?;
        self.with_file(|engine, file| {
            engine.lseek(file, target)?;
            engine.tell(file)
        })
    }

    pub fn seek_raw(&mut self, offset: i64, whence: i32) -> VfsResult<u64> {
        let whence = SeekWhence::try_from(whence)?;
        self.seek(offset, whence)
    }

    /// Reads the remaining entries of a directory handle, at most `count`
    /// of them when `count > 0`.
    pub fn readdir(&mut self, count: usize) -> VfsResult<Vec<Metadata>> {
        if !self.is_dir() {
            return Err(VfsError::Invalid);
        }
        let id = self.handle_id()?;
        let mut state = self.state.lock();
        let mut entries = Vec::new();
        loop {
            let info = state.with_dir(id, |engine, dir| engine.readdir(dir))?;
            if info.is_end() {
                break;
            }
            entries.push(info.to_metadata());
        }
        if count > 0 {
            entries.truncate(count);
        }
        Ok(entries)
    }

    pub fn readdirnames(&mut self, count: usize) -> VfsResult<Vec<String>> {
        Ok(self
            .readdir(count)?
            .into_iter()
            .map(|meta| meta.name)
            .collect())
    }

    /// Metadata captured when the handle was opened.
    pub fn stat(&self) -> VfsResult<Metadata> {
        let id = self.handle_id()?;
        if !self.state.lock().handles.contains_key(&id) {
            return Err(VfsError::Invalid);
        }
        Ok(self.info.clone())
    }

    pub fn sync(&mut self) -> VfsResult<()> {
        self.with_file(|engine, file| engine.sync(file))
    }

    /// Sets the file length to `size`; the cursor ends up at `size`.
    pub fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.with_file(|engine, file| {
            engine.lseek(file, size)?;
            engine.truncate(file)
        })
    }

    /// Drops the handle from its volume's table, then releases the engine
    /// cursor. Closing twice is a no-op.
    pub fn close(&mut self) -> VfsResult<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        let object = state.handles.remove(&id).ok_or(VfsError::Invalid)?;
        state.close_cursor(object.cursor)?;
        Ok(())
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("append", &self.append)
            .finish()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(object) = state.handles.remove(&id) {
            if let Err(code) = state.close_cursor(object.cursor) {
                warn!("closing {} on drop failed: {code}", self.path);
            }
        }
    }
}

pub(crate) fn io_error(err: VfsError) -> io::Error {
    let kind = match err {
        VfsError::NotFound | VfsError::Fat(FatCode::NoPath) => io::ErrorKind::NotFound,
        VfsError::Invalid | VfsError::Fat(FatCode::InvalidName | FatCode::InvalidParameter) => {
            io::ErrorKind::InvalidInput
        }
        VfsError::VolumeFull { .. } => io::ErrorKind::WriteZero,
        VfsError::NotSupported => io::ErrorKind::Unsupported,
        VfsError::Fat(FatCode::Exist) => io::ErrorKind::AlreadyExists,
        VfsError::Fat(FatCode::Denied | FatCode::WriteProtected | FatCode::ReadOnly) => {
            io::ErrorKind::PermissionDenied
        }
        VfsError::Fat(FatCode::Timeout) => io::ErrorKind::TimedOut,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

impl io::Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileHandle::read(self, buf).map_err(io_error)
    }
}

impl io::Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match FileHandle::write(self, buf) {
            Ok(written) => Ok(written),
            Err(VfsError::VolumeFull { written }) if written > 0 => Ok(written),
            Err(err) => Err(io_error(err)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io_error)
    }
}

impl io::Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => (
                i64::try_from(offset).map_err(|_| io_error(VfsError::Invalid))?,
                SeekWhence::Set,
            ),
            SeekFrom::Current(offset) => (offset, SeekWhence::Cur),
            SeekFrom::End(offset) => (offset, SeekWhence::End),
        };
        FileHandle::seek(self, offset, whence).map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Seek, Write};

    use fatvfs::OpenFlags;

    use crate::block::{shared, DeviceRegistry};
    use crate::image::ImageDevice;
    use crate::volume::Volume;

    fn formatted(sectors: usize) -> Volume {
        let registry = DeviceRegistry::new();
        let volume = Volume::new(0, registry);
        let device = shared(ImageDevice::new(Cursor::new(vec![0u8; sectors * 512])));
        volume.format(Arc::clone(&device)).unwrap();
        volume.mount(device).unwrap();
        volume
    }

    #[test]
    fn tiny_image_cannot_be_formatted() {
        let volume = Volume::new(0, DeviceRegistry::new());
        let device = shared(ImageDevice::new(Cursor::new(vec![0u8; 24 * 512])));
        assert_eq!(
            volume.format(device).unwrap_err(),
            VfsError::Fat(FatCode::MkfsAborted)
        );
        assert!(volume.registry().is_empty());
    }

    #[test]
    fn read_write_and_eof() {
        let volume = formatted(256);
        let mut file = volume.create("/data.bin").unwrap();
        assert_eq!(file.write(b"0123456789").unwrap(), 10);
        file.close().unwrap();

        let mut file = volume.open("/data.bin").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(file.read_at(&mut buf, 8).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        let mut rest = [0u8; 16];
        assert_eq!(file.read(&mut rest).unwrap(), 2);
        assert_eq!(file.read(&mut rest).unwrap(), 0);
        assert_eq!(file.write(b"x").unwrap_err(), VfsError::Fat(FatCode::Denied));
    }

    #[test]
    fn write_at_restores_cursor() {
        let volume = formatted(256);
        let mut file = volume.create("/w.txt").unwrap();
        file.write(b"aaaaaaaa").unwrap();
        assert_eq!(file.write_at(b"BB", 2).unwrap(), 2);
        assert_eq!(file.seek(0, SeekWhence::Cur).unwrap(), 8);
        file.write(b"c").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 9);
        assert_eq!(&buf[..9], b"aaBBaaaac");
    }

    #[test]
    fn failed_positional_transfers_restore_cursor() {
        let volume = formatted(256);
        let mut file = volume
            .open_file("/p.txt", OpenFlags::WRONLY | OpenFlags::CREATE, 0o644)
            .unwrap();
        file.write(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 1).unwrap_err(), VfsError::Fat(FatCode::Denied));
        assert_eq!(file.seek(0, SeekWhence::Cur).unwrap(), 6);
        file.close().unwrap();

        let mut file = volume.open("/p.txt").unwrap();
        file.seek(3, SeekWhence::Set).unwrap();
        assert_eq!(file.write_at(b"x", 0).unwrap_err(), VfsError::Fat(FatCode::Denied));
        assert_eq!(file.seek(0, SeekWhence::Cur).unwrap(), 3);
    }

    #[test]
    fn short_write_at_restores_cursor() {
        let volume = formatted(128);
        let mut file = volume.create("/full.bin").unwrap();
        file.write(b"0123456789").unwrap();
        let err = file.write_at(&vec![0x11u8; 64 * 1024], 0).unwrap_err();
        assert!(matches!(err, VfsError::VolumeFull { written } if written > 10), "{err:?}");
        assert_eq!(file.seek(0, SeekWhence::Cur).unwrap(), 10);
    }

    #[test]
    fn seek_whence() {
        let volume = formatted(256);
        let mut file = volume.create("/s.txt").unwrap();
        file.write(b"hello world").unwrap();
        file.close().unwrap();

        let mut file = volume.open("/s.txt").unwrap();
        assert_eq!(file.seek(6, SeekWhence::Set).unwrap(), 6);
        assert_eq!(file.seek(-2, SeekWhence::Cur).unwrap(), 4);
        assert_eq!(file.seek(-5, SeekWhence::End).unwrap(), 6);
        assert_eq!(file.seek(-20, SeekWhence::End).unwrap_err(), VfsError::Invalid);
        assert_eq!(
            file.seek_raw(0, 7).unwrap_err(),
            VfsError::Fat(FatCode::InvalidParameter)
        );
        assert_eq!(file.seek_raw(0, 0).unwrap(), 0);
    }

    #[test]
    fn append_handles_write_at_end() {
        let volume = formatted(256);
        let mut file = volume.create("/log.txt").unwrap();
        file.write(b"one\n").unwrap();
        file.close().unwrap();

        let flags = OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::APPEND;
        let mut file = volume.open_file("/log.txt", flags, 0o644).unwrap();
        assert!(file.is_append());
        file.write(b"two\n").unwrap();
        file.seek(0, SeekWhence::Set).unwrap();
        file.write(b"three\n").unwrap();
        assert_eq!(file.seek(0, SeekWhence::End).unwrap(), 14);
        file.close().unwrap();

        let mut text = String::new();
        volume.open("/log.txt").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "one\ntwo\nthree\n");
    }

    #[test]
    fn truncate_moves_cursor() {
        let volume = formatted(256);
        let mut file = volume.create("/t.txt").unwrap();
        file.write(b"abcdefgh").unwrap();
        file.truncate(3).unwrap();
        assert_eq!(file.seek(0, SeekWhence::Cur).unwrap(), 3);
        file.close().unwrap();
        assert_eq!(volume.stat("/t.txt").unwrap().size, 3);
    }

    #[test]
    fn directory_handles_only_list() {
        let volume = formatted(256);
        volume.mkdir("/d", 0o755).unwrap();
        volume.create("/d/a.txt").unwrap();
        volume.create("/d/b.txt").unwrap();
        volume.create("/d/c.txt").unwrap();
        let mut dir = volume.open("/d").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(dir.read(&mut buf).unwrap_err(), VfsError::Invalid);
        assert_eq!(dir.write(b"x").unwrap_err(), VfsError::Invalid);
        assert_eq!(dir.seek(0, SeekWhence::Set).unwrap_err(), VfsError::Invalid);
        assert_eq!(dir.readdirnames(2).unwrap(), ["a.txt", "b.txt"]);
        assert!(dir.readdir(0).unwrap().is_empty());

        let mut file = volume.open("/d/a.txt").unwrap();
        assert_eq!(file.readdir(0).unwrap_err(), VfsError::Invalid);
    }

    #[test]
    fn closed_handles_are_inert() {
        let volume = formatted(256);
        let mut file = volume.create("/c.txt").unwrap();
        assert_eq!(volume.open_handles(), 1);
        file.close().unwrap();
        assert_eq!(volume.open_handles(), 0);
        file.close().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(file.read(&mut buf).unwrap_err(), VfsError::Invalid);
        assert_eq!(file.stat().unwrap_err(), VfsError::Invalid);
        assert_eq!(file.sync().unwrap_err(), VfsError::Invalid);
    }

    #[test]
    fn drop_closes_the_handle() {
        let volume = formatted(256);
        {
            let mut file = volume.create("/drop.txt").unwrap();
            file.write(b"kept").unwrap();
            assert_eq!(volume.open_handles(), 1);
        }
        assert_eq!(volume.open_handles(), 0);
        assert_eq!(volume.stat("/drop.txt").unwrap().size, 4);
    }

    #[test]
    fn std_io_traits() {
        let volume = formatted(256);
        let mut file = volume.create("/io.txt").unwrap();
        Write::write_all(&mut file, b"std io works").unwrap();
        Write::flush(&mut file).unwrap();
        Seek::seek(&mut file, SeekFrom::Start(4)).unwrap();
        let mut out = String::new();
        Read::read_to_string(&mut file, &mut out).unwrap();
        assert_eq!(out, "io works");
        let err = Seek::seek(&mut file, SeekFrom::Current(-100)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn io_error_kinds() {
        assert_eq!(io_error(VfsError::NotFound).kind(), io::ErrorKind::NotFound);
        assert_eq!(
            io_error(VfsError::VolumeFull { written: 0 }).kind(),
            io::ErrorKind::WriteZero
        );
        assert_eq!(
            io_error(VfsError::Fat(FatCode::ReadOnly)).kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(io_error(VfsError::Fat(FatCode::DiskErr)).kind(), io::ErrorKind::Other);
    }
}
