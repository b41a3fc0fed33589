use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::block::{BlockDevice, DeviceError};
use crate::config::SECTOR_SIZE;

/// Block device backed by a flat random-access byte store, usually an image
/// file.
pub struct ImageDevice<S> {
    store: Option<S>,
}

impl ImageDevice<File> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    /// Creates (or resizes) an image file holding `sectors` zeroed sectors.
    pub fn create(path: impl AsRef<Path>, sectors: u64) -> io::Result<Self> {
        let len = sectors
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "image size overflows u64"))?;
        let device = Self::open(path)?;
        if let Some(file) = device.store.as_ref() {
            file.set_len(len)?;
        }
        Ok(device)
    }
}

impl<S> ImageDevice<S> {
    pub fn new(store: S) -> Self {
        Self { store: Some(store) }
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    fn check_buffer(count: u32, len: usize) -> Result<usize, DeviceError> {
        let need = count as usize * SECTOR_SIZE;
        if len < need {
            return Err(DeviceError::BufferTooSmall { need, got: len });
        }
        Ok(need)
    }
}

impl<S: Write> ImageDevice<S> {
    /// Flushes and releases the backing store. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        match self.store.take() {
            Some(mut store) => store.flush().map_err(DeviceError::from),
            None => Ok(()),
        }
    }
}

impl<S: Seek> ImageDevice<S> {
    fn store_len(store: &mut S) -> io::Result<u64> {
        store.seek(SeekFrom::End(0))
    }

    fn position(store: &mut S, sector: u64, count: u32) -> Result<(), DeviceError> {
        let total = Self::store_len(store)? / SECTOR_SIZE as u64;
        let end = sector.checked_add(count as u64);
        if end.map_or(true, |end| end > total) {
            return Err(DeviceError::OutOfRange { sector, count });
        }
        store.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        Ok(())
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

fn write_full<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match writer.write(&buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

impl<S: Read + Write + Seek + Send> BlockDevice for ImageDevice<S> {
    fn read_sectors(&mut self, sector: u64, count: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let length = Self::check_buffer(count, buf.len())?;
        let store = self.store.as_mut().ok_or(DeviceError::Closed)?;
        Self::position(store, sector, count)?;
        let actual = read_full(store, &mut buf[..length])?;
        if actual != length {
            return Err(DeviceError::ShortTransfer {
                expected: length,
                actual,
            });
        }
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, count: u32, buf: &[u8]) -> Result<(), DeviceError> {
        let length = Self::check_buffer(count, buf.len())?;
        let store = self.store.as_mut().ok_or(DeviceError::Closed)?;
        Self::position(store, sector, count)?;
        let actual = write_full(store, &buf[..length])?;
        if actual != length {
            return Err(DeviceError::ShortTransfer {
                expected: length,
                actual,
            });
        }
        Ok(())
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn sector_count(&mut self) -> u64 {
        match self.store.as_mut() {
            Some(store) => Self::store_len(store)
                .map(|len| len / SECTOR_SIZE as u64)
                .unwrap_or(0),
            None => 0,
        }
    }

    fn status(&self) -> Result<(), DeviceError> {
        if self.store.is_some() {
            Ok(())
        } else {
            Err(DeviceError::Closed)
        }
    }
}
