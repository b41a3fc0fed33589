use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use fatvfs::{VfsError, VfsResult};
use log::{trace, warn};
use spin::Mutex;
use thiserror::Error;

pub type VolumeId = u8;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall { need: usize, got: usize },
    #[error("short transfer: expected {expected} bytes, moved {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("sectors {sector}..{sector}+{count} are outside the device")]
    OutOfRange { sector: u64, count: u32 },
    #[error("device is closed")]
    Closed,
    #[error("device is write protected")]
    WriteProtected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Storage backend addressed in whole sectors.
///
/// Every request covers `count * sector_size()` bytes and the sector size
/// never changes while the device is alive.
pub trait BlockDevice: Send {
    fn read_sectors(&mut self, sector: u64, count: u32, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn write_sectors(&mut self, sector: u64, count: u32, buf: &[u8]) -> Result<(), DeviceError>;
    fn sector_size(&self) -> usize;
    fn sector_count(&mut self) -> u64;

    fn initialize(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn status(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

pub type SharedDevice = Arc<Mutex<dyn BlockDevice>>;

pub fn shared<D: BlockDevice + 'static>(device: D) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DiskResult {
    Ok = 0,
    Error = 1,
    WriteProtected = 2,
    NotReady = 3,
    ParamError = 4,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        const NOINIT = 0x01;
        const NODISK = 0x02;
        const PROTECT = 0x04;
    }
}

/// Sector-level callbacks the FAT engine issues against a drive number.
pub trait DiskIo: Send {
    fn initialize(&self, pdrv: VolumeId) -> DiskStatus;
    fn status(&self, pdrv: VolumeId) -> DiskStatus;
    fn sector_read(&self, pdrv: VolumeId, sector: u64, count: u32, buf: &mut [u8]) -> DiskResult;
    fn sector_write(&self, pdrv: VolumeId, sector: u64, count: u32, buf: &[u8]) -> DiskResult;
    fn sector_size(&self, pdrv: VolumeId) -> usize;
    fn sector_count(&self, pdrv: VolumeId) -> u64;
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<VolumeId, SharedDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: VolumeId, device: SharedDevice) -> VfsResult<()> {
        let mut devices = self.devices.lock();
        if devices.contains_key(&id) {
            return Err(VfsError::Busy);
        }
        devices.insert(id, device);
        Ok(())
    }

    pub fn unregister(&self, id: VolumeId) -> Option<SharedDevice> {
        self.devices.lock().remove(&id)
    }

    pub fn get(&self, id: VolumeId) -> Option<SharedDevice> {
        self.devices.lock().get(&id).cloned()
    }

    pub fn is_registered(&self, id: VolumeId) -> bool {
        self.devices.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bridge(self: &Arc<Self>) -> DiskBridge {
        DiskBridge {
            registry: Arc::clone(self),
        }
    }
}

/// Forwards engine sector callbacks to the device registered for a drive.
#[derive(Clone)]
pub struct DiskBridge {
    registry: Arc<DeviceRegistry>,
}

impl DiskBridge {
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn transfer_len(device: &dyn BlockDevice, count: u32, available: usize) -> Option<usize> {
        let length = (count as usize).checked_mul(device.sector_size())?;
        (length <= available).then_some(length)
    }
}

fn device_result(err: &DeviceError) -> DiskResult {
    match err {
        DeviceError::WriteProtected => DiskResult::WriteProtected,
        DeviceError::Closed => DiskResult::NotReady,
        _ => DiskResult::Error,
    }
}

impl DiskIo for DiskBridge {
    fn initialize(&self, pdrv: VolumeId) -> DiskStatus {
        let Some(device) = self.registry.get(pdrv) else {
            return DiskStatus::NOINIT | DiskStatus::NODISK;
        };
        let mut device = device.lock();
        match device.initialize() {
            Ok(()) => DiskStatus::empty(),
            Err(DeviceError::WriteProtected) => DiskStatus::PROTECT,
            Err(err) => {
                warn!("disk {pdrv}: initialize failed: {err}");
                DiskStatus::NOINIT
            }
        }
    }

    fn status(&self, pdrv: VolumeId) -> DiskStatus {
        let Some(device) = self.registry.get(pdrv) else {
            return DiskStatus::NOINIT | DiskStatus::NODISK;
        };
        let device = device.lock();
        match device.status() {
            Ok(()) => DiskStatus::empty(),
            Err(DeviceError::WriteProtected) => DiskStatus::PROTECT,
            Err(err) => {
                warn!("disk {pdrv}: status check failed: {err}");
                DiskStatus::NOINIT
            }
        }
    }

    fn sector_read(&self, pdrv: VolumeId, sector: u64, count: u32, buf: &mut [u8]) -> DiskResult {
        let Some(device) = self.registry.get(pdrv) else {
            return DiskResult::Error;
        };
        let mut device = device.lock();
        let Some(length) = Self::transfer_len(&*device, count, buf.len()) else {
            return DiskResult::ParamError;
        };
        trace!("disk {pdrv}: read {count} sectors at {sector}");
        match device.read_sectors(sector, count, &mut buf[..length]) {
            Ok(()) => DiskResult::Ok,
            Err(err) => {
                warn!("disk {pdrv}: read at sector {sector} failed: {err}");
                device_result(&err)
            }
        }
    }

    fn sector_write(&self, pdrv: VolumeId, sector: u64, count: u32, buf: &[u8]) -> DiskResult {
        let Some(device) = self.registry.get(pdrv) else {
            return DiskResult::Error;
        };
        let mut device = device.lock();
        let Some(length) = Self::transfer_len(&*device, count, buf.len()) else {
            return DiskResult::ParamError;
        };
        trace!("disk {pdrv}: write {count} sectors at {sector}");
        match device.write_sectors(sector, count, &buf[..length]) {
            Ok(()) => DiskResult::Ok,
            Err(err) => {
                warn!("disk {pdrv}: write at sector {sector} failed: {err}");
                device_result(&err)
            }
        }
    }

    fn sector_size(&self, pdrv: VolumeId) -> usize {
        self.registry
            .get(pdrv)
            .map(|device| device.lock().sector_size())
            .unwrap_or(0)
    }

    fn sector_count(&self, pdrv: VolumeId) -> u64 {
        self.registry
            .get(pdrv)
            .map(|device| device.lock().sector_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBlockDevice {
        sector_size: usize,
        data: Vec<u8>,
        reads: usize,
        short_by: usize,
        healthy: bool,
        protected: bool,
    }

    impl TestBlockDevice {
        fn new(sectors: usize) -> Self {
            Self {
                sector_size: 512,
                data: vec![0; sectors * 512],
                reads: 0,
                short_by: 0,
                healthy: true,
                protected: false,
            }
        }
    }

    impl BlockDevice for TestBlockDevice {
        fn read_sectors(&mut self, sector: u64, count: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.reads += 1;
            let offset = sector as usize * self.sector_size;
            let len = count as usize * self.sector_size;
            if buf.len() != len {
                return Err(DeviceError::BufferTooSmall { need: len, got: buf.len() });
            }
            if offset + len > self.data.len() {
                return Err(DeviceError::OutOfRange { sector, count });
            }
            if self.short_by > 0 {
                return Err(DeviceError::ShortTransfer {
                    expected: len,
                    actual: len - self.short_by,
                });
            }
            buf.copy_from_slice(&self.data[offset..offset + len]);
            Ok(())
        }

        fn write_sectors(&mut self, sector: u64, count: u32, buf: &[u8]) -> Result<(), DeviceError> {
            let offset = sector as usize * self.sector_size;
            let len = count as usize * self.sector_size;
            if offset + len > self.data.len() {
                return Err(DeviceError::OutOfRange { sector, count });
            }
            self.data[offset..offset + len].copy_from_slice(&buf[..len]);
            Ok(())
        }

        fn sector_size(&self) -> usize {
            self.sector_size
        }

        fn sector_count(&mut self) -> u64 {
            (self.data.len() / self.sector_size) as u64
        }

        fn initialize(&mut self) -> Result<(), DeviceError> {
            if !self.healthy {
                Err(DeviceError::Closed)
            } else if self.protected {
                Err(DeviceError::WriteProtected)
            } else {
                Ok(())
            }
        }

        fn status(&self) -> Result<(), DeviceError> {
            if !self.healthy {
                Err(DeviceError::Closed)
            } else if self.protected {
                Err(DeviceError::WriteProtected)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn routes_by_volume_id() {
        let registry = DeviceRegistry::new();
        let first = Arc::new(Mutex::new(TestBlockDevice::new(4)));
        let second = Arc::new(Mutex::new(TestBlockDevice::new(8)));
        registry.register(0, first.clone()).unwrap();
        registry.register(1, second.clone()).unwrap();
        let bridge = registry.bridge();

        let payload = [0xa5u8; 512];
        assert_eq!(bridge.sector_write(0, 2, 1, &payload), DiskResult::Ok);
        assert_eq!(&first.lock().data[1024..1536], &payload[..]);
        assert!(second.lock().data.iter().all(|b| *b == 0));

        let mut buf = [0u8; 512];
        assert_eq!(bridge.sector_read(1, 2, 1, &mut buf), DiskResult::Ok);
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(bridge.sector_read(0, 2, 1, &mut buf), DiskResult::Ok);
        assert_eq!(buf, payload);

        assert_eq!(bridge.sector_count(0), 4);
        assert_eq!(bridge.sector_count(1), 8);
    }

    #[test]
    fn edge_ranges_stay_on_their_device() {
        let registry = DeviceRegistry::new();
        let first = Arc::new(Mutex::new(TestBlockDevice::new(4)));
        let second = Arc::new(Mutex::new(TestBlockDevice::new(4)));
        registry.register(0, first.clone()).unwrap();
        registry.register(1, second.clone()).unwrap();
        let bridge = registry.bridge();

        let payload: Vec<u8> = (0..1024).map(|i| (i % 199) as u8 + 1).collect();
        assert_eq!(bridge.sector_write(1, 2, 2, &payload), DiskResult::Ok);
        assert_eq!(&second.lock().data[1024..], &payload[..]);
        assert!(first.lock().data.iter().all(|b| *b == 0));

        let mut back = vec![0u8; 1024];
        assert_eq!(bridge.sector_read(0, 2, 2, &mut back), DiskResult::Ok);
        assert!(back.iter().all(|b| *b == 0));
        assert_eq!(bridge.sector_read(1, 2, 2, &mut back), DiskResult::Ok);
        assert_eq!(back, payload);
        assert_eq!(bridge.sector_read(1, 3, 2, &mut back), DiskResult::Error);

        assert_eq!(bridge.sector_read(1, 4, 0, &mut []), DiskResult::Ok);
        assert_eq!(bridge.sector_write(0, 0, 0, &[]), DiskResult::Ok);
        assert!(first.lock().data.iter().all(|b| *b == 0));
    }

    #[test]
    fn missing_device_reports_errors() {
        let registry = DeviceRegistry::new();
        let bridge = registry.bridge();
        let mut buf = [0u8; 512];
        assert_eq!(bridge.sector_read(3, 0, 1, &mut buf), DiskResult::Error);
        assert_eq!(bridge.sector_write(3, 0, 1, &buf), DiskResult::Error);
        assert_eq!(bridge.sector_size(3), 0);
        assert_eq!(bridge.sector_count(3), 0);
        assert_eq!(bridge.initialize(3), DiskStatus::NOINIT | DiskStatus::NODISK);
        assert_eq!(bridge.status(3), DiskStatus::NOINIT | DiskStatus::NODISK);
    }

    #[test]
    fn short_buffer_is_rejected_before_device_io() {
        let registry = DeviceRegistry::new();
        let device = Arc::new(Mutex::new(TestBlockDevice::new(4)));
        registry.register(0, device.clone()).unwrap();
        let bridge = registry.bridge();
        let mut buf = [0u8; 700];
        assert_eq!(bridge.sector_read(0, 0, 2, &mut buf), DiskResult::ParamError);
        assert_eq!(device.lock().reads, 0);
        // A larger buffer is fine; only the first count * size bytes are touched.
        let mut big = [0x11u8; 1500];
        assert_eq!(bridge.sector_read(0, 0, 2, &mut big), DiskResult::Ok);
        assert!(big[..1024].iter().all(|b| *b == 0));
        assert!(big[1024..].iter().all(|b| *b == 0x11));
    }

    #[test]
    fn short_transfer_is_a_hard_error() {
        let registry = DeviceRegistry::new();
        let mut device = TestBlockDevice::new(4);
        device.short_by = 10;
        registry.register(0, shared(device)).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(registry.bridge().sector_read(0, 0, 1, &mut buf), DiskResult::Error);
    }

    #[test]
    fn failed_self_check_is_not_initialized() {
        let registry = DeviceRegistry::new();
        let mut device = TestBlockDevice::new(4);
        device.healthy = false;
        registry.register(0, shared(device)).unwrap();
        let bridge = registry.bridge();
        assert_eq!(bridge.initialize(0), DiskStatus::NOINIT);
        assert_eq!(bridge.status(0), DiskStatus::NOINIT);
    }

    #[test]
    fn write_protected_media_is_flagged() {
        let registry = DeviceRegistry::new();
        let mut device = TestBlockDevice::new(4);
        device.protected = true;
        registry.register(0, shared(device)).unwrap();
        let bridge = registry.bridge();
        assert_eq!(bridge.initialize(0), DiskStatus::PROTECT);
        assert_eq!(bridge.status(0), DiskStatus::PROTECT);
    }

    #[test]
    fn register_is_unique() {
        let registry = DeviceRegistry::new();
        registry.register(0, shared(TestBlockDevice::new(1))).unwrap();
        assert_eq!(
            registry.register(0, shared(TestBlockDevice::new(1))).unwrap_err(),
            VfsError::Busy
        );
        assert!(registry.unregister(0).is_some());
        assert!(registry.unregister(0).is_none());
        assert!(registry.is_empty());
    }
}
