use std::collections::BTreeMap;
use std::sync::Arc;

use fatvfs::{translate_flags, AccessMode, FatCode, FatOutcome, FileAttr, Metadata, OpenFlags, VfsError, VfsResult};
use log::{debug, warn};
use spin::{Mutex, MutexGuard};

use crate::block::{DeviceRegistry, SharedDevice, VolumeId};
use crate::config::VolumeConfig;
use crate::engine::{DirCursor, FatEngine, FileCursor};
use crate::fat32::Fat32Engine;
use crate::file::{FileHandle, HandleMode};

pub type HandleId = u64;

pub(crate) enum Cursor {
    File(FileCursor),
    Dir(DirCursor),
}

pub(crate) struct OpenObject {
    pub path: String,
    pub cursor: Cursor,
}

pub(crate) struct VolumeState {
    pub engine: Box<dyn FatEngine>,
    pub mounted: bool,
    pub handles: BTreeMap<HandleId, OpenObject>,
    next_handle: HandleId,
}

impl VolumeState {
    fn new(engine: Box<dyn FatEngine>) -> Self {
        Self {
            engine,
            mounted: false,
            handles: BTreeMap::new(),
            next_handle: 0,
        }
    }

    fn insert(&mut self, path: &str, cursor: Cursor) -> HandleId {
        self.next_handle += 1;
        self.handles.insert(
            self.next_handle,
            OpenObject {
                path: path.into(),
                cursor,
            },
        );
        self.next_handle
    }

    pub fn close_cursor(&mut self, cursor: Cursor) -> FatOutcome<()> {
        match cursor {
            Cursor::File(file) => self.engine.close(file),
            Cursor::Dir(dir) => self.engine.closedir(dir),
        }
    }

    /// Runs `op` against the file cursor registered under `id`.
    pub fn with_file<T>(
        &mut self,
        id: HandleId,
        op: impl FnOnce(&mut dyn FatEngine, &FileCursor) -> FatOutcome<T>,
    ) -> VfsResult<T> {
        match self.handles.get(&id).map(|object| &object.cursor) {
            Some(Cursor::File(file)) => op(self.engine.as_mut(), file).map_err(VfsError::from),
            _ => Err(VfsError::Invalid),
        }
    }

    pub fn with_dir<T>(
        &mut self,
        id: HandleId,
        op: impl FnOnce(&mut dyn FatEngine, &DirCursor) -> FatOutcome<T>,
    ) -> VfsResult<T> {
        match self.handles.get(&id).map(|object| &object.cursor) {
            Some(Cursor::Dir(dir)) => op(self.engine.as_mut(), dir).map_err(VfsError::from),
            _ => Err(VfsError::Invalid),
        }
    }
}

fn is_root(path: &str) -> bool {
    matches!(path.trim_matches('/'), "" | ".")
}

/// One FAT volume bound to a volume id in a [`DeviceRegistry`].
pub struct Volume {
    id: VolumeId,
    prefix: String,
    registry: Arc<DeviceRegistry>,
    config: VolumeConfig,
    state: Arc<Mutex<VolumeState>>,
}

impl Volume {
    pub fn new(id: VolumeId, registry: Arc<DeviceRegistry>) -> Self {
        let engine = Fat32Engine::new(registry.bridge());
        Self::with_engine(id, registry, Box::new(engine))
    }

    pub fn with_engine(id: VolumeId, registry: Arc<DeviceRegistry>, engine: Box<dyn FatEngine>) -> Self {
        Self {
            id,
            prefix: format!("{id}:"),
            registry,
            config: VolumeConfig::default(),
            state: Arc::new(Mutex::new(VolumeState::new(engine))),
        }
    }

    pub fn with_config(mut self, config: VolumeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().mounted
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn open_paths(&self) -> Vec<String> {
        self.state
            .lock()
            .handles
            .values()
            .map(|object| object.path.clone())
            .collect()
    }

    fn engine_path(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path.trim_start_matches('/'))
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.config.read_only {
            return Err(VfsError::Fat(FatCode::ReadOnly));
        }
        Ok(())
    }

    fn lock_mounted(&self) -> VfsResult<MutexGuard<'_, VolumeState>> {
        let state = self.state.lock();
        if !state.mounted {
            return Err(VfsError::Fat(FatCode::NotEnabled));
        }
        Ok(state)
    }

    fn root_metadata(&self) -> Metadata {
        Metadata::new(".".into(), self.config.root_capacity, FileAttr::DIRECTORY, 0)
    }

    /// Lays out an empty FAT32 filesystem on `device`. The volume must not
    /// be mounted; the device is registered only for the duration of the
    /// format.
    pub fn format(&self, device: SharedDevice) -> VfsResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        if state.mounted {
            return Err(VfsError::Busy);
        }
        self.registry.register(self.id, device)?;
        let result = state.engine.mkfs(&self.prefix);
        self.registry.unregister(self.id);
        debug!("volume {}: format -> {:?}", self.id, result);
        result.map_err(VfsError::from)
    }

    /// Registers `device` under this volume's id and mounts it. A failed
    /// mount leaves the id unregistered.
    pub fn mount(&self, device: SharedDevice) -> VfsResult<()> {
        let mut state = self.state.lock();
        if state.mounted {
            return Err(VfsError::Busy);
        }
        self.registry.register(self.id, device)?;
        if let Err(code) = state.engine.mount(&self.prefix) {
            self.registry.unregister(self.id);
            debug!("volume {}: mount failed: {code}", self.id);
            return Err(code.into());
        }
        state.mounted = true;
        state.handles.clear();
        debug!("volume {}: mounted", self.id);
        Ok(())
    }

    /// Closes every handle still open, unmounts, then unregisters the
    /// device. All steps run; the first failure is reported.
    pub fn unmount(&self) -> VfsResult<()> {
        let mut state = self.lock_mounted()?;
        let handles = std::mem::take(&mut state.handles);
        let mut first = None;
        for (id, object) in handles {
            if let Err(code) = state.close_cursor(object.cursor) {
                debug!("volume {}: closing handle {id} ({}) failed: {code}", self.id, object.path);
                first.get_or_insert(code);
            }
        }
        if let Err(code) = state.engine.unmount(&self.prefix) {
            first.get_or_insert(code);
        }
        state.mounted = false;
        self.registry.unregister(self.id);
        debug!("volume {}: unmounted", self.id);
        match first {
            Some(code) => Err(code.into()),
            None => Ok(()),
        }
    }

    fn stat_locked(&self, state: &mut VolumeState, path: &str) -> VfsResult<Metadata> {
        if is_root(path) {
            return Ok(self.root_metadata());
        }
        let info = state.engine.stat(&self.engine_path(path))?;
        Ok(info.to_metadata())
    }

    pub fn stat(&self, path: &str) -> VfsResult<Metadata> {
        debug!("volume {}: stat {path}", self.id);
        if is_root(path) {
            return Ok(self.root_metadata());
        }
        let mut state = self.lock_mounted()?;
        self.stat_locked(&mut state, path)
    }

    pub fn open(&self, path: &str) -> VfsResult<FileHandle> {
        self.open_file(path, OpenFlags::RDONLY, 0)
    }

    /// Opens `path` as a file or, when it names a directory, as a directory
    /// iterator. `flags` only matter for files.
    pub fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> VfsResult<FileHandle> {
        debug!("volume {}: open {path} flags {flags:?} perm {perm:o}", self.id);
        let mut state = self.lock_mounted()?;
        let existing = self.stat_locked(&mut state, path).ok();
        let is_dir = is_root(path) || existing.as_ref().is_some_and(Metadata::is_dir);
        let access = translate_flags(flags);
        let engine_path = self.engine_path(path);
        let (cursor, mode) = if is_dir {
            (Cursor::Dir(state.engine.opendir(&engine_path)?), HandleMode::Directory)
        } else {
            if access.modifies() {
                self.check_writable()?;
            }
            (Cursor::File(state.engine.open(&engine_path, access)?), HandleMode::File)
        };
        let info = match existing {
            Some(info) if !access.contains(AccessMode::CREATE_ALWAYS) => Ok(info),
            _ => self.stat_locked(&mut state, path),
        };
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                if let Err(code) = state.close_cursor(cursor) {
                    warn!("volume {}: releasing cursor for {path} failed: {code}", self.id);
                }
                return Err(err);
            }
        };
        let id = state.insert(path, cursor);
        Ok(FileHandle::new(
            Arc::clone(&self.state),
            id,
            path.into(),
            mode,
            info,
            flags.contains(OpenFlags::APPEND),
        ))
    }

    /// Opens `path` for reading and writing, creating or truncating it.
    pub fn create(&self, path: &str) -> VfsResult<FileHandle> {
        self.open_file(path, OpenFlags::RDWR | OpenFlags::CREATE | OpenFlags::TRUNC, 0o666)
    }

    pub fn remove(&self, path: &str) -> VfsResult<()> {
        debug!("volume {}: remove {path}", self.id);
        self.check_writable()?;
        let mut state = self.lock_mounted()?;
        state.engine.unlink(&self.engine_path(path))?;
        Ok(())
    }

    /// Removes a file. A missing path is not an error; directories are
    /// refused.
    pub fn remove_all(&self, path: &str) -> VfsResult<()> {
        debug!("volume {}: remove_all {path}", self.id);
        match self.stat(path) {
            Ok(meta) if meta.is_dir() => Err(VfsError::Invalid),
            Ok(_) => self.remove(path),
            Err(VfsError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        debug!("volume {}: rename {old} -> {new}", self.id);
        self.check_writable()?;
        let mut state = self.lock_mounted()?;
        state
            .engine
            .rename(&self.engine_path(old), &self.engine_path(new))?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str, perm: u32) -> VfsResult<()> {
        debug!("volume {}: mkdir {path} perm {perm:o}", self.id);
        self.check_writable()?;
        let mut state = self.lock_mounted()?;
        state.engine.mkdir(&self.engine_path(path))?;
        Ok(())
    }

    pub fn mkdir_all(&self, path: &str, perm: u32) -> VfsResult<()> {
        let mut current = String::new();
        for component in path.split('/').filter(|part| !matches!(*part, "" | ".")) {
            current.push('/');
            current.push_str(component);
            match self.stat(&current) {
                Ok(_) => {}
                Err(VfsError::NotFound) => self.mkdir(&current, perm)?,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        debug!("volume {}: chmod {path} {mode:o} unsupported", self.id);
        Err(VfsError::NotSupported)
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        debug!("volume {}: chown {path} {uid}:{gid} unsupported", self.id);
        Err(VfsError::NotSupported)
    }

    pub fn chtimes(&self, path: &str, atime: u64, mtime: u64) -> VfsResult<()> {
        debug!("volume {}: chtimes {path} {atime} {mtime} unsupported", self.id);
        Err(VfsError::NotSupported)
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if self.is_mounted() {
            if let Err(err) = self.unmount() {
                warn!("volume {}: unmount on drop failed: {err}", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FileInfo;

    /// Engine double that records the calls it receives.
    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_mount: Option<FatCode>,
        fail_close: Option<FatCode>,
        next: u64,
    }

    impl Recorder {
        fn log(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn next_id(&mut self) -> u64 {
            self.next += 1;
            self.next
        }
    }

    impl FatEngine for Recorder {
        fn mount(&mut self, prefix: &str) -> FatOutcome<()> {
            self.log(format!("mount {prefix}"));
            self.fail_mount.map_or(Ok(()), Err)
        }

        fn unmount(&mut self, prefix: &str) -> FatOutcome<()> {
            self.log(format!("unmount {prefix}"));
            Ok(())
        }

        fn mkfs(&mut self, prefix: &str) -> FatOutcome<()> {
            self.log(format!("mkfs {prefix}"));
            Ok(())
        }

        fn open(&mut self, path: &str, mode: AccessMode) -> FatOutcome<FileCursor> {
            self.log(format!("open {path} {:#x}", mode.bits()));
            Ok(FileCursor::new(self.next_id()))
        }

        fn close(&mut self, file: FileCursor) -> FatOutcome<()> {
            self.log(format!("close {}", file.id()));
            self.fail_close.map_or(Ok(()), Err)
        }

        fn read(&mut self, _: &FileCursor, _: &mut [u8]) -> FatOutcome<usize> {
            Ok(0)
        }

        fn write(&mut self, _: &FileCursor, buf: &[u8]) -> FatOutcome<usize> {
            Ok(buf.len())
        }

        fn lseek(&mut self, _: &FileCursor, _: u64) -> FatOutcome<()> {
            Ok(())
        }

        fn tell(&self, _: &FileCursor) -> FatOutcome<u64> {
            Ok(0)
        }

        fn size(&self, _: &FileCursor) -> FatOutcome<u64> {
            Ok(0)
        }

        fn truncate(&mut self, _: &FileCursor) -> FatOutcome<()> {
            Ok(())
        }

        fn sync(&mut self, _: &FileCursor) -> FatOutcome<()> {
            Ok(())
        }

        fn opendir(&mut self, path: &str) -> FatOutcome<DirCursor> {
            self.log(format!("opendir {path}"));
            Ok(DirCursor::new(self.next_id()))
        }

        fn closedir(&mut self, dir: DirCursor) -> FatOutcome<()> {
            self.log(format!("closedir {}", dir.id()));
            Ok(())
        }

        fn readdir(&mut self, _: &DirCursor) -> FatOutcome<FileInfo> {
            Ok(FileInfo::default())
        }

        fn stat(&mut self, path: &str) -> FatOutcome<FileInfo> {
            self.log(format!("stat {path}"));
            match path {
                "0:/docs" | "0:/a" => Ok(FileInfo {
                    name: path.rsplit('/').next().unwrap_or_default().into(),
                    attrib: FileAttr::DIRECTORY,
                    ..FileInfo::default()
                }),
                "0:/file.txt" => Ok(FileInfo {
                    name: "file.txt".into(),
                    size: 5,
                    attrib: FileAttr::ARCHIVE,
                    ..FileInfo::default()
                }),
                "0:/broken" => Err(FatCode::DiskErr),
                _ => Err(FatCode::NoFile),
            }
        }

        fn unlink(&mut self, path: &str) -> FatOutcome<()> {
            self.log(format!("unlink {path}"));
            Ok(())
        }

        fn mkdir(&mut self, path: &str) -> FatOutcome<()> {
            self.log(format!("mkdir {path}"));
            Ok(())
        }

        fn rename(&mut self, old: &str, new: &str) -> FatOutcome<()> {
            self.log(format!("rename {old} {new}"));
            Ok(())
        }
    }

    fn device() -> SharedDevice {
        crate::block::shared(crate::image::ImageDevice::new(std::io::Cursor::new(vec![0u8; 4096])))
    }

    fn volume(engine: Recorder) -> (Volume, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::clone(&engine.calls);
        let volume = Volume::with_engine(0, DeviceRegistry::new(), Box::new(engine));
        (volume, calls)
    }

    fn mounted(engine: Recorder) -> (Volume, Arc<Mutex<Vec<String>>>) {
        let (volume, calls) = volume(engine);
        volume.mount(device()).unwrap();
        calls.lock().clear();
        (volume, calls)
    }

    #[test]
    fn mount_registers_then_mounts() {
        let (volume, calls) = volume(Recorder::default());
        assert!(!volume.is_mounted());
        volume.mount(device()).unwrap();
        assert!(volume.is_mounted());
        assert!(volume.registry().is_registered(0));
        assert_eq!(volume.mount(device()).unwrap_err(), VfsError::Busy);
        volume.unmount().unwrap();
        assert!(!volume.registry().is_registered(0));
        assert_eq!(*calls.lock(), ["mount 0:", "unmount 0:"]);
    }

    #[test]
    fn failed_mount_unregisters() {
        let (volume, _) = volume(Recorder {
            fail_mount: Some(FatCode::NoFilesystem),
            ..Recorder::default()
        });
        assert_eq!(
            volume.mount(device()).unwrap_err(),
            VfsError::Fat(FatCode::NoFilesystem)
        );
        assert!(!volume.is_mounted());
        assert!(volume.registry().is_empty());
    }

    #[test]
    fn root_stat_is_synthetic() {
        let (volume, calls) = volume(Recorder::default());
        for path in ["/", ".", ""] {
            let meta = volume.stat(path).unwrap();
            assert!(meta.is_dir());
            assert_eq!(meta.size, 512 * 1024 * 1024);
            assert_eq!(meta.mtime, 0);
        }
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn stat_maps_engine_codes() {
        let (volume, _) = mounted(Recorder::default());
        assert_eq!(volume.stat("/missing").unwrap_err(), VfsError::NotFound);
        assert_eq!(
            volume.stat("/broken").unwrap_err(),
            VfsError::Fat(FatCode::DiskErr)
        );
        assert_eq!(volume.stat("/file.txt").unwrap().size, 5);
    }

    #[test]
    fn directories_open_as_iterators() {
        let (volume, calls) = mounted(Recorder::default());
        let root = volume
            .open_file("/", OpenFlags::WRONLY | OpenFlags::CREATE, 0o644)
            .unwrap();
        assert!(root.is_dir());
        let docs = volume.open("/docs").unwrap();
        assert!(docs.is_dir());
        let file = volume.open("/file.txt").unwrap();
        assert!(!file.is_dir());
        assert_eq!(volume.open_paths(), ["/", "/docs", "/file.txt"]);
        let calls = calls.lock().clone();
        assert!(calls.contains(&"opendir 0:/".to_string()));
        assert!(calls.contains(&"opendir 0:/docs".to_string()));
        assert!(calls.contains(&"open 0:/file.txt 0x1".to_string()));
    }

    #[test]
    fn unmount_sweeps_handles_and_reports_first_error() {
        let (volume, calls) = mounted(Recorder {
            fail_close: Some(FatCode::DiskErr),
            ..Recorder::default()
        });
        let _a = volume.open("/file.txt").unwrap();
        let _b = volume.open("/docs").unwrap();
        assert_eq!(volume.open_handles(), 2);
        assert_eq!(volume.unmount().unwrap_err(), VfsError::Fat(FatCode::DiskErr));
        assert_eq!(volume.open_handles(), 0);
        assert!(volume.registry().is_empty());
        let calls = calls.lock().clone();
        assert!(calls.iter().any(|call| call.starts_with("closedir")));
        assert_eq!(calls.last().map(String::as_str), Some("unmount 0:"));
    }

    #[test]
    fn remove_all_refuses_directories() {
        let (volume, calls) = mounted(Recorder::default());
        assert_eq!(volume.remove_all("/docs").unwrap_err(), VfsError::Invalid);
        volume.remove_all("/missing").unwrap();
        volume.remove_all("/file.txt").unwrap();
        assert!(calls.lock().contains(&"unlink 0:/file.txt".to_string()));
    }

    #[test]
    fn mkdir_all_creates_missing_components() {
        let (volume, calls) = mounted(Recorder::default());
        volume.mkdir_all("/a/b/c", 0o755).unwrap();
        let mkdirs: Vec<String> = calls
            .lock()
            .iter()
            .filter(|call| call.starts_with("mkdir"))
            .cloned()
            .collect();
        assert_eq!(mkdirs, ["mkdir 0:/a/b", "mkdir 0:/a/b/c"]);
        assert_eq!(
            volume.mkdir_all("/broken/x", 0o755).unwrap_err(),
            VfsError::Fat(FatCode::DiskErr)
        );
    }

    #[test]
    fn attribute_changes_are_unsupported() {
        let (volume, _) = mounted(Recorder::default());
        assert_eq!(volume.chmod("/file.txt", 0o600), Err(VfsError::NotSupported));
        assert_eq!(volume.chown("/file.txt", 0, 0), Err(VfsError::NotSupported));
        assert_eq!(volume.chtimes("/file.txt", 0, 0), Err(VfsError::NotSupported));
    }

    #[test]
    fn read_only_volume_refuses_writes() {
        let (volume, calls) = volume(Recorder::default());
        let volume = volume.with_config(VolumeConfig {
            read_only: true,
            ..VolumeConfig::default()
        });
        volume.mount(device()).unwrap();
        let ro = VfsError::Fat(FatCode::ReadOnly);
        assert_eq!(volume.create("/new.txt").unwrap_err(), ro);
        assert_eq!(volume.remove("/file.txt").unwrap_err(), ro);
        assert_eq!(volume.mkdir("/d", 0o755).unwrap_err(), ro);
        assert_eq!(volume.rename("/file.txt", "/b.txt").unwrap_err(), ro);
        volume.open("/file.txt").unwrap();
        assert!(!calls.lock().iter().any(|call| call.starts_with("unlink")));
    }

    #[test]
    fn operations_need_a_mount() {
        let (volume, _) = volume(Recorder::default());
        let not_enabled = VfsError::Fat(FatCode::NotEnabled);
        assert_eq!(volume.open("/file.txt").unwrap_err(), not_enabled);
        assert_eq!(volume.stat("/file.txt").unwrap_err(), not_enabled);
        assert_eq!(volume.unmount().unwrap_err(), not_enabled);
    }

    #[test]
    fn drop_unmounts() {
        let registry = DeviceRegistry::new();
        {
            let volume = Volume::with_engine(3, Arc::clone(&registry), Box::new(Recorder::default()));
            volume.mount(device()).unwrap();
            assert!(registry.is_registered(3));
        }
        assert!(registry.is_empty());
    }
}
