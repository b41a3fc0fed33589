use bitflags::bitflags;

use crate::{FatCode, VfsError};

bitflags! {
    /// POSIX open flags, using the Linux numeric values.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREATE = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
    }
}

impl OpenFlags {
    pub const RDONLY: Self = Self::empty();
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccessMode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const CREATE_NEW = 0x04;
        const CREATE_ALWAYS = 0x08;
        const OPEN_ALWAYS = 0x10;
        const OPEN_APPEND = 0x30;
    }
}

impl AccessMode {
    pub const OPEN_EXISTING: Self = Self::empty();

    pub fn creates(&self) -> bool {
        self.intersects(Self::CREATE_NEW | Self::CREATE_ALWAYS | Self::OPEN_ALWAYS)
    }

    pub fn seeks_to_end(&self) -> bool {
        self.contains(Self::OPEN_APPEND)
    }

    /// True when opening with this mode may change the medium.
    pub fn modifies(&self) -> bool {
        self.contains(Self::WRITE) || self.creates()
    }
}

const RDONLY: u32 = 0;
const CREATE: u32 = OpenFlags::CREATE.bits();
const WRONLY: u32 = OpenFlags::WRONLY.bits();
const WRONLY_CREATE: u32 = WRONLY | CREATE;
const WRONLY_CREATE_TRUNC: u32 = WRONLY_CREATE | OpenFlags::TRUNC.bits();
const WRONLY_CREATE_APPEND: u32 = WRONLY_CREATE | OpenFlags::APPEND.bits();
const RDWR: u32 = OpenFlags::RDWR.bits();
const RDWR_CREATE_TRUNC: u32 = RDWR | CREATE | OpenFlags::TRUNC.bits();
const RDWR_CREATE_APPEND: u32 = RDWR | CREATE | OpenFlags::APPEND.bits();

/// Maps an exact POSIX flag combination onto the engine access mode.
///
/// Only the combinations below are recognised; anything else opens the file
/// for reading.
pub fn translate_flags(flags: OpenFlags) -> AccessMode {
    match flags.bits() {
        RDONLY => AccessMode::READ,
        CREATE => AccessMode::CREATE_ALWAYS,
        WRONLY | WRONLY_CREATE | WRONLY_CREATE_TRUNC => {
            AccessMode::CREATE_ALWAYS | AccessMode::WRITE
        }
        WRONLY_CREATE_APPEND => AccessMode::OPEN_APPEND | AccessMode::WRITE,
        RDWR => AccessMode::READ | AccessMode::WRITE,
        RDWR_CREATE_TRUNC => AccessMode::CREATE_ALWAYS | AccessMode::WRITE | AccessMode::READ,
        RDWR_CREATE_APPEND => AccessMode::OPEN_APPEND | AccessMode::WRITE | AccessMode::READ,
        _ => AccessMode::READ,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

impl TryFrom<i32> for SeekWhence {
    type Error = VfsError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            _ => Err(VfsError::Fat(FatCode::InvalidParameter)),
        }
    }
}
