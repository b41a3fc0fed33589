use thiserror::Error;

/// Result codes returned by the FAT engine primitives.
///
/// The numeric values match the engine's own table; `ReadOnly` and
/// `NotImplemented` are adapter-defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[repr(u8)]
pub enum FatCode {
    #[error("(1) A hard error occurred in the low level disk I/O layer")]
    DiskErr = 1,
    #[error("(2) Assertion failed")]
    IntErr = 2,
    #[error("(3) The physical drive cannot work")]
    NotReady = 3,
    #[error("(4) Could not find the file")]
    NoFile = 4,
    #[error("(5) Could not find the path")]
    NoPath = 5,
    #[error("(6) The path name format is invalid")]
    InvalidName = 6,
    #[error("(7) Access denied due to prohibited access or directory full")]
    Denied = 7,
    #[error("(8) Access denied due to prohibited access")]
    Exist = 8,
    #[error("(9) The file/directory object is invalid")]
    InvalidObject = 9,
    #[error("(10) The physical drive is write protected")]
    WriteProtected = 10,
    #[error("(11) The logical drive number is invalid")]
    InvalidDrive = 11,
    #[error("(12) The volume has no work area")]
    NotEnabled = 12,
    #[error("(13) There is no valid FAT volume")]
    NoFilesystem = 13,
    #[error("(14) The mkfs aborted due to any problem")]
    MkfsAborted = 14,
    #[error("(15) Could not get a grant to access the volume within defined period")]
    Timeout = 15,
    #[error("(16) The operation is rejected according to the file sharing policy")]
    Locked = 16,
    #[error("(17) LFN working buffer could not be allocated")]
    NotEnoughCore = 17,
    #[error("(18) Number of open files exceeds the lock table")]
    TooManyOpenFiles = 18,
    #[error("(19) Given parameter is invalid")]
    InvalidParameter = 19,
    #[error("(99) Read-only filesystem")]
    ReadOnly = 99,
    #[error("(e0) Feature not implemented")]
    NotImplemented = 0xe0,
}

pub type FatOutcome<T> = core::result::Result<T, FatCode>;

impl FatCode {
    const ALL: [FatCode; 21] = [
        Self::DiskErr,
        Self::IntErr,
        Self::NotReady,
        Self::NoFile,
        Self::NoPath,
        Self::InvalidName,
        Self::Denied,
        Self::Exist,
        Self::InvalidObject,
        Self::WriteProtected,
        Self::InvalidDrive,
        Self::NotEnabled,
        Self::NoFilesystem,
        Self::MkfsAborted,
        Self::Timeout,
        Self::Locked,
        Self::NotEnoughCore,
        Self::TooManyOpenFiles,
        Self::InvalidParameter,
        Self::ReadOnly,
        Self::NotImplemented,
    ];

    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// Looks up a non-zero result code. Zero is success and has no variant.
    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.raw() == raw)
    }

    /// Turns a raw engine result into a `Result`. Unknown non-zero codes are
    /// reported as an internal assertion failure.
    pub fn check(raw: u8) -> FatOutcome<()> {
        if raw == 0 {
            return Ok(());
        }
        Err(Self::from_raw(raw).unwrap_or(Self::IntErr))
    }
}

/// POSIX-style error conditions surfaced by the volume adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("file does not exist")]
    NotFound,
    #[error("invalid argument")]
    Invalid,
    /// The medium ran out of clusters; `written` bytes made it to the file.
    #[error("volume is full ({written} bytes written)")]
    VolumeFull { written: usize },
    #[error("volume is busy")]
    Busy,
    #[error("operation not supported")]
    NotSupported,
    #[error("fatfs: {0}")]
    Fat(FatCode),
}

pub type VfsResult<T> = core::result::Result<T, VfsError>;

impl From<FatCode> for VfsError {
    fn from(code: FatCode) -> Self {
        match code {
            FatCode::NoFile => Self::NotFound,
            FatCode::InvalidObject => Self::Invalid,
            FatCode::NotImplemented => Self::NotSupported,
            other => Self::Fat(other),
        }
    }
}

impl VfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn raw_codes_round_trip() {
        for code in FatCode::ALL {
            assert_eq!(FatCode::from_raw(code.raw()), Some(code));
        }
        assert_eq!(FatCode::from_raw(0), None);
        assert_eq!(FatCode::from_raw(42), None);
        assert_eq!(FatCode::NotImplemented.raw(), 0xe0);
        assert_eq!(FatCode::ReadOnly.raw(), 99);
    }

    #[test]
    fn check_maps_zero_to_ok() {
        assert_eq!(FatCode::check(0), Ok(()));
        assert_eq!(FatCode::check(4), Err(FatCode::NoFile));
        assert_eq!(FatCode::check(200), Err(FatCode::IntErr));
    }

    #[test]
    fn posix_mapping() {
        assert_eq!(VfsError::from(FatCode::NoFile), VfsError::NotFound);
        assert_eq!(VfsError::from(FatCode::InvalidObject), VfsError::Invalid);
        assert_eq!(VfsError::from(FatCode::NotImplemented), VfsError::NotSupported);
        assert_eq!(VfsError::from(FatCode::Exist), VfsError::Fat(FatCode::Exist));
    }

    #[test]
    fn display_text() {
        assert_eq!(
            FatCode::NoFile.to_string(),
            "(4) Could not find the file"
        );
        assert_eq!(
            VfsError::Fat(FatCode::Denied).to_string(),
            "fatfs: (7) Access denied due to prohibited access or directory full"
        );
    }
}
