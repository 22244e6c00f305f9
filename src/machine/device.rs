//! Block devices
//!
//! Random-access byte stores used as the swap file and as executable
//! images. Transfers report how many bytes actually moved; callers that
//! need all-or-nothing semantics check the count themselves.

use alloc::vec::Vec;
use spin::Mutex;
use thiserror::Error;

/// Device-level failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("offset {offset} beyond end of device")]
    OutOfRange { offset: u64 },

    #[error("device is read-only")]
    ReadOnly,

    #[error("no such device or file")]
    NotFound,

    #[error("I/O error (code {code})")]
    Io { code: i32 },
}

/// A random-access byte store
pub trait BlockDevice: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Write up to `buf.len()` bytes at `offset`, returning the count written
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, DeviceError>;
}

// ============================================================================
// In-Memory Device
// ============================================================================

/// Device backed by kernel memory
///
/// Grows on write up to an optional capacity; writes crossing the
/// capacity are cut short.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    capacity: Option<usize>,
    read_only: bool,
}

impl MemDevice {
    /// Create an empty, unbounded, writable device
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            capacity: None,
            read_only: false,
        }
    }

    /// Create an empty writable device holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            capacity: Some(capacity),
            read_only: false,
        }
    }

    /// Create a read-only device with fixed contents (an executable image)
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(bytes),
            capacity: None,
            read_only: true,
        }
    }

    /// Current size in bytes
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let data = self.data.lock();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, DeviceError> {
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        let start = offset as usize;
        let end = match self.capacity {
            Some(cap) if start >= cap => return Err(DeviceError::OutOfRange { offset }),
            Some(cap) => (start + buf.len()).min(cap),
            None => start + buf.len(),
        };

        let mut data = self.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        let count = end - start;
        data[start..end].copy_from_slice(&buf[..count]);
        Ok(count)
    }
}

// ============================================================================
// Host File Device
// ============================================================================

#[cfg(feature = "std")]
pub use self::file::FileDevice;

#[cfg(feature = "std")]
mod file {
    use super::{BlockDevice, DeviceError};
    use spin::Mutex;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;

    impl From<std::io::Error> for DeviceError {
        fn from(err: std::io::Error) -> Self {
            match err.kind() {
                std::io::ErrorKind::NotFound => DeviceError::NotFound,
                _ => DeviceError::Io {
                    code: err.raw_os_error().unwrap_or(-1),
                },
            }
        }
    }

    /// Device backed by a host file
    pub struct FileDevice {
        file: Mutex<File>,
    }

    impl FileDevice {
        /// Open `path` read/write, creating it if absent
        pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            Ok(Self {
                file: Mutex::new(file),
            })
        }

        /// Open an existing file read-only (an executable image)
        pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
            let file = File::open(path)?;
            Ok(Self {
                file: Mutex::new(file),
            })
        }
    }

    impl BlockDevice for FileDevice {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            let mut done = 0;
            while done < buf.len() {
                match file.read(&mut buf[done..])? {
                    0 => break,
                    n => done += n,
                }
            }
            Ok(done)
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, DeviceError> {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
            Ok(buf.len())
        }
    }
}
