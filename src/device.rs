use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{SECTOR_BYTES, SECTOR_SIZE};
use crate::sectors::Sector;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device reports zero length: {0}")]
    Empty(String),
}

/// Positioned, read-only access to a block device or raw image.
///
/// Implementations carry no cursor; every scanner keeps its own position in
/// a [`SectorReader`], so concurrent readers never share seek state.
pub trait DeviceSource: Send + Sync {
    fn len(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RawDeviceSource {
    file: File,
    len: u64,
    #[cfg(not(unix))]
    lock: std::sync::Mutex<()>,
}

impl RawDeviceSource {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let mut file = File::open(path)?;
        // Block devices report a zero metadata length; seeking to the end works for both.
        let len = {
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::End(0))?
        };
        if len == 0 {
            return Err(DeviceError::Empty(path.display().to_string()));
        }
        advise_random_access(&file);
        Ok(Self {
            file,
            len,
            #[cfg(not(unix))]
            lock: std::sync::Mutex::new(()),
        })
    }
}

#[cfg(target_os = "linux")]
fn advise_random_access(file: &File) {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM) };
    if rc != 0 {
        debug!("posix_fadvise failed: {}", std::io::Error::from_raw_os_error(rc));
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_random_access(_file: &File) {}

impl DeviceSource for RawDeviceSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let _guard = self
                .lock
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut f = &self.file;
            f.seek(SeekFrom::Start(offset))?;
            Ok(f.read(buf)?)
        }
    }
}

/// Device backed by a byte buffer.
pub struct MemorySource {
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl DeviceSource for MemorySource {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.bytes.len());
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        Ok(n)
    }
}

pub fn open_device(path: &Path) -> Result<Arc<dyn DeviceSource>, DeviceError> {
    Ok(Arc::new(RawDeviceSource::open(path)?))
}

/// Sector-at-a-time cursor over a [`DeviceSource`], owned by exactly one scanner.
pub struct SectorReader {
    source: Arc<dyn DeviceSource>,
    position: u64,
}

impl SectorReader {
    pub fn new(source: Arc<dyn DeviceSource>) -> Self {
        Self {
            source,
            position: 0,
        }
    }

    pub fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    /// Advance the cursor without reading.
    pub fn skip(&mut self, bytes: u64) {
        self.position = self.position.saturating_add(bytes);
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn device_len(&self) -> u64 {
        self.source.len()
    }

    /// Read the sector at the cursor and advance past it. Short reads and
    /// read errors both end the scan for this reader and come back as `None`.
    pub fn read_sector(&mut self) -> Option<Sector> {
        let mut sector = [0u8; SECTOR_SIZE];
        let mut filled = 0usize;
        while filled < SECTOR_SIZE {
            let offset = self.position + filled as u64;
            match self.source.read_at(offset, &mut sector[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => {
                    warn!("read error at offset {offset:#x}: {err}");
                    return None;
                }
            }
        }
        if filled < SECTOR_SIZE {
            if filled > 0 {
                debug!(
                    "short read of {filled} bytes at offset {:#x}; treating as end of device",
                    self.position
                );
            }
            return None;
        }
        self.position += SECTOR_BYTES;
        Some(sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(bytes: &[u8]) -> (tempfile::TempDir, Arc<dyn DeviceSource>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        std::fs::write(&path, bytes).expect("write image");
        let source = open_device(&path).expect("open");
        (dir, source)
    }

    #[test]
    fn reads_sectors_and_advances() {
        let mut bytes = vec![1u8; SECTOR_SIZE];
        bytes.extend(vec![2u8; SECTOR_SIZE]);
        let (_dir, source) = image(&bytes);
        assert_eq!(source.len(), 1024);

        let mut reader = SectorReader::new(source);
        assert_eq!(reader.read_sector().expect("first")[0], 1);
        assert_eq!(reader.position(), 512);
        assert_eq!(reader.read_sector().expect("second")[0], 2);
        assert!(reader.read_sector().is_none());
        assert_eq!(reader.position(), 1024);
    }

    #[test]
    fn partial_trailing_sector_is_end_of_device() {
        let (_dir, source) = image(&vec![5u8; SECTOR_SIZE + 100]);
        let mut reader = SectorReader::new(source);
        reader.seek(512);
        assert!(reader.read_sector().is_none());
        assert_eq!(reader.position(), 512);
    }

    #[test]
    fn skip_moves_cursor_without_reading() {
        let mut bytes = vec![0u8; SECTOR_SIZE * 4];
        bytes[SECTOR_SIZE * 3] = 9;
        let (_dir, source) = image(&bytes);
        let mut reader = SectorReader::new(source);
        reader.read_sector();
        reader.skip(2 * SECTOR_BYTES);
        assert_eq!(reader.read_sector().expect("fourth")[0], 9);
    }

    #[test]
    fn rejects_empty_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.img");
        std::fs::write(&path, b"").expect("write");
        assert!(matches!(open_device(&path), Err(DeviceError::Empty(_))));
    }
}
