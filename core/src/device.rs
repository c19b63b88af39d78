// Block device abstraction - the seekable byte stream the engine reads and writes
// Volume images on disk use FileDevice; tests mostly use MemoryDevice

use crate::error::{NtfsError, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Byte-addressed access to a raw volume.
pub trait BlockDevice: Send {
    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Total size in bytes.
    fn size(&self) -> u64;

    fn flush(&mut self) -> Result<()>;
}

fn check_bounds(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| NtfsError::InvalidInput(format!("offset {} overflows", offset)))?;
    if end > size {
        return Err(NtfsError::InvalidInput(format!(
            "access {}..{} beyond device size {}",
            offset, end, size
        )));
    }
    Ok(())
}

/// A volume image or raw device node opened through std::fs.
pub struct FileDevice {
    file: File,
    size: u64,
    writable: bool,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path.as_ref())?;
        let size = file.metadata()?.len();
        debug!("Opened {} ({} bytes, writable={})", path.as_ref().display(), size, writable);
        Ok(Self { file, size, writable })
    }

    /// Create (or truncate) an image file of exactly `size` bytes.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        debug!("Created image {} of {} bytes", path.as_ref().display(), size);
        Ok(Self { file, size, writable: true })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(NtfsError::NotSupported("device opened read-only".to_string()));
        }
        check_bounds(offset, data.len(), self.size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// An in-memory volume.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0u8; size] }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len(), self.data.len() as u64)?;
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_bounds() {
        let mut dev = MemoryDevice::new(1024);
        dev.write_at(1020, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        dev.read_at(1020, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(dev.write_at(1021, &[0; 4]).is_err());
        assert!(dev.read_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_file_device_roundtrip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let mut dev = FileDevice::create(tmp.path(), 8192).unwrap();
            assert_eq!(dev.size(), 8192);
            dev.write_at(4096, b"NTFS").unwrap();
            dev.flush().unwrap();
        }
        let mut dev = FileDevice::open(tmp.path(), false).unwrap();
        let mut buf = [0u8; 4];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"NTFS");
        assert!(dev.write_at(0, &buf).is_err());
    }
}
