//! # Block Device Abstraction
//!
//! The serializer never touches `std::fs` directly; it goes through the
//! [`BlockDevice`] trait, a copy-based positioned-I/O seam. This keeps the
//! storage backend pluggable (buffered file I/O today, direct I/O or an
//! in-memory device later) and gives tests a place to inject faults.
//!
//! ## Copy-Based Interface
//!
//! ```text
//! fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()>;
//! fn write_at(&self, off: u64, data: &[u8]) -> Result<()>;
//! ```
//!
//! All offsets handed to a device are block-aligned by construction; the
//! device itself does not care.
//!
//! ## Durability
//!
//! `write_at` hands data to the operating system; it is durable only after
//! `sync()`. The serializer orders its metablock publication behind a sync,
//! which is the fence the rest of the engine relies on.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};

/// Positioned block I/O over some backing store.
///
/// Implementations must be safe to call from any thread; the engine only
/// ever calls a given device from its serializer's home core, but the `Arc`
/// holding it travels through task closures.
pub trait BlockDevice: Send + Sync {
    /// Fills `buf` from `off`. Short reads are errors.
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` at `off`.
    fn write_at(&self, off: u64, data: &[u8]) -> Result<()>;

    /// Flushes everything written so far to durable storage.
    fn sync(&self) -> Result<()>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Grows or truncates the backing store.
    fn set_len(&self, len: u64) -> Result<()>;
}

/// Shared device reference as threaded through I/O task closures.
pub type SharedDevice = Arc<dyn BlockDevice>;

/// File-backed device using positioned reads and writes.
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    /// Creates a new file; fails if one already exists at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create data file at {:?}", path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file at {:?}", path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, off)
            .wrap_err_with(|| format!("read of {} bytes at {} failed in {:?}", buf.len(), off, self.path))
    }

    fn write_at(&self, off: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, off)
            .wrap_err_with(|| format!("write of {} bytes at {} failed in {:?}", data.len(), off, self.path))
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("sync failed in {:?}", self.path))
    }

    fn len(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .wrap_err_with(|| format!("stat failed in {:?}", self.path))?;
        Ok(meta.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("resize to {} bytes failed in {:?}", len, self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");

        let dev = FileDevice::create(&path).unwrap();
        dev.write_at(4096, b"hello device").unwrap();
        dev.sync().unwrap();
        drop(dev);

        let dev = FileDevice::open(&path).unwrap();
        let mut buf = [0u8; 12];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"hello device");
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        FileDevice::create(&path).unwrap();
        assert!(FileDevice::create(&path).is_err());
    }

    #[test]
    fn set_len_grows_and_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        let dev = FileDevice::create(&path).unwrap();

        dev.set_len(1 << 20).unwrap();
        assert_eq!(dev.len().unwrap(), 1 << 20);

        dev.set_len(4096).unwrap();
        assert_eq!(dev.len().unwrap(), 4096);
    }

    #[test]
    fn short_read_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        let dev = FileDevice::create(&path).unwrap();
        dev.set_len(100).unwrap();

        let mut buf = [0u8; 200];
        assert!(dev.read_at(0, &mut buf).is_err());
    }
}
