//! On-disk device: positional file I/O with an exclusive lock.

use std::fs::{File, OpenOptions};

use fs2::FileExt;

use crate::error::{Error, ErrorCode, Result};
use crate::os::Device;
use crate::types::EnvFlags;

/// File-backed device.
///
/// All reads and writes are positional (`pread`/`pwrite`); nothing is
/// buffered in user space. The file is locked exclusively for the lifetime
/// of the device; a second opener fails immediately with `WouldBlock`.
pub struct DiskDevice {
    path: String,
    flags: EnvFlags,
    page_size: u32,
    file_size_limit: u64,
    file: Option<File>,
}

impl DiskDevice {
    pub fn new(path: &str, flags: EnvFlags, page_size: u32, file_size_limit: u64) -> Self {
        DiskDevice {
            path: path.to_string(),
            flags,
            page_size,
            file_size_limit,
            file: None,
        }
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            Error::with_message(ErrorCode::NotReady, "device is closed")
        })
    }

    fn lock_and_advise(&self, file: &File) -> Result<()> {
        file.try_lock_exclusive()
            .map_err(|_| Error::with_message(ErrorCode::WouldBlock, self.path.clone()))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let advice = if self.flags.contains(EnvFlags::RANDOM_ACCESS) {
                libc::POSIX_FADV_RANDOM
            } else {
                libc::POSIX_FADV_NORMAL
            };
            // Purely an optimization hint; ignore failures.
            unsafe {
                libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice);
            }
        }
        Ok(())
    }
}

impl Device for DiskDevice {
    fn create(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        self.lock_and_advise(&file)?;
        self.file = Some(file);
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        let writable = !self.flags.contains(EnvFlags::READ_ONLY);
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&self.path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::with_message(ErrorCode::IoError, self.path.clone())
                }
                _ => err.into(),
            })?;
        self.lock_and_advise(&file)?;

        let size = file.metadata()?.len();
        if size == 0 {
            return Err(Error::with_message(ErrorCode::IoError, "file is empty"));
        }
        if size < self.page_size as u64 {
            return Err(Error::new(ErrorCode::InvFileHeader));
        }

        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            let _ = FileExt::unlock(&file);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.file()?.set_len(new_size)?;
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt as UnixFileExt;
            self.file()?.read_exact_at(buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = self.file()?.try_clone()?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.flags.contains(EnvFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::WriteProtected));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt as UnixFileExt;
            self.file()?.write_all_at(buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = self.file()?.try_clone()?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
        }
        Ok(())
    }

    fn alloc(&mut self, len: u64) -> Result<u64> {
        let offset = self.file_size()?;
        if self.file_size_limit != 0 && offset + len > self.file_size_limit {
            return Err(Error::new(ErrorCode::LimitsReached));
        }
        // set_len zero-fills the extension
        self.file()?.set_len(offset + len)?;
        Ok(offset)
    }

    fn flush(&mut self) -> Result<()> {
        self.file()?.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device(path: &str) -> DiskDevice {
        DiskDevice::new(path, EnvFlags::empty(), 1024, 0)
    }

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.db");
        let mut dev = device(path.to_str().unwrap());
        dev.create().unwrap();

        let offset = dev.alloc(2048).unwrap();
        assert_eq!(offset, 0);
        dev.write(1024, b"hello").unwrap();

        let mut buf = [0u8; 5];
        dev.read(1024, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(dev.file_size().unwrap(), 2048);
    }

    #[test]
    fn test_open_empty_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.db");
        std::fs::File::create(&path).unwrap();

        let mut dev = device(path.to_str().unwrap());
        let err = dev.open().unwrap_err();
        assert_eq!(err.code(), ErrorCode::IoError);
    }

    #[test]
    fn test_open_short_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::write(&path, b"ham").unwrap();

        let mut dev = device(path.to_str().unwrap());
        let err = dev.open().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvFileHeader);
    }

    #[test]
    fn test_file_size_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("limited.db");
        let mut dev = DiskDevice::new(path.to_str().unwrap(), EnvFlags::empty(), 1024, 2048);
        dev.create().unwrap();
        dev.alloc(2048).unwrap();
        let err = dev.alloc(1024).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LimitsReached);
    }

    #[test]
    fn test_second_opener_would_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let mut first = device(path.to_str().unwrap());
        first.create().unwrap();
        first.alloc(1024).unwrap();

        let mut second = device(path.to_str().unwrap());
        let err = second.open().unwrap_err();
        assert_eq!(err.code(), ErrorCode::WouldBlock);
    }
}
