//! In-memory device: an arena of allocations behind synthetic offsets.

use std::collections::BTreeMap;

use crate::error::{Error, ErrorCode, Result};
use crate::os::Device;

/// Arena-backed device for `IN_MEMORY` environments.
///
/// `alloc` hands out monotonically increasing pseudo-offsets; the side
/// table maps each offset to its allocation so that page addresses and
/// blob ids keep the same 64-bit handle shape as on disk.
pub struct InMemoryDevice {
    page_size: u32,
    file_size_limit: u64,
    /// allocation base offset -> buffer
    arena: BTreeMap<u64, Vec<u8>>,
    /// next pseudo-offset to hand out
    high_water: u64,
    open: bool,
}

impl InMemoryDevice {
    pub fn new(page_size: u32, file_size_limit: u64) -> Self {
        InMemoryDevice {
            page_size,
            file_size_limit,
            arena: BTreeMap::new(),
            high_water: 0,
            open: false,
        }
    }

    /// Find the allocation containing `offset` and the relative position
    /// inside it.
    fn locate(&self, offset: u64, len: usize) -> Result<(u64, usize)> {
        let (base, buf) = self
            .arena
            .range(..=offset)
            .next_back()
            .ok_or_else(|| Error::with_message(ErrorCode::IoError, "read past end of arena"))?;
        let rel = (offset - base) as usize;
        if rel + len > buf.len() {
            return Err(Error::with_message(ErrorCode::IoError, "range crosses allocation"));
        }
        Ok((*base, rel))
    }
}

impl Device for InMemoryDevice {
    fn create(&mut self) -> Result<()> {
        self.arena.clear();
        self.high_water = 0;
        self.open = true;
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        // an in-memory environment cannot be reopened
        Err(Error::new(ErrorCode::InvParameter))
    }

    fn close(&mut self) -> Result<()> {
        self.arena.clear();
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.high_water)
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        // drop whole allocations above the cut; partial truncation of an
        // allocation never happens (the pager frees page-aligned runs)
        let doomed: Vec<u64> = self.arena.range(new_size..).map(|(base, _)| *base).collect();
        for base in doomed {
            self.arena.remove(&base);
        }
        self.high_water = self.high_water.min(new_size);
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (base, rel) = self.locate(offset, buf.len())?;
        let src = &self.arena[&base][rel..rel + buf.len()];
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let (base, rel) = self.locate(offset, buf.len())?;
        let dst = self.arena.get_mut(&base).expect("located allocation");
        dst[rel..rel + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn alloc(&mut self, len: u64) -> Result<u64> {
        if self.file_size_limit != 0 && self.high_water + len > self.file_size_limit {
            return Err(Error::new(ErrorCode::LimitsReached));
        }
        // never hand out offset 0; 0 means "no page" everywhere
        if self.high_water == 0 {
            self.high_water = self.page_size as u64;
        }
        let offset = self.high_water;
        self.arena.insert(offset, vec![0u8; len as usize]);
        self.high_water += len;
        Ok(offset)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_read_write() {
        let mut dev = InMemoryDevice::new(1024, 0);
        dev.create().unwrap();

        let a = dev.alloc(1024).unwrap();
        let b = dev.alloc(2048).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);

        dev.write(b + 100, b"payload").unwrap();
        let mut buf = [0u8; 7];
        dev.read(b + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_read_across_allocations_fails() {
        let mut dev = InMemoryDevice::new(1024, 0);
        dev.create().unwrap();
        let a = dev.alloc(1024).unwrap();
        let mut buf = vec![0u8; 2048];
        assert!(dev.read(a, &mut buf).is_err());
    }

    #[test]
    fn test_limit() {
        let mut dev = InMemoryDevice::new(1024, 2048);
        dev.create().unwrap();
        dev.alloc(1024).unwrap();
        assert_eq!(
            dev.alloc(1024).unwrap_err().code(),
            ErrorCode::LimitsReached
        );
    }
}
