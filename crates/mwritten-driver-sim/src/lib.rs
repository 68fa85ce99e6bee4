//! Simulated address space driver.
//!
//! A software MMU: mappings, per-page protection, byte storage, and a
//! per-page soft-dirty bit serving as the write baseline. A write to a page
//! without write permission is turned into a [`WriteFault`] delivered
//! synchronously to the attached handler, and retried once the handler has
//! released the page.
//!
//! Everything is deterministic, which makes this driver the one the tracker
//! is tested against.
//!
//! [`WriteFault`]: mwritten_core::WriteFault

mod driver;
mod error;

use std::sync::Arc;

use mwritten_core::{
    Mapping, MemoryAccess, TrackerDriver, TrackerError, TrackerInfo, TrackerProtection, Va,
    WriteFaultHandler,
};

pub use self::error::Error;
use self::driver::SimMemory;

/// Simulated address space driver.
pub struct SimDriver {
    inner: SimMemory,
}

impl SimDriver {
    /// Creates an empty address space with the given page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    pub fn new(page_size: u64) -> Self {
        Self {
            inner: SimMemory::new(page_size),
        }
    }

    /// Maps `len` bytes, rounded up to whole pages, at a free address.
    ///
    /// Mappings are separated by at least one unmapped page.
    pub fn map(&self, len: u64, access: MemoryAccess) -> Result<Va, Error> {
        self.inner.map(len, access)
    }

    /// Maps `len` bytes, rounded up to whole pages, at `va`.
    pub fn map_fixed(&self, va: Va, len: u64, access: MemoryAccess) -> Result<Va, Error> {
        self.inner.map_fixed(va, len, access)
    }

    /// Removes the mapping starting at `va`.
    pub fn unmap(&self, va: Va) -> Result<(), Error> {
        self.inner.unmap(va)
    }

    /// Reads `len` bytes starting at `va`.
    pub fn read(&self, va: Va, len: usize) -> Result<Vec<u8>, Error> {
        self.inner.read(va, len)
    }

    /// Writes `content` starting at `va`.
    ///
    /// Each protected page raises a write fault. The write fails with
    /// [`Error::AccessViolation`] if no handler releases the page.
    pub fn write(&self, va: Va, content: &[u8]) -> Result<(), Error> {
        self.inner.write(va, content)
    }

    /// XORs the byte at `va` with `value`.
    pub fn xor(&self, va: Va, value: u8) -> Result<(), Error> {
        self.inner.xor(va, value)
    }

    /// Returns the number of write faults delivered so far.
    pub fn faults(&self) -> usize {
        self.inner.faults()
    }

    /// Makes every later attempt to write-protect the page containing `va`
    /// fail.
    pub fn inject_protection_failure(&self, va: Va) {
        self.inner.inject_protection_failure(va)
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl TrackerProtection for SimDriver {
    fn set_memory_access(
        &self,
        va: Va,
        pages: u64,
        access: MemoryAccess,
    ) -> Result<(), TrackerError> {
        Ok(self.inner.set_memory_access(va, pages, access)?)
    }
}

impl TrackerDriver for SimDriver {
    fn info(&self) -> Result<TrackerInfo, TrackerError> {
        Ok(self.inner.info()?)
    }

    fn mappings(&self, va: Va, len: u64) -> Result<Vec<Mapping>, TrackerError> {
        Ok(self.inner.mappings(va, len)?)
    }

    fn reset_baseline(&self) -> Result<bool, TrackerError> {
        Ok(self.inner.reset_baseline()?)
    }

    fn written_pages(&self, base: Va, pages: u64) -> Result<Option<Vec<u64>>, TrackerError> {
        Ok(self.inner.written_pages(base, pages)?)
    }

    fn attach(&self, handler: Arc<dyn WriteFaultHandler>) -> Result<(), TrackerError> {
        Ok(self.inner.attach(handler)?)
    }

    fn detach(&self) -> Result<(), TrackerError> {
        Ok(self.inner.detach()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    #[test]
    fn mappings_split_by_protection() -> Result<(), TrackerError> {
        let driver = SimDriver::default();
        let base = driver.map(4 * PAGE, MemoryAccess::RW)?;

        driver.set_memory_access(base + PAGE, 2, MemoryAccess::R)?;

        let mappings = driver.mappings(base, 4 * PAGE)?;
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[1].base, base + PAGE);
        assert_eq!(mappings[1].end, base + 3 * PAGE);
        assert_eq!(mappings[1].access, MemoryAccess::R);

        // Runs are reported whole, even when only partially queried.
        let mappings = driver.mappings(base + 2 * PAGE, 1)?;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].base, base + PAGE);
        Ok(())
    }

    #[test]
    fn mappings_are_separated() -> Result<(), TrackerError> {
        let driver = SimDriver::default();
        let first = driver.map(PAGE, MemoryAccess::RW)?;
        let second = driver.map(PAGE, MemoryAccess::RW)?;

        assert!(second > first + PAGE);
        assert!(driver.mappings(first + PAGE, PAGE)?.is_empty());
        Ok(())
    }

    #[test]
    fn protected_write_without_handler_fails() -> Result<(), TrackerError> {
        let driver = SimDriver::default();
        let base = driver.map(PAGE, MemoryAccess::RW)?;

        driver.set_memory_access(base, 1, MemoryAccess::R)?;
        assert!(matches!(
            driver.write(base, b"x"),
            Err(Error::AccessViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn writes_cross_pages() -> Result<(), TrackerError> {
        let driver = SimDriver::default();
        let base = driver.map(2 * PAGE, MemoryAccess::RW)?;

        driver.write(base + PAGE - 2, b"abcd")?;
        assert_eq!(driver.read(base + PAGE - 2, 4)?, b"abcd");

        driver.xor(base + PAGE, 0xff)?;
        assert_eq!(driver.read(base + PAGE, 1)?, [b'c' ^ 0xff]);
        Ok(())
    }

    #[test]
    fn baseline_tracks_writes() -> Result<(), TrackerError> {
        let driver = SimDriver::default();
        let base = driver.map(4 * PAGE, MemoryAccess::RW)?;

        driver.write(base + 2 * PAGE, b"x")?;
        assert_eq!(driver.written_pages(base, 4)?, Some(vec![2]));

        assert!(driver.reset_baseline()?);
        assert_eq!(driver.written_pages(base, 4)?, Some(vec![]));
        Ok(())
    }
}
