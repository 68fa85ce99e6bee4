//! Write tracking driver for the current process on Linux.
//!
//! Pages are write-protected with `mprotect`, and the resulting `SIGSEGV`
//! is turned into a [`WriteFault`] for the attached handler. Faults that do
//! not belong to a monitored page are forwarded to the `SIGSEGV` action
//! that was installed before the driver was attached.
//!
//! The mapping table is read from `/proc/self/maps`. If the kernel supports
//! soft-dirty bits, writes that happen before a region is first queried are
//! recovered from `/proc/self/pagemap`.
//!
//! Only one driver can be attached per process at a time.
//!
//! [`WriteFault`]: mwritten_core::WriteFault

#![cfg(target_os = "linux")]

mod driver;
mod error;
mod maps;
mod pagemap;
mod signal;

use std::sync::Arc;

use mwritten_core::{
    Mapping, MemoryAccess, TrackerDriver, TrackerError, TrackerInfo, TrackerProtection, Va,
    WriteFaultHandler,
};

pub use self::error::Error;
use self::driver::ProcessDriver;

/// Options of the [`UnixDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixDriverOptions {
    /// Use soft-dirty bits as the write baseline.
    pub soft_dirty: bool,

    /// Forward unrelated `SIGSEGV`s to the previously installed action.
    ///
    /// When disabled, or when there is no previous action, an unrelated
    /// fault terminates the process.
    pub chain_previous_handler: bool,
}

impl Default for UnixDriverOptions {
    fn default() -> Self {
        Self {
            soft_dirty: true,
            chain_previous_handler: true,
        }
    }
}

/// Write tracking driver for the current process.
pub struct UnixDriver {
    inner: ProcessDriver,
}

impl UnixDriver {
    /// Creates a new driver with default options.
    pub fn new() -> Result<Self, TrackerError> {
        Self::with_options(UnixDriverOptions::default())
    }

    /// Creates a new driver with the given options.
    pub fn with_options(options: UnixDriverOptions) -> Result<Self, TrackerError> {
        Ok(Self {
            inner: ProcessDriver::new(options)?,
        })
    }
}

impl TrackerProtection for UnixDriver {
    fn set_memory_access(
        &self,
        va: Va,
        pages: u64,
        access: MemoryAccess,
    ) -> Result<(), TrackerError> {
        Ok(self.inner.set_memory_access(va, pages, access)?)
    }
}

impl TrackerDriver for UnixDriver {
    const SHARES_ADDRESS_SPACE: bool = true;

    fn info(&self) -> Result<TrackerInfo, TrackerError> {
        Ok(self.inner.info()?)
    }

    fn mappings(&self, va: Va, len: u64) -> Result<Vec<Mapping>, TrackerError> {
        Ok(self.inner.mappings(va, len)?)
    }

    fn reserved_ranges(&self) -> Vec<(Va, Va)> {
        self.inner.reserved_ranges()
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
