use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{MemoryAccess, TrackerError, TrackerInfo, Va, WriteFaultHandler};

/// A contiguous piece of the address space with uniform protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// First address of the mapping.
    pub base: Va,

    /// One past the last address of the mapping.
    pub end: Va,

    /// Current protection of the mapping.
    pub access: MemoryAccess,

    /// Identity of the object backing the mapping.
    ///
    /// Pieces of one mapping that differ only in protection share the same
    /// identity. A mapping created over the same addresses after an unmap
    /// gets a different one wherever the driver can tell them apart.
    pub identity: u64,
}

impl Mapping {
    /// Returns the size of the mapping in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.base
    }

    /// Checks if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.end <= self.base
    }

    /// Checks if the mapping contains the given address.
    pub fn contains(&self, va: Va) -> bool {
        self.base <= va && va < self.end
    }
}

/// Page protection service of a driver.
///
/// This is the only part of a driver that is reachable from the write fault
/// path, so implementations must be callable from a signal handler.
pub trait TrackerProtection {
    /// Sets the access permissions of `pages` pages starting at `va`.
    ///
    /// `va` is always page-aligned.
    fn set_memory_access(&self, va: Va, pages: u64, access: MemoryAccess)
    -> Result<(), TrackerError>;
}

/// A trait for implementing a tracker driver.
pub trait TrackerDriver: TrackerProtection {
    /// Whether the tracker's own data lives in the tracked address space.
    ///
    /// When set, ranges that overlap the tracker's bookkeeping are never
    /// monitored.
    const SHARES_ADDRESS_SPACE: bool = false;

    /// Retrieves information about the address space.
    fn info(&self) -> Result<TrackerInfo, TrackerError>;

    /// Returns every mapping intersecting `[va, va + len)`, ascending.
    ///
    /// Gaps are not errors; the caller decides what a gap means.
    fn mappings(&self, va: Va, len: u64) -> Result<Vec<Mapping>, TrackerError>;

    /// Ranges owned by the driver that must never be monitored.
    fn reserved_ranges(&self) -> Vec<(Va, Va)> {
        Vec::new()
    }

    /// Resets the driver's write baseline.
    ///
    /// Returns `false` if the driver keeps no baseline.
    fn reset_baseline(&self) -> Result<bool, TrackerError> {
        Ok(false)
    }

    /// Returns the page offsets, relative to `base`, of pages written since
    /// the last [`reset_baseline`].
    ///
    /// Returns `None` if the driver keeps no baseline.
    ///
    /// [`reset_baseline`]: Self::reset_baseline
    fn written_pages(&self, base: Va, pages: u64) -> Result<Option<Vec<u64>>, TrackerError> {
        let _ = (base, pages);
        Ok(None)
    }

    /// Starts delivering write faults to `handler`.
    fn attach(&self, handler: Arc<dyn WriteFaultHandler>) -> Result<(), TrackerError>;

    /// Stops delivering write faults.
    fn detach(&self) -> Result<(), TrackerError>;
}
