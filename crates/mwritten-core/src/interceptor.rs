//! Write fault interception.
//!
//! Every monitored page starts out write-protected. The first write to it
//! raises a fault that the driver hands to the [`Interceptor`], which:
//! - Finds the region the page belongs to
//! - Marks the page dirty in the region's index
//! - Gives the page its original protection back
//!
//! The faulting write is then retried by the driver and proceeds without
//! trapping again until the page is cleared and re-armed.
//!
//! Nothing on this path locks, allocates, or logs, because on a real process
//! it runs inside a signal handler that may have interrupted the allocator
//! or the tracker itself.

use crate::{
    FaultDisposition, RegionTable, TrackerProtection, WriteFault, WriteFaultHandler,
};

/// Fault handler recording first writes into the region table.
#[derive(Default)]
pub struct Interceptor {
    regions: RegionTable,
}

impl Interceptor {
    /// Creates a new `Interceptor` with an empty region table.
    pub fn new() -> Self {
        Self {
            regions: RegionTable::new(),
        }
    }

    /// Returns the region table.
    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }
}

impl WriteFaultHandler for Interceptor {
    fn handle_write_fault(
        &self,
        protection: &dyn TrackerProtection,
        fault: &WriteFault,
    ) -> FaultDisposition {
        let _pin = self.regions.pin();
        let Some(region) = self.regions.lookup(fault.va) else {
            return FaultDisposition::NotMonitored;
        };

        let page = region.page_of(fault.va);
        let index = region.index();

        index.begin_fault(page);
        let result = protection.set_memory_access(region.va_of(page), 1, region.access());
        if result.is_err() {
            index.degrade(page);
        }
        index.end_fault(page);

        match result {
            Ok(()) => FaultDisposition::Handled,
            Err(_) => FaultDisposition::NotMonitored,
        }
    }
}
