use crate::{FaultDisposition, TrackerProtection, WriteFault};

/// A trait for handling write faults delivered by a driver.
///
/// The handler is invoked from the context that raised the fault, which on
/// a real process is a signal handler. Implementations must not block, must
/// not take locks the interrupted code could hold, and must not allocate.
pub trait WriteFaultHandler: Send + Sync {
    /// Handles a write fault.
    ///
    /// `protection` is the driver's own protection service, passed in so the
    /// handler can make the faulting page writable again.
    fn handle_write_fault(
        &self,
        protection: &dyn TrackerProtection,
        fault: &WriteFault,
    ) -> FaultDisposition;
}
