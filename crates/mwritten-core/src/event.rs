use crate::{MemoryAccess, Va};

/// A write attempt that hit a write-protected page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFault {
    /// The faulting address.
    pub va: Va,

    /// The protection the page carried when the fault was raised,
    /// if the driver knows it.
    pub access: Option<MemoryAccess>,
}

impl WriteFault {
    /// Creates a new write fault at the given address.
    pub fn new(va: Va) -> Self {
        Self { va, access: None }
    }
}

/// What the handler did with a [`WriteFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The page was recorded and made writable; the faulting access
    /// can be retried.
    Handled,

    /// The fault does not belong to a monitored page, or the page could not
    /// be made writable. The driver should fall back to whatever handled
    /// such faults before the tracker was attached.
    NotMonitored,
}
