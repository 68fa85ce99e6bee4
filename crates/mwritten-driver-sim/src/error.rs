use mwritten_core::{TrackerError, Va};

/// Error type for the simulated driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The address is not mapped.
    #[error("address {0} is not mapped")]
    Unmapped(Va),

    /// A write hit a protected page and no handler released it.
    #[error("access violation at {0}")]
    AccessViolation(Va),

    /// The protection of a page could not be changed.
    #[error("cannot change protection of {0}")]
    ProtectionFailure(Va),

    /// A fixed mapping would overlap an existing one.
    #[error("mapping at {0} overlaps an existing mapping")]
    Overlap(Va),

    /// A fault handler is already attached.
    #[error("a fault handler is already attached")]
    AlreadyAttached,

    /// The length is zero or not representable.
    #[error("invalid length")]
    InvalidLength,
}

impl From<Error> for TrackerError {
    fn from(value: Error) -> Self {
        Self::Driver(Box::new(value))
    }
}
