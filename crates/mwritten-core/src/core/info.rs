use serde::{Deserialize, Serialize};

/// Represents information about the tracked address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerInfo {
    /// The size of a page in bytes.
    ///
    /// This is the tracking granularity reported by every query.
    pub page_size: u64,

    /// The shift value to convert a page number to a page address.
    pub page_shift: u64,
}

impl TrackerInfo {
    /// Creates the information for the given page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    pub fn new(page_size: u64) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");

        Self {
            page_size,
            page_shift: u64::from(page_size.trailing_zeros()),
        }
    }
}
