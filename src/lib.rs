//! Page-granular write tracking.
//!
//! `mwritten` records which pages of an address space have been written
//! since tracking began, or since they were last cleared, and reports them
//! through a bounded query that can read and clear the record in one step.
//!
//! The engine lives in [`Tracker`]; the address space it watches is reached
//! through a driver:
//!
//! - [`driver::sim`] (feature `driver-sim`): a simulated, deterministic
//!   address space.
//! - [`driver::unix`] (feature `driver-unix`, Linux only): the current
//!   process, write-protected with `mprotect` and observed through `SIGSEGV`.
//!
//! With the `ffi` feature, a C entry point `mwritten()` is exported that
//! queries a process-global tracker on the Linux driver.
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "driver-sim")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use mwritten::{MemoryAccess, Tracker, driver::sim::SimDriver};
//!
//! let tracker = Tracker::new(SimDriver::default())?;
//! let base = tracker.driver().map(8 * 4096, MemoryAccess::RW)?;
//!
//! // The first query monitors the range.
//! assert!(tracker.written(base, 8 * 4096, 8)?.is_empty());
//!
//! tracker.driver().write(base + 3 * 4096 + 12, b"hello")?;
//!
//! let result = tracker.take_written(base, 8 * 4096, 8)?;
//! assert_eq!(result.addresses, [base + 3 * 4096]);
//! assert!(tracker.written(base, 8 * 4096, 8)?.is_empty());
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "driver-sim"))]
//! # fn main() {}
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use mwritten_core::*;

/// Tracker drivers.
pub mod driver {
    pub use mwritten_core::driver::*;
    #[cfg(feature = "driver-sim")]
    #[cfg_attr(docsrs, doc(cfg(feature = "driver-sim")))]
    pub use mwritten_driver_sim as sim;
    #[cfg(all(feature = "driver-unix", target_os = "linux"))]
    #[cfg_attr(docsrs, doc(cfg(feature = "driver-unix")))]
    pub use mwritten_driver_unix as unix;
}

#[cfg(all(feature = "ffi", target_os = "linux", target_pointer_width = "64"))]
pub mod ffi;
