//! C entry point.
//!
//! ```c
//! #define MWRITTEN_CLEAR 1
//!
//! int mwritten(void *addr, size_t len, int flags,
//!              uintptr_t *buf, size_t *naddr, size_t *gran);
//! ```
//!
//! Returns `0`, `EINVAL` or `EFAULT`. Output pointers are checked against
//! the mapping table before anything is written through them, so a bogus
//! pointer is reported as `EFAULT` instead of crashing the caller.
//!
//! The tracker behind the entry point is created when the library is
//! loaded. Writes made before that are not reported.

use std::{
    ffi::{c_int, c_void},
    mem,
    slice,
};

use mwritten_core::{QueryFlags, ResultCode, Tracker, TrackerError, Va};
use mwritten_driver_unix::UnixDriver;
use once_cell::sync::OnceCell;

/// Clear the reported range after the query.
pub const MWRITTEN_CLEAR: c_int = 1;

/// Region slots of the process-global tracker.
///
/// Slots are not reused, and every mapping a caller queries after it was
/// unmapped and mapped again takes a new one.
const REGION_CAPACITY: usize = 4096;

static TRACKER: OnceCell<Tracker<UnixDriver>> = OnceCell::new();

#[used]
#[unsafe(link_section = ".init_array")]
static INIT: extern "C" fn() = init;

extern "C" fn init() {
    if let Err(err) = tracker() {
        tracing::error!(%err, "failed to attach process tracker");
    }
}

fn tracker() -> Result<&'static Tracker<UnixDriver>, TrackerError> {
    TRACKER.get_or_try_init(|| {
        let driver = UnixDriver::new()?;
        Ok::<_, TrackerError>(Tracker::new(driver)?.with_region_capacity(REGION_CAPACITY))
    })
}

/// Attaches the process-global tracker.
///
/// Called automatically when the library is loaded; calling it again is a
/// no-op. Returns `0` on success.
#[unsafe(no_mangle)]
pub extern "C" fn mwritten_init() -> c_int {
    match tracker() {
        Ok(_) => 0,
        Err(err) => err.result_code().errno(),
    }
}

//
// Checks that `count` values of `T` can be written at `ptr`.
//
fn is_writable<T>(tracker: &Tracker<UnixDriver>, ptr: *mut T, count: usize) -> bool {
    if ptr.is_null() || !ptr.is_aligned() {
        return false;
    }

    match count.checked_mul(mem::size_of::<T>()) {
        Some(len) => tracker.check_writable(Va::from(ptr), len as u64),
        None => false,
    }
}

/// Reports, and optionally clears, the pages written in
/// `[addr, addr + len)`.
///
/// # Safety
///
/// `buf`, `naddr` and `gran` must be null or point to memory owned by the
/// caller that no other thread accesses during the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mwritten(
    addr: *mut c_void,
    len: usize,
    flags: c_int,
    buf: *mut usize,
    naddr: *mut usize,
    gran: *mut usize,
) -> c_int {
    if len == 0 || flags & !MWRITTEN_CLEAR != 0 {
        return ResultCode::InvalidArgument.errno();
    }

    let tracker = match tracker() {
        Ok(tracker) => tracker,
        Err(err) => return err.result_code().errno(),
    };

    let va = Va::from(addr);
    if !tracker.check_writable(va, len as u64) {
        return ResultCode::InvalidRange.errno();
    }

    if !is_writable(tracker, gran, 1) {
        return ResultCode::FaultyBuffer.errno();
    }

    let clear = flags & MWRITTEN_CLEAR != 0;
    if !clear && (buf.is_null() || naddr.is_null()) {
        return ResultCode::InvalidArgument.errno();
    }

    let count = if naddr.is_null() {
        None
    } else {
        if !is_writable(tracker, naddr, 1) {
            return ResultCode::FaultyBuffer.errno();
        }

        Some(unsafe { &mut *naddr })
    };

    let addresses = if buf.is_null() {
        None
    } else {
        let Some(capacity) = count.as_deref().copied() else {
            return ResultCode::InvalidArgument.errno();
        };

        if capacity == 0 || !is_writable(tracker, buf, capacity) {
            return ResultCode::FaultyBuffer.errno();
        }

        Some(unsafe { slice::from_raw_parts_mut(buf.cast::<Va>(), capacity) })
    };

    let granularity = unsafe { &mut *gran.cast::<u64>() };
    let flags = if clear {
        QueryFlags::CLEAR
    } else {
        QueryFlags::empty()
    };

    ResultCode::from(tracker.query(
        va,
        len as u64,
        flags,
        addresses,
        count,
        Some(granularity),
    ))
    .errno()
}
