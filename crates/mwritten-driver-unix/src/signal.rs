//! `SIGSEGV` plumbing.
//!
//! Everything reachable from [`handle_sigsegv`] is async-signal-safe: no
//! locks, no allocation, no logging. The state shared with the handler lives
//! on a page of its own, which the driver reports as reserved so that it is
//! never write-protected.

use std::{
    cell::UnsafeCell,
    ffi::{c_int, c_void},
    io,
    mem::{self, MaybeUninit},
    ptr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering, compiler_fence},
    },
};

use mwritten_core::{
    FaultDisposition, MemoryAccess, TrackerError, TrackerProtection, Va, WriteFault,
    WriteFaultHandler,
};

use crate::Error;

/// `si_code` of a fault on a mapped page without the required permission.
const SEGV_ACCERR: c_int = 2;

#[repr(C, align(4096))]
struct SignalState {
    handler: AtomicPtr<Arc<dyn WriteFaultHandler>>,
    active: AtomicUsize,
    chain: AtomicBool,
    page_shift: AtomicU64,
    previous: UnsafeCell<MaybeUninit<libc::sigaction>>,
}

// `previous` is written only by `install`, before the handler is installed.
unsafe impl Sync for SignalState {}

static STATE: SignalState = SignalState {
    handler: AtomicPtr::new(ptr::null_mut()),
    active: AtomicUsize::new(0),
    chain: AtomicBool::new(true),
    page_shift: AtomicU64::new(12),
    previous: UnsafeCell::new(MaybeUninit::uninit()),
};

/// Changes the protection of `len` bytes at `va`.
pub fn protect(va: Va, len: u64, access: MemoryAccess) -> io::Result<()> {
    let mut prot = libc::PROT_NONE;
    if access.contains(MemoryAccess::R) {
        prot |= libc::PROT_READ;
    }
    if access.contains(MemoryAccess::W) {
        prot |= libc::PROT_WRITE;
    }
    if access.contains(MemoryAccess::X) {
        prot |= libc::PROT_EXEC;
    }

    let result = unsafe { libc::mprotect(va.0 as *mut c_void, len as usize, prot) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Page protection usable from the signal handler.
///
/// `io::Error::last_os_error` does not allocate.
struct Mprotect {
    page_shift: u64,
}

impl TrackerProtection for Mprotect {
    fn set_memory_access(
        &self,
        va: Va,
        pages: u64,
        access: MemoryAccess,
    ) -> Result<(), TrackerError> {
        protect(va, pages << self.page_shift, access).map_err(TrackerError::Io)
    }
}

/// Returns the pages holding the state shared with the signal handler.
pub fn reserved(page_size: u64) -> (Va, Va) {
    let start = Va::from(&STATE as *const SignalState);
    let end = start + mem::size_of::<SignalState>() as u64;

    (
        start.align_down(page_size),
        (end - 1).align_down(page_size) + page_size,
    )
}

/// Installs the `SIGSEGV` handler, forwarding write faults to `handler`.
pub fn install(
    handler: Arc<dyn WriteFaultHandler>,
    page_shift: u64,
    chain: bool,
) -> Result<(), Error> {
    let handler = Box::into_raw(Box::new(handler));

    if STATE
        .handler
        .compare_exchange(ptr::null_mut(), handler, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        drop(unsafe { Box::from_raw(handler) });
        return Err(Error::AlreadyAttached);
    }

    STATE.page_shift.store(page_shift, Ordering::SeqCst);
    STATE.chain.store(chain, Ordering::SeqCst);

    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handle_sigsegv as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;

    let result = unsafe {
        libc::sigemptyset(&mut action.sa_mask);

        let previous = (*STATE.previous.get()).as_mut_ptr();
        match libc::sigaction(libc::SIGSEGV, ptr::null(), previous) {
            0 => {
                compiler_fence(Ordering::SeqCst);
                libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut())
            }
            result => result,
        }
    };

    if result != 0 {
        let err = io::Error::last_os_error();
        let handler = STATE.handler.swap(ptr::null_mut(), Ordering::SeqCst);
        drop(unsafe { Box::from_raw(handler) });
        return Err(err.into());
    }

    tracing::debug!(chain, "SIGSEGV handler installed");
    Ok(())
}

/// Restores the previous `SIGSEGV` action and releases the handler.
///
/// Waits for handler invocations still running on other threads.
pub fn uninstall() -> Result<(), Error> {
    if STATE.handler.load(Ordering::SeqCst).is_null() {
        return Ok(());
    }

    let result = unsafe {
        let previous = (*STATE.previous.get()).as_ptr();
        libc::sigaction(libc::SIGSEGV, previous, ptr::null_mut())
    };

    if result != 0 {
        return Err(io::Error::last_os_error().into());
    }

    let handler = STATE.handler.swap(ptr::null_mut(), Ordering::SeqCst);
    while STATE.active.load(Ordering::SeqCst) != 0 {
        std::hint::spin_loop();
    }

    if !handler.is_null() {
        drop(unsafe { Box::from_raw(handler) });
    }

    tracing::debug!("SIGSEGV handler removed");
    Ok(())
}

unsafe extern "C" fn handle_sigsegv(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let errno = unsafe { *libc::__errno_location() };

    STATE.active.fetch_add(1, Ordering::SeqCst);
    let handled = unsafe { dispatch(info) };
    STATE.active.fetch_sub(1, Ordering::SeqCst);

    unsafe { *libc::__errno_location() = errno };

    if !handled {
        unsafe { chain(signal, info, context) };
    }
}

//
// Only protection faults can be tracker faults; a fault on an unmapped
// address never is.
//
unsafe fn dispatch(info: *mut libc::siginfo_t) -> bool {
    if info.is_null() || unsafe { (*info).si_code } != SEGV_ACCERR {
        return false;
    }

    let handler = STATE.handler.load(Ordering::SeqCst);
    if handler.is_null() {
        return false;
    }

    let handler = unsafe { &*handler };
    let va = Va::from(unsafe { (*info).si_addr() });
    let protection = Mprotect {
        page_shift: STATE.page_shift.load(Ordering::Relaxed),
    };

    handler.handle_write_fault(&protection, &WriteFault::new(va)) == FaultDisposition::Handled
}

//
// Hands a fault that is not ours to the action installed before us. With
// nothing to forward to, the default action is restored and the faulting
// instruction re-executed, which terminates the process.
//
unsafe fn chain(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let previous = unsafe { (*STATE.previous.get()).assume_init_ref() };
    let action = previous.sa_sigaction;

    if !STATE.chain.load(Ordering::Relaxed) || action == libc::SIG_DFL || action == libc::SIG_IGN {
        unsafe { libc::signal(signal, libc::SIG_DFL) };
        return;
    }

    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let action: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
            unsafe { mem::transmute(action) };
        action(signal, info, context);
    } else {
        let action: extern "C" fn(c_int) = unsafe { mem::transmute(action) };
        action(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_has_its_own_page() {
        let (start, end) = reserved(4096);
        let state = Va::from(&STATE as *const SignalState);

        assert_eq!(start, state);
        assert_eq!(end, state + 4096);
    }
}
