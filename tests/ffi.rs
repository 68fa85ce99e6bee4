//! The C entry point, called the way C code calls it.

#![cfg(all(feature = "ffi", target_os = "linux", target_pointer_width = "64"))]

use std::ptr;

use memmap2::MmapMut;
use mwritten::ffi::{MWRITTEN_CLEAR, mwritten, mwritten_init};

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn heap(pages: usize) -> MmapMut {
    assert_eq!(mwritten_init(), 0);
    MmapMut::map_anon(pages * page_size()).expect("failed to map memory")
}

#[test]
fn zero_length_is_einval() {
    let mut map = heap(1);
    let mut buf = [0usize; 3];
    let mut naddr = 3;
    let mut gran = 0;

    let res = unsafe {
        mwritten(
            map.as_mut_ptr().cast(),
            0,
            0,
            buf.as_mut_ptr(),
            &mut naddr,
            &mut gran,
        )
    };
    assert_eq!(res, libc::EINVAL);
}

#[test]
fn unknown_flags_are_einval() {
    let mut map = heap(1);
    let mut gran = 0;

    let res = unsafe {
        mwritten(
            map.as_mut_ptr().cast(),
            page_size(),
            0x80,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut gran,
        )
    };
    assert_eq!(res, libc::EINVAL);
}

#[test]
fn bad_buffer_start_is_efault() {
    let mut map = heap(3);
    let mut naddr = 3;
    let mut gran = 0;

    let res = unsafe {
        mwritten(
            map.as_mut_ptr().cast(),
            page_size(),
            0,
            3 as *mut usize,
            &mut naddr,
            &mut gran,
        )
    };
    assert_eq!(res, libc::EFAULT);
}

#[test]
fn bad_granularity_is_efault() {
    let mut map = heap(3);
    let mut buf = [0usize; 3];
    let mut naddr = 3;

    let res = unsafe {
        mwritten(
            map.as_mut_ptr().cast(),
            page_size(),
            0,
            buf.as_mut_ptr(),
            &mut naddr,
            ptr::null_mut(),
        )
    };
    assert_eq!(res, libc::EFAULT);
}

#[test]
fn zero_naddr_is_efault() {
    let mut map = heap(3);
    let mut buf = [0usize; 3];
    let mut naddr = 0;
    let mut gran = 0;

    let res = unsafe {
        mwritten(
            map.as_mut_ptr().cast(),
            page_size(),
            0,
            buf.as_mut_ptr(),
            &mut naddr,
            &mut gran,
        )
    };
    assert_eq!(res, libc::EFAULT);
}

#[test]
fn clear_then_detect() {
    let mut map = heap(32);
    let page = page_size();
    let addr = map.as_mut_ptr();
    let mut gran = 0;

    let res = unsafe {
        mwritten(
            addr.cast(),
            32 * page,
            MWRITTEN_CLEAR,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut gran,
        )
    };
    assert_eq!(res, 0);
    assert_eq!(gran, page);

    unsafe { ptr::write_volatile(addr.add(16 * page + 17), b'b') };

    let mut buf = [0usize; 3];
    let mut naddr = 3;
    let res = unsafe {
        mwritten(
            addr.cast(),
            32 * page,
            MWRITTEN_CLEAR,
            buf.as_mut_ptr(),
            &mut naddr,
            &mut gran,
        )
    };
    assert_eq!(res, 0);
    assert_eq!(naddr, 1);
    assert_eq!(buf[0], addr as usize + 16 * page);
}
