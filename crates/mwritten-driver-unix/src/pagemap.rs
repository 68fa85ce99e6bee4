//! Soft-dirty write baseline.
//!
//! Writing `4` to `/proc/self/clear_refs` clears the soft-dirty bit of every
//! page of the process; the kernel sets it again on the next write. The bit
//! is read back from `/proc/self/pagemap`, one 64-bit entry per page.

use std::{fs::File, os::unix::fs::FileExt as _};

use mwritten_core::Va;
use zerocopy::FromBytes as _;

use crate::Error;

const SOFT_DIRTY: u64 = 1 << 55;
const SWAPPED: u64 = 1 << 62;
const PRESENT: u64 = 1 << 63;

/// Entries read per system call.
const BATCH: usize = 512;

/// Clears the soft-dirty bit of every page.
pub fn reset() -> Result<(), Error> {
    std::fs::write("/proc/self/clear_refs", b"4")?;
    Ok(())
}

/// Checks if a pagemap entry describes a page written since the last reset.
///
/// Mappings created after the reset report every page soft-dirty, so pages
/// that were never populated are not counted.
pub fn is_written(entry: u64) -> bool {
    entry & SOFT_DIRTY != 0 && entry & (PRESENT | SWAPPED) != 0
}

/// Returns the offsets of the pages in `[base, base + pages)` written since
/// the last [`reset`].
pub fn written_pages(base: Va, pages: u64, page_shift: u64) -> Result<Vec<u64>, Error> {
    let file = File::open("/proc/self/pagemap")?;
    let mut chunk = [0u8; BATCH * 8];
    let mut result = Vec::new();
    let mut page = 0;

    while page < pages {
        let count = (pages - page).min(BATCH as u64);
        let offset = ((base.0 >> page_shift) + page) * 8;
        let buffer = &mut chunk[..count as usize * 8];

        file.read_exact_at(buffer, offset)?;

        for (index, entry) in (page..).zip(buffer.chunks_exact(8)) {
            let entry = u64::read_from_bytes(entry).map_err(|_| Error::MalformedMapping)?;
            if is_written(entry) {
                result.push(index);
            }
        }

        page += count;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_entries() {
        assert!(is_written(PRESENT | SOFT_DIRTY | 0x1234));
        assert!(is_written(SWAPPED | SOFT_DIRTY));
        assert!(!is_written(SOFT_DIRTY));
        assert!(!is_written(PRESENT));
    }
}
