//! Per-region record of dirty pages.
//!
//! Every page of a region owns one 32-bit word:
//!
//! ```text
//!  31            16 15          2   1          0
//! +----------------+-------------+----------+-------+
//! |     epoch      |  in-flight  | degraded | dirty |
//! +----------------+-------------+----------+-------+
//! ```
//!
//! The write fault handler bumps the epoch when it starts and when it
//! finishes with a page, and keeps the in-flight count raised while it is
//! between marking the page and making it writable. A clear only takes the
//! dirty bit with a compare-and-swap against a word it sampled *before*
//! re-arming the page, so any fault that overlaps the clear makes the swap
//! fail and the page stays dirty.
//!
//! The words live in an anonymous mapping of their own, never on the heap,
//! so monitoring the heap never write-protects the index.

use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::{TrackerError, Va};

pub(crate) const DIRTY: u32 = 1 << 0;
const DEGRADED: u32 = 1 << 1;
const INFLIGHT_ONE: u32 = 1 << 2;
const INFLIGHT_MASK: u32 = 0x3fff << 2;
const EPOCH_ONE: u32 = 1 << 16;

/// Pages re-armed with a single protection change.
const CHUNK: usize = 64;

/// Attempts to take a page whose word changed while it was being re-armed.
const RETRIES: usize = 4;

/// Outcome of [`DirtyIndex::clear`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClearSummary {
    /// Pages that went from dirty to clean.
    pub cleared: u64,

    /// Pages left dirty because a write raced with the clear.
    pub kept: u64,

    /// Pages that could not be re-armed and are now permanently dirty.
    pub degraded: u64,
}

/// Dirty page bitmap of a single monitored region.
pub struct DirtyIndex {
    map: MmapMut,
    pages: u64,
}

impl DirtyIndex {
    /// Creates an index for `pages` pages, all clean.
    pub fn new(pages: u64) -> Result<Self, TrackerError> {
        let len = usize::try_from(pages)
            .ok()
            .and_then(|pages| pages.checked_mul(size_of::<AtomicU32>()))
            .ok_or(TrackerError::Other("region too large"))?;

        Ok(Self {
            map: MmapMut::map_anon(len)?,
            pages,
        })
    }

    /// Returns the number of pages covered by the index.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Returns the `[start, end)` addresses of the index storage.
    pub fn storage(&self) -> (Va, Va) {
        let start = Va::from(self.map.as_ptr());
        (start, start + self.map.len() as u64)
    }

    fn words(&self) -> &[AtomicU32] {
        // SAFETY: The mapping is page-aligned, exactly `pages` words long,
        //         and only ever accessed through atomics.
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().cast::<AtomicU32>(),
                self.pages as usize,
            )
        }
    }

    fn word(&self, page: u64) -> &AtomicU32 {
        &self.words()[page as usize]
    }

    /// Marks a page dirty. Idempotent.
    pub fn insert(&self, page: u64) {
        self.word(page).fetch_or(DIRTY, Ordering::AcqRel);
    }

    /// Marks a page dirty and announces that a fault is about to make
    /// it writable.
    ///
    /// Must be paired with [`end_fault`].
    ///
    /// [`end_fault`]: Self::end_fault
    pub fn begin_fault(&self, page: u64) {
        let _ = self
            .word(page)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word | DIRTY).wrapping_add(INFLIGHT_ONE + EPOCH_ONE))
            });
    }

    /// Announces that the fault started by [`begin_fault`] is done.
    ///
    /// [`begin_fault`]: Self::begin_fault
    pub fn end_fault(&self, page: u64) {
        self.word(page)
            .fetch_add(EPOCH_ONE.wrapping_sub(INFLIGHT_ONE), Ordering::AcqRel);
    }

    /// Marks a page as permanently dirty.
    pub fn degrade(&self, page: u64) {
        self.word(page).fetch_or(DIRTY | DEGRADED, Ordering::AcqRel);
    }

    /// Merges the dirty and degraded pages of `other` into this index, with
    /// page 0 of `other` landing on page `offset`.
    pub fn absorb(&self, offset: u64, other: &DirtyIndex) {
        for (page, word) in (offset..).zip(other.words()) {
            let state = word.load(Ordering::Acquire) & (DIRTY | DEGRADED);
            if state != 0 {
                self.word(page).fetch_or(state, Ordering::AcqRel);
            }
        }
    }

    /// Returns the raw state word of a page.
    ///
    /// Every fault changes the word, so two equal snapshots of a clean page
    /// mean that no fault touched the page in between.
    pub fn snapshot(&self, page: u64) -> u32 {
        self.word(page).load(Ordering::Acquire)
    }

    /// Checks if a page is dirty.
    pub fn is_dirty(&self, page: u64) -> bool {
        self.word(page).load(Ordering::Acquire) & DIRTY != 0
    }

    /// Checks if a page is permanently dirty.
    pub fn is_degraded(&self, page: u64) -> bool {
        self.word(page).load(Ordering::Acquire) & DEGRADED != 0
    }

    /// Returns the dirty pages in `[first, last]`, ascending.
    pub fn iter_dirty(&self, first: u64, last: u64) -> impl Iterator<Item = u64> + '_ {
        let words = &self.words()[first as usize..=last as usize];

        words
            .iter()
            .zip(first..)
            .filter(|(word, _)| word.load(Ordering::Acquire) & DIRTY != 0)
            .map(|(_, page)| page)
    }

    /// Removes every dirty page in `[first, last]` and re-arms it.
    ///
    /// `arm(page, count)` write-protects `count` pages starting at `page`.
    /// `report(page)` is called, in ascending order, for every page that was
    /// dirty when the clear reached it, whether or not it could be taken.
    /// A page whose re-arming fails is degraded rather than reported as an
    /// error.
    pub fn clear(
        &self,
        first: u64,
        last: u64,
        mut arm: impl FnMut(u64, u64) -> Result<(), TrackerError>,
        mut report: impl FnMut(u64),
    ) -> ClearSummary {
        let mut summary = ClearSummary::default();
        let mut snapshot = [0u32; CHUNK];
        let mut run_start = first;
        let mut run_len = 0usize;

        for page in first..=last {
            let word = self.word(page).load(Ordering::Acquire);
            let candidate = word & DIRTY != 0 && word & DEGRADED == 0;

            if run_len > 0 && (!candidate || run_len == CHUNK) {
                self.take_run(run_start, &snapshot[..run_len], &mut arm, &mut summary);
                run_len = 0;
            }

            if word & DIRTY == 0 {
                continue;
            }

            report(page);

            if !candidate {
                continue;
            }

            if run_len == 0 {
                run_start = page;
            }

            snapshot[run_len] = word;
            run_len += 1;
        }

        if run_len > 0 {
            self.take_run(run_start, &snapshot[..run_len], &mut arm, &mut summary);
        }

        summary
    }

    fn take_run(
        &self,
        start: u64,
        snapshot: &[u32],
        arm: &mut impl FnMut(u64, u64) -> Result<(), TrackerError>,
        summary: &mut ClearSummary,
    ) {
        if arm(start, snapshot.len() as u64).is_err() {
            for page in start..start + snapshot.len() as u64 {
                self.degrade(page);
            }

            summary.degraded += snapshot.len() as u64;
            return;
        }

        for (page, &word) in (start..).zip(snapshot) {
            if word & INFLIGHT_MASK == 0
                && self
                    .word(page)
                    .compare_exchange(word, word & !DIRTY, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                summary.cleared += 1;
                continue;
            }

            match self.retake(page, arm) {
                Retake::Cleared => summary.cleared += 1,
                Retake::Kept => summary.kept += 1,
                Retake::Degraded => summary.degraded += 1,
            }
        }
    }

    //
    // A write raced with the clear. Sample the word again once the fault is
    // done, re-arm the page (the fault made it writable), and retry.
    //
    fn retake(
        &self,
        page: u64,
        arm: &mut impl FnMut(u64, u64) -> Result<(), TrackerError>,
    ) -> Retake {
        let word = self.word(page);

        for _ in 0..RETRIES {
            let current = word.load(Ordering::Acquire);

            if current & DIRTY == 0 {
                return Retake::Cleared;
            }

            if current & DEGRADED != 0 {
                return Retake::Degraded;
            }

            if current & INFLIGHT_MASK != 0 {
                std::hint::spin_loop();
                continue;
            }

            if arm(page, 1).is_err() {
                self.degrade(page);
                return Retake::Degraded;
            }

            if word
                .compare_exchange(
                    current,
                    current & !DIRTY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Retake::Cleared;
            }
        }

        Retake::Kept
    }
}

enum Retake {
    Cleared,
    Kept,
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() -> Result<(), TrackerError> {
        let index = DirtyIndex::new(16)?;

        index.insert(3);
        index.insert(3);
        index.insert(7);

        assert_eq!(index.iter_dirty(0, 15).collect::<Vec<_>>(), [3, 7]);
        assert_eq!(index.iter_dirty(4, 15).collect::<Vec<_>>(), [7]);
        assert_eq!(index.iter_dirty(0, 2).count(), 0);
        Ok(())
    }

    #[test]
    fn absorb_keeps_both_sides() -> Result<(), TrackerError> {
        let index = DirtyIndex::new(8)?;
        let other = DirtyIndex::new(3)?;

        index.insert(0);
        other.insert(1);
        other.degrade(2);

        index.absorb(4, &other);

        assert_eq!(index.iter_dirty(0, 7).collect::<Vec<_>>(), [0, 5, 6]);
        assert!(index.is_degraded(6));
        assert!(!index.is_degraded(5));
        Ok(())
    }

    #[test]
    fn clear_arms_runs() -> Result<(), TrackerError> {
        let index = DirtyIndex::new(200)?;
        for page in [1, 2, 3, 10, 11] {
            index.insert(page);
        }
        for page in 100..170 {
            index.insert(page);
        }

        let mut armed = Vec::new();
        let mut reported = Vec::new();
        let summary = index.clear(
            0,
            199,
            |page, count| {
                armed.push((page, count));
                Ok(())
            },
            |page| reported.push(page),
        );

        assert_eq!(armed, [(1, 3), (10, 2), (100, 64), (164, 6)]);
        assert_eq!(reported.len(), 75);
        assert_eq!(summary.cleared, 75);
        assert_eq!(index.iter_dirty(0, 199).count(), 0);
        Ok(())
    }

    #[test]
    fn clear_is_range_scoped() -> Result<(), TrackerError> {
        let index = DirtyIndex::new(8)?;
        index.insert(1);
        index.insert(6);

        index.clear(0, 3, |_, _| Ok(()), |_| {});

        assert_eq!(index.iter_dirty(0, 7).collect::<Vec<_>>(), [6]);
        Ok(())
    }

    #[test]
    fn failed_arm_degrades() -> Result<(), TrackerError> {
        let index = DirtyIndex::new(8)?;
        index.insert(2);

        let summary = index.clear(0, 7, |_, _| Err(TrackerError::NotSupported), |_| {});
        assert_eq!(summary.degraded, 1);
        assert!(index.is_degraded(2));

        // Degraded pages are reported but never armed again.
        let mut reported = Vec::new();
        let summary = index.clear(
            0,
            7,
            |_, _| panic!("degraded page re-armed"),
            |page| reported.push(page),
        );
        assert_eq!(reported, [2]);
        assert_eq!(summary, ClearSummary::default());
        assert!(index.is_dirty(2));
        Ok(())
    }

    #[test]
    fn fault_during_arm_is_retaken() -> Result<(), TrackerError> {
        let index = DirtyIndex::new(4)?;
        index.insert(1);

        let mut calls = 0;
        let summary = index.clear(
            0,
            3,
            |page, _| {
                calls += 1;
                if calls == 1 {
                    // A write lands between the sample and the swap.
                    index.begin_fault(page);
                    index.end_fault(page);
                }
                Ok(())
            },
            |_| {},
        );

        assert_eq!(calls, 2);
        assert_eq!(summary.cleared, 1);
        assert!(!index.is_dirty(1));
        Ok(())
    }

    #[test]
    fn fault_in_flight_keeps_page_dirty() -> Result<(), TrackerError> {
        let index = DirtyIndex::new(4)?;
        index.begin_fault(2);

        let summary = index.clear(0, 3, |_, _| Ok(()), |_| {});
        assert_eq!(summary.kept, 1);
        assert!(index.is_dirty(2));

        index.end_fault(2);
        let summary = index.clear(0, 3, |_, _| Ok(()), |_| {});
        assert_eq!(summary.cleared, 1);
        assert!(!index.is_dirty(2));
        Ok(())
    }
}
