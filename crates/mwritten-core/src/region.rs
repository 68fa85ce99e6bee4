use std::sync::{
    Mutex, MutexGuard, OnceLock,
    atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use smallvec::SmallVec;

use crate::{DirtyIndex, Mapping, MemoryAccess, TrackerError, Va};

/// A contiguous, page-aligned range of memory whose writes are tracked.
pub struct MonitoredRegion {
    base: Va,
    end: Va,
    page_shift: u64,
    access: MemoryAccess,
    identity: u64,
    index: DirtyIndex,
    live: AtomicBool,
}

impl MonitoredRegion {
    /// Creates a region over `[base, end)`.
    ///
    /// `access` is the protection the memory had before it was monitored,
    /// and is what a page gets back once it has been written. `identity` is
    /// the [`Mapping::identity`] of the memory.
    ///
    /// [`Mapping::identity`]: crate::Mapping::identity
    pub fn new(
        base: Va,
        end: Va,
        page_shift: u64,
        access: MemoryAccess,
        identity: u64,
    ) -> Result<Self, TrackerError> {
        debug_assert!(base.is_aligned(1 << page_shift));
        debug_assert!(end > base);

        Ok(Self {
            base,
            end,
            page_shift,
            access,
            identity,
            index: DirtyIndex::new((end - base) >> page_shift)?,
            live: AtomicBool::new(true),
        })
    }

    /// Returns the first address of the region.
    pub fn base(&self) -> Va {
        self.base
    }

    /// Returns one past the last address of the region.
    pub fn end(&self) -> Va {
        self.end
    }

    /// Returns the number of pages in the region.
    pub fn pages(&self) -> u64 {
        self.index.pages()
    }

    /// Returns the protection of the region's pages while they are writable.
    pub fn access(&self) -> MemoryAccess {
        self.access
    }

    /// Returns the identity of the mapping the region was created over.
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Returns the dirty page index of the region.
    pub fn index(&self) -> &DirtyIndex {
        &self.index
    }

    /// Checks if the region is still backed by its mapping.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Checks if the region contains the given address.
    pub fn contains(&self, va: Va) -> bool {
        self.base <= va && va < self.end
    }

    /// Checks if the region intersects `[start, end)`.
    pub fn overlaps(&self, start: Va, end: Va) -> bool {
        self.base < end && start < self.end
    }

    /// Returns the index of the page containing `va`.
    pub fn page_of(&self, va: Va) -> u64 {
        (va - self.base) >> self.page_shift
    }

    /// Returns the address of the given page.
    pub fn va_of(&self, page: u64) -> Va {
        self.base + (page << self.page_shift)
    }

    pub(crate) fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for MonitoredRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredRegion")
            .field("base", &self.base)
            .field("end", &self.end)
            .field("access", &self.access)
            .field("identity", &self.identity)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Arena of monitored regions.
///
/// Regions are published into slots with a release store and are read by
/// the write fault handler without locking. Readers [`pin`] the table for as
/// long as they hold region references. A region is freed only after it has
/// been unpublished and every reader that could have seen it has unpinned,
/// and its slot is then reused.
///
/// [`pin`]: Self::pin
pub struct RegionTable {
    slots: OnceLock<Box<[AtomicPtr<MonitoredRegion>]>>,
    capacity: AtomicUsize,
    len: AtomicUsize,
    registration: Mutex<()>,
    epoch: AtomicUsize,
    readers: [AtomicUsize; 2],
}

/// Keeps the regions seen through a [`RegionTable`] alive.
///
/// Obtained from [`RegionTable::pin`].
pub struct RegionPin<'a> {
    table: &'a RegionTable,
    parity: usize,
}

impl Drop for RegionPin<'_> {
    fn drop(&mut self) {
        self.table.readers[self.parity].fetch_sub(1, Ordering::SeqCst);
    }
}

impl RegionTable {
    /// Default number of region slots.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: OnceLock::new(),
            capacity: AtomicUsize::new(Self::DEFAULT_CAPACITY),
            len: AtomicUsize::new(0),
            registration: Mutex::new(()),
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Sets the number of slots.
    ///
    /// Has no effect once the first region has been registered.
    pub fn set_capacity(&self, capacity: usize) {
        if self.slots.get().is_some() {
            tracing::warn!(capacity, "region table already allocated");
            return;
        }

        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        match self.slots.get() {
            Some(slots) => slots.len(),
            None => self.capacity.load(Ordering::Relaxed),
        }
    }

    /// Serializes region creation and retirement.
    ///
    /// Never taken on the write fault path.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Announces a reader.
    ///
    /// No region the reader can see is freed before the pin is dropped.
    /// Lock-free and async-signal-safe.
    pub fn pin(&self) -> RegionPin<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let parity = epoch & 1;

            self.readers[parity].fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return RegionPin {
                    table: self,
                    parity,
                };
            }

            self.readers[parity].fetch_sub(1, Ordering::SeqCst);
        }
    }

    //
    // Waits until every reader pinned before this call has unpinned.
    // Readers pinning afterwards see every store made before it.
    //
    fn synchronize(&self, _guard: &MutexGuard<'_, ()>) {
        let old = self.epoch.fetch_add(1, Ordering::SeqCst) & 1;

        while self.readers[old].load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
    }

    fn slots(&self) -> &[AtomicPtr<MonitoredRegion>] {
        match self.slots.get() {
            Some(slots) => &slots[..self.len.load(Ordering::Acquire)],
            None => &[],
        }
    }

    fn published(&self) -> impl Iterator<Item = &MonitoredRegion> {
        self.slots().iter().filter_map(|slot| {
            let region = slot.load(Ordering::Acquire);

            // SAFETY: Published pointers come from `Box::into_raw` and are
            //         freed only once no pinned reader can see them.
            unsafe { region.as_ref() }
        })
    }

    /// Finds the region a faulting address belongs to.
    ///
    /// Prefers a live region. Falls back to a retired one so that a page
    /// armed just before its region was retired can still be released.
    pub fn lookup(&self, va: Va) -> Option<&MonitoredRegion> {
        let mut retired = None;

        for region in self.published() {
            if !region.contains(va) {
                continue;
            }

            if region.is_live() {
                return Some(region);
            }

            retired = Some(region);
        }

        retired
    }

    /// Returns the live regions.
    pub fn live(&self) -> impl Iterator<Item = &MonitoredRegion> {
        self.published().filter(|region| region.is_live())
    }

    /// Returns the live regions intersecting `[start, end)`, ascending.
    pub fn overlapping(&self, start: Va, end: Va) -> SmallVec<[&MonitoredRegion; 4]> {
        let mut result: SmallVec<[&MonitoredRegion; 4]> = self
            .live()
            .filter(|region| region.overlaps(start, end))
            .collect();

        result.sort_by_key(|region| region.base());
        result
    }

    /// Checks if every byte of a read-only mapping belongs to live regions
    /// that were created over that same mapping and write-protected it.
    pub fn covers_armed(&self, mapping: &Mapping) -> bool {
        let mut cursor = mapping.base;

        for region in self.overlapping(mapping.base, mapping.end) {
            if region.base() > cursor
                || region.identity() != mapping.identity
                || !region.access().contains(MemoryAccess::W)
                || region.access().armed() != mapping.access
            {
                return false;
            }

            cursor = cursor.max(region.end());
        }

        cursor >= mapping.end
    }

    /// Returns the storage ranges of every region's index.
    pub fn storage(&self) -> SmallVec<[(Va, Va); 8]> {
        self.published()
            .map(|region| region.index().storage())
            .collect()
    }

    /// Checks if every slot holds a region.
    pub fn is_full(&self) -> bool {
        let capacity = self.capacity();
        let slots = self.slots();

        slots.len() >= capacity
            && slots
                .iter()
                .all(|slot| !slot.load(Ordering::Acquire).is_null())
    }

    /// Checks if a retired region still occupies a slot.
    pub fn has_retired(&self) -> bool {
        self.published().any(|region| !region.is_live())
    }

    /// Publishes a region into a free slot.
    ///
    /// The caller must hold the guard returned by [`lock`].
    ///
    /// [`lock`]: Self::lock
    pub fn register(
        &self,
        _guard: &MutexGuard<'_, ()>,
        region: MonitoredRegion,
    ) -> Result<&MonitoredRegion, TrackerError> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let slots = self.slots.get_or_init(|| {
            (0..capacity)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect()
        });

        let len = self.len.load(Ordering::Acquire);
        let free = slots[..len]
            .iter()
            .position(|slot| slot.load(Ordering::Acquire).is_null());

        let position = match free {
            Some(position) => position,
            None if len < slots.len() => len,
            None => return Err(TrackerError::RegionLimit),
        };

        let region = Box::into_raw(Box::new(region));
        slots[position].store(region, Ordering::Release);

        if position == len {
            self.len.store(len + 1, Ordering::Release);
        }

        // SAFETY: Just published. Freed only under the registration lock
        //         once no pinned reader can see it.
        Ok(unsafe { &*region })
    }

    /// Publishes `region` in place of the adjacent regions in `old`.
    ///
    /// Writes recorded by `old` before or while the swap happens are merged
    /// into the new region, which must cover all of them. The references in
    /// `old` are dangling once this returns.
    pub(crate) fn replace(
        &self,
        guard: &MutexGuard<'_, ()>,
        old: &[&MonitoredRegion],
        region: MonitoredRegion,
    ) -> Result<&MonitoredRegion, TrackerError> {
        debug_assert!(
            old.iter()
                .all(|old| region.base() <= old.base() && old.end() <= region.end())
        );

        let region = self.register(guard, region)?;
        let unpublished: SmallVec<[*mut MonitoredRegion; 2]> =
            old.iter().filter_map(|&old| self.unpublish(old)).collect();

        //
        // Faults that found an old region have finished once this returns,
        // and new faults only find the new one.
        //
        self.synchronize(guard);

        for &old in &unpublished {
            // SAFETY: Unpublished above and no longer reachable by readers.
            let old = unsafe { Box::from_raw(old) };
            region.index().absorb(region.page_of(old.base()), old.index());
        }

        Ok(region)
    }

    /// Frees every retired region.
    ///
    /// `release` is called for each of them once no query can arm its pages
    /// anymore, and before it is unpublished, so that a fault on a page it
    /// leaves armed still finds the region.
    pub(crate) fn reclaim(
        &self,
        guard: &MutexGuard<'_, ()>,
        mut release: impl FnMut(&MonitoredRegion),
    ) {
        if !self.has_retired() {
            return;
        }

        self.synchronize(guard);

        let retired: SmallVec<[&MonitoredRegion; 4]> = self
            .published()
            .filter(|region| !region.is_live())
            .collect();

        for &region in &retired {
            release(region);
        }

        let unpublished: SmallVec<[*mut MonitoredRegion; 4]> = retired
            .into_iter()
            .filter_map(|region| self.unpublish(region))
            .collect();

        self.synchronize(guard);

        tracing::debug!(regions = unpublished.len(), "reclaimed retired regions");

        for region in unpublished {
            // SAFETY: Unpublished above and no longer reachable by readers.
            drop(unsafe { Box::from_raw(region) });
        }
    }

    fn unpublish(&self, region: &MonitoredRegion) -> Option<*mut MonitoredRegion> {
        let target: *const MonitoredRegion = region;

        self.slots()
            .iter()
            .find(|slot| std::ptr::eq(slot.load(Ordering::Acquire), target))
            .map(|slot| slot.swap(std::ptr::null_mut(), Ordering::SeqCst))
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RegionTable {
    fn drop(&mut self) {
        let Some(slots) = self.slots.get_mut() else {
            return;
        };

        for slot in slots.iter_mut() {
            let region = std::mem::replace(slot.get_mut(), std::ptr::null_mut());
            if !region.is_null() {
                // SAFETY: Created by `Box::into_raw` in `register`.
                drop(unsafe { Box::from_raw(region) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIFT: u64 = 12;

    fn region(base: u64, end: u64) -> Result<MonitoredRegion, TrackerError> {
        MonitoredRegion::new(Va(base), Va(end), SHIFT, MemoryAccess::RW, 1)
    }

    fn armed(base: u64, end: u64, identity: u64) -> Mapping {
        Mapping {
            base: Va(base),
            end: Va(end),
            access: MemoryAccess::R,
            identity,
        }
    }

    #[test]
    fn lookup_prefers_live() -> Result<(), TrackerError> {
        let table = RegionTable::new();
        let guard = table.lock();

        let old = table.register(&guard, region(0x10000, 0x20000)?)?;
        old.retire();
        let new = table.register(&guard, region(0x10000, 0x14000)?)?;

        assert!(std::ptr::eq(table.lookup(Va(0x11000)).unwrap(), new));
        assert!(std::ptr::eq(table.lookup(Va(0x18000)).unwrap(), old));
        assert!(table.lookup(Va(0x30000)).is_none());
        Ok(())
    }

    #[test]
    fn coverage() -> Result<(), TrackerError> {
        let table = RegionTable::new();
        let guard = table.lock();

        table.register(&guard, region(0x10000, 0x12000)?)?;
        table.register(&guard, region(0x12000, 0x14000)?)?;
        table.register(&guard, region(0x20000, 0x21000)?)?;

        assert!(table.covers_armed(&armed(0x10800, 0x13000, 1)));
        assert!(!table.covers_armed(&armed(0x13000, 0x20800, 1)));
        assert_eq!(table.overlapping(Va(0), Va(u64::MAX)).len(), 3);
        Ok(())
    }

    #[test]
    fn coverage_requires_same_mapping() -> Result<(), TrackerError> {
        let table = RegionTable::new();
        let guard = table.lock();

        table.register(&guard, region(0x10000, 0x12000)?)?;

        assert!(!table.covers_armed(&armed(0x10000, 0x12000, 2)));
        assert!(!table.covers_armed(&Mapping {
            access: MemoryAccess::empty(),
            ..armed(0x10000, 0x12000, 1)
        }));
        Ok(())
    }

    #[test]
    fn reclaimed_slots_are_reused() -> Result<(), TrackerError> {
        let table = RegionTable::new();
        table.set_capacity(1);
        let guard = table.lock();

        let first = table.register(&guard, region(0x10000, 0x11000)?)?;
        assert!(table.is_full());
        assert!(matches!(
            table.register(&guard, region(0x20000, 0x21000)?),
            Err(TrackerError::RegionLimit)
        ));

        first.retire();
        let mut released = 0;
        table.reclaim(&guard, |_| released += 1);
        assert_eq!(released, 1);
        assert!(!table.is_full());
        assert!(table.lookup(Va(0x10000)).is_none());

        table.register(&guard, region(0x20000, 0x21000)?)?;
        assert!(table.lookup(Va(0x20000)).is_some());
        Ok(())
    }

    #[test]
    fn replace_merges_dirty_pages() -> Result<(), TrackerError> {
        let table = RegionTable::new();
        let guard = table.lock();

        let left = table.register(&guard, region(0x10000, 0x12000)?)?;
        let right = table.register(&guard, region(0x13000, 0x14000)?)?;
        left.index().insert(1);
        right.index().degrade(0);

        let merged = table.replace(&guard, &[left, right], region(0x10000, 0x14000)?)?;

        assert_eq!(table.live().count(), 1);
        assert!(std::ptr::eq(table.lookup(Va(0x11000)).unwrap(), merged));
        assert_eq!(merged.index().iter_dirty(0, 3).collect::<Vec<_>>(), [1, 3]);
        assert!(merged.index().is_degraded(3));
        Ok(())
    }

    #[test]
    fn pin_outlives_epoch_change() {
        let table = RegionTable::new();
        let guard = table.lock();

        let pin = table.pin();
        assert_eq!(table.readers[0].load(Ordering::SeqCst), 1);
        drop(pin);

        table.synchronize(&guard);
        let _pin = table.pin();
        assert_eq!(table.readers[1].load(Ordering::SeqCst), 1);
        assert_eq!(table.readers[0].load(Ordering::SeqCst), 0);
    }
}
