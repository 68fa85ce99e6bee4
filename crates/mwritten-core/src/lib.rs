//! Core write tracking functionality.
//!
//! The [`Tracker`] records, at page granularity, which pages of a process
//! have been written since tracking began or since they were last cleared.
//! It talks to the tracked address space only through a [`TrackerDriver`],
//! which supplies the mapping table, page protection, and the delivery of
//! write faults.
//!
//! Regions are never registered explicitly. The first query touching a
//! writable mapping turns the queried pages of it into a [`MonitoredRegion`]
//! and write-protects them. From then on the [`Interceptor`] records the
//! first write to each of those pages.

mod core;
pub mod driver;
mod error;
mod event;
mod handler;
mod index;
mod interceptor;
mod query;
mod region;
mod validator;

use std::{
    ops::Range,
    sync::{Arc, MutexGuard},
};

use rangemap::RangeSet;
use smallvec::SmallVec;

pub use self::{
    core::{MemoryAccess, TrackerInfo, Va},
    driver::{Mapping, TrackerDriver, TrackerProtection},
    error::{ResultCode, TrackerError},
    event::{FaultDisposition, WriteFault},
    handler::WriteFaultHandler,
    index::{ClearSummary, DirtyIndex},
    interceptor::Interceptor,
    query::{QueryFlags, QueryResult},
    region::{MonitoredRegion, RegionPin, RegionTable},
    validator::{Rejection, ValidatedRange},
};

/// A page range of one region covered by a query.
struct Span<'a> {
    region: &'a MonitoredRegion,
    first: u64,
    last: u64,
}

/// The write tracking engine.
pub struct Tracker<Driver>
where
    Driver: TrackerDriver,
{
    driver: Driver,
    interceptor: Arc<Interceptor>,
    info: TrackerInfo,
    baseline_supported: bool,
    baseline: bool,
}

impl<Driver> Tracker<Driver>
where
    Driver: TrackerDriver,
{
    /// Creates a new `Tracker` and attaches it to the driver.
    ///
    /// The driver's write baseline is reset, so writes made before this
    /// call are never reported. Baseline seeding of newly discovered regions
    /// is enabled by default if the driver keeps one.
    pub fn new(driver: Driver) -> Result<Self, TrackerError> {
        let info = driver.info()?;
        let interceptor = Arc::new(Interceptor::new());

        driver.attach(interceptor.clone())?;

        let baseline_supported = match driver.reset_baseline() {
            Ok(supported) => supported,
            Err(err) => {
                tracing::warn!(%err, "failed to reset write baseline");
                false
            }
        };

        tracing::debug!(
            page_size = info.page_size,
            baseline = baseline_supported,
            "tracker attached"
        );

        Ok(Self {
            driver,
            interceptor,
            info,
            baseline_supported,
            baseline: baseline_supported,
        })
    }

    /// Sets the maximum number of regions monitored at the same time.
    ///
    /// Queries that extend a region merge into it, and the slot of a region
    /// whose mapping is gone is reused. The default is
    /// [`RegionTable::DEFAULT_CAPACITY`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_region_capacity(self, capacity: usize) -> Self {
        assert!(capacity > 0, "region capacity must be non-zero");
        self.interceptor.regions().set_capacity(capacity);
        self
    }

    /// Enables or disables seeding newly discovered regions with the pages
    /// the driver saw written before the region was monitored.
    ///
    /// Has no effect if the driver keeps no baseline.
    pub fn with_baseline(mut self, enabled: bool) -> Self {
        self.baseline = enabled && self.baseline_supported;
        self
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns information about the tracked address space.
    pub fn info(&self) -> TrackerInfo {
        self.info
    }

    pub(crate) fn regions(&self) -> &RegionTable {
        self.interceptor.regions()
    }

    /// Returns the maximum number of regions monitored at the same time.
    pub fn region_capacity(&self) -> usize {
        self.regions().capacity()
    }

    /// Returns the number of live monitored regions.
    pub fn monitored_regions(&self) -> usize {
        let regions = self.regions();
        let _pin = regions.pin();
        regions.live().count()
    }

    /// Checks if `[va, va + len)` lies in memory the tracker accepts as
    /// writable.
    pub fn check_writable(&self, va: Va, len: u64) -> bool {
        let regions = self.regions();
        let _guard = regions.lock();
        self.validate(va, len).is_ok()
    }

    fn reserved(&self) -> SmallVec<[(Va, Va); 8]> {
        let mut result = SmallVec::new();
        result.extend(self.driver.reserved_ranges());

        if Driver::SHARES_ADDRESS_SPACE {
            result.extend(self.regions().storage());
        }

        result
    }

    //
    // Must be called with the region table locked.
    //
    fn validate(&self, va: Va, len: u64) -> Result<ValidatedRange, TrackerError> {
        let end = match va.checked_add(len) {
            Some(end) if len > 0 => end,
            _ => return Err(TrackerError::InvalidRange),
        };

        let regions = self.regions();
        let overlapping = regions.overlapping(va, end);
        let outer_start = overlapping.iter().fold(va, |acc, region| acc.min(region.base()));
        let outer_end = overlapping.iter().fold(end, |acc, region| acc.max(region.end()));

        let mappings = self.driver.mappings(outer_start, outer_end - outer_start)?;

        for region in overlapping {
            if !is_intact(region, &mappings) {
                tracing::debug!(
                    base = %region.base(),
                    end = %region.end(),
                    "mapping changed, retiring region"
                );

                region.retire();
                self.release(region, &mappings);
            }
        }

        let reserved = self.reserved();

        match validator::validate(
            self.info.page_size,
            va,
            len,
            &mappings,
            &reserved,
            |piece| regions.covers_armed(piece),
        ) {
            Ok(range) => Ok(range),
            Err(rejection) => {
                tracing::trace!(%va, len, ?rejection, "range rejected");
                Err(rejection.into())
            }
        }
    }

    /// Validates a range and resolves it into per-region page spans,
    /// monitoring any writable mapping seen for the first time.
    ///
    /// The spans stay valid for as long as the returned pin is held.
    fn resolve(
        &self,
        va: Va,
        len: u64,
    ) -> Result<(RegionPin<'_>, SmallVec<[Span<'_>; 4]>), TrackerError> {
        let regions = self.regions();
        let guard = regions.lock();
        let range = self.validate(va, len);

        if let Ok(range) = &range {
            for piece in &range.pieces {
                if piece.access.contains(MemoryAccess::W) {
                    self.retire_replaced(piece, range);
                }
            }
        }

        self.reclaim(&guard);
        let range = range?;

        for piece in &range.pieces {
            if piece.access.contains(MemoryAccess::W) {
                self.discover(&guard, piece, &range)?;
            }
        }

        let pin = regions.pin();
        let mut spans = SmallVec::new();
        for region in regions.overlapping(range.start, range.end) {
            spans.push(Span {
                region,
                first: region.page_of(range.start.max(region.base())),
                last: region.page_of(range.end.min(region.end()) - 1),
            });
        }

        Ok((pin, spans))
    }

    /// Monitors the queried part of a writable mapping not yet covered by
    /// a region.
    ///
    /// Only the queried pages are monitored, never the whole mapping: the
    /// kernel may have merged unrelated memory (another thread's stack, for
    /// one) into the same mapping.
    fn discover(
        &self,
        guard: &MutexGuard<'_, ()>,
        piece: &Mapping,
        range: &ValidatedRange,
    ) -> Result<(), TrackerError> {
        let start = piece.base.max(range.start);
        let end = piece.end.min(range.end);
        if start >= end {
            return Ok(());
        }

        let mut taken = RangeSet::new();

        for region in self.regions().overlapping(start, end) {
            taken.insert(region.base().0..region.end().0);
        }

        for (tstart, tend) in self.reserved() {
            if tstart < tend {
                taken.insert(self.page_span(tstart, tend));
            }
        }

        let holes: SmallVec<[Range<u64>; 4]> = taken.gaps(&(start.0..end.0)).collect();

        for hole in holes {
            self.monitor(guard, piece, Va(hole.start), Va(hole.end))?;
        }

        Ok(())
    }

    fn page_span(&self, start: Va, end: Va) -> Range<u64> {
        let page_size = self.info.page_size;
        start.align_down(page_size).0..(end - 1).align_down(page_size).0 + page_size
    }

    /// Monitors `[base, end)` of `piece`.
    ///
    /// A region of the same mapping that ends at `base` or starts at `end`
    /// is merged into the new one, so that a mapping queried page by page
    /// still takes a single slot.
    fn monitor(
        &self,
        guard: &MutexGuard<'_, ()>,
        piece: &Mapping,
        base: Va,
        end: Va,
    ) -> Result<(), TrackerError> {
        let regions = self.regions();
        let access = piece.access;

        if regions.is_full() {
            self.sweep(guard);
        }

        let adjacent: SmallVec<[&MonitoredRegion; 2]> = regions
            .live()
            .filter(|region| region.end() == base || region.base() == end)
            .filter(|region| region.access() == access && region.identity() == piece.identity)
            .filter(|region| self.is_still_mapped(region))
            .collect();

        let extent_base = adjacent.iter().fold(base, |acc, region| acc.min(region.base()));
        let extent_end = adjacent.iter().fold(end, |acc, region| acc.max(region.end()));
        let region = MonitoredRegion::new(
            extent_base,
            extent_end,
            self.info.page_shift,
            access,
            piece.identity,
        )?;

        let region = if adjacent.is_empty() {
            regions.register(guard, region)?
        } else {
            regions.replace(guard, &adjacent, region)?
        };

        let first = region.page_of(base);
        let pages = (end - base) >> self.info.page_shift;

        tracing::debug!(
            %base,
            %end,
            %access,
            pages,
            merged = adjacent.len(),
            "monitoring region"
        );

        if let Err(err) = self.driver.set_memory_access(base, pages, access.armed()) {
            tracing::warn!(%base, %end, %err, "failed to arm region, pages degraded");

            for page in first..first + pages {
                region.index().degrade(page);
            }

            return Ok(());
        }

        if !self.baseline {
            return Ok(());
        }

        match self.driver.written_pages(base, pages) {
            Ok(Some(written)) => {
                for page in written.into_iter().filter(|&page| page < pages) {
                    region.index().insert(first + page);
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%base, %err, "failed to read write baseline"),
        }

        Ok(())
    }

    fn is_still_mapped(&self, region: &MonitoredRegion) -> bool {
        match self.driver.mappings(region.base(), region.end() - region.base()) {
            Ok(mappings) => is_intact(region, &mappings),
            Err(_) => false,
        }
    }

    /// Retires every region whose mapping is gone and frees the slots of
    /// retired regions.
    fn sweep(&self, guard: &MutexGuard<'_, ()>) {
        for region in self.regions().live() {
            let mappings = match self.driver.mappings(region.base(), region.end() - region.base()) {
                Ok(mappings) => mappings,
                Err(err) => {
                    tracing::warn!(base = %region.base(), %err, "failed to list region mappings");
                    continue;
                }
            };

            if !is_intact(region, &mappings) {
                tracing::debug!(
                    base = %region.base(),
                    end = %region.end(),
                    "retiring stale region"
                );

                region.retire();
                self.release(region, &mappings);
            }
        }

        self.reclaim(guard);
    }

    fn reclaim(&self, guard: &MutexGuard<'_, ()>) {
        self.regions()
            .reclaim(guard, |region| self.release_mapped(region));
    }

    /// Retires regions whose memory was unmapped and mapped again since
    /// they were monitored.
    ///
    /// A clean page of a live region is always write-protected, so a clean
    /// page found writable belongs to a mapping the region never armed.
    fn retire_replaced(&self, piece: &Mapping, range: &ValidatedRange) {
        let start = piece.base.max(range.start);
        let end = piece.end.min(range.end);

        for region in self.regions().overlapping(start, end) {
            let first = region.page_of(start.max(region.base()));
            let last = region.page_of(end.min(region.end()) - 1);

            let Some(page) = (first..=last).find(|&page| !region.index().is_dirty(page)) else {
                continue;
            };

            if !self.is_unarmed(region, page) {
                continue;
            }

            tracing::debug!(
                base = %region.base(),
                end = %region.end(),
                "mapping replaced, retiring region"
            );

            region.retire();
            self.release_mapped(region);
        }
    }

    //
    // The mapping table was read before the page was seen clean; a clear
    // racing with this query may have armed it since. Read the protection
    // again and make sure no fault touched the page meanwhile.
    //
    fn is_unarmed(&self, region: &MonitoredRegion, page: u64) -> bool {
        let va = region.va_of(page);
        let before = region.index().snapshot(page);

        if before & index::DIRTY != 0 {
            return false;
        }

        let writable = match self.driver.mappings(va, self.info.page_size) {
            Ok(mappings) => mappings
                .iter()
                .any(|mapping| mapping.contains(va) && mapping.access.contains(MemoryAccess::W)),
            Err(_) => false,
        };

        writable && region.index().snapshot(page) == before
    }

    fn release_mapped(&self, region: &MonitoredRegion) {
        match self.driver.mappings(region.base(), region.end() - region.base()) {
            Ok(mappings) => self.release(region, &mappings),
            Err(err) => {
                tracing::warn!(base = %region.base(), %err, "failed to list region mappings");
            }
        }
    }

    /// Gives the armed parts of a retired region their original protection
    /// back.
    ///
    /// Only memory of the region's own mapping is touched, and never a page
    /// a live region has armed since.
    fn release(&self, region: &MonitoredRegion, mappings: &[Mapping]) {
        let armed = region.access().armed();
        let mut pending = RangeSet::new();

        for mapping in mappings
            .iter()
            .filter(|mapping| mapping.access == armed && mapping.identity == region.identity())
        {
            let start = mapping.base.max(region.base());
            let end = mapping.end.min(region.end());
            if start < end {
                pending.insert(start.0..end.0);
            }
        }

        for live in self.regions().overlapping(region.base(), region.end()) {
            pending.remove(live.base().0..live.end().0);
        }

        for range in pending.iter() {
            let start = Va(range.start);
            let pages = (range.end - range.start) >> self.info.page_shift;

            if let Err(err) = self.driver.set_memory_access(start, pages, region.access()) {
                tracing::error!(%start, pages, %err, "failed to release region");
            }
        }
    }
}

/// Checks if the memory of a region is still the mapping it was created
/// over, with every page either armed or released.
fn is_intact(region: &MonitoredRegion, mappings: &[Mapping]) -> bool {
    let armed = region.access().armed();
    let mut cursor = region.base();

    for mapping in mappings
        .iter()
        .filter(|mapping| mapping.end > region.base() && mapping.base < region.end())
    {
        if mapping.base > cursor
            || mapping.identity != region.identity()
            || (mapping.access != armed && mapping.access != region.access())
        {
            return false;
        }

        cursor = mapping.end;
    }

    cursor >= region.end()
}

impl<Driver> Drop for Tracker<Driver>
where
    Driver: TrackerDriver,
{
    fn drop(&mut self) {
        {
            let regions = self.interceptor.regions();
            let _guard = regions.lock();

            let live: SmallVec<[&MonitoredRegion; 8]> = regions.live().collect();
            for region in &live {
                region.retire();
            }

            for region in live {
                self.release_mapped(region);
            }
        }

        if let Err(err) = self.driver.detach() {
            tracing::error!(%err, "failed to detach tracker");
        }
    }
}
