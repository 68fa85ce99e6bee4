use serde::{Deserialize, Serialize};

use crate::{Span, Tracker, TrackerDriver, TrackerError, Va};

bitflags::bitflags! {
    /// Flags of a query.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QueryFlags: u32 {
        /// Clear the dirty state of the queried range after reporting it.
        const CLEAR = 1 << 0;
    }
}

/// Owned result of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Base addresses of the dirty pages, ascending.
    pub addresses: Vec<Va>,

    /// The tracking page size.
    pub granularity: u64,
}

impl QueryResult {
    /// Returns the number of reported pages.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Checks if no page was reported.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Output buffer of a query.
struct Sink<'a> {
    buffer: Option<&'a mut [Va]>,
    written: usize,
}

impl Sink<'_> {
    fn is_full(&self) -> bool {
        match &self.buffer {
            Some(buffer) => self.written >= buffer.len(),
            None => true,
        }
    }

    fn push(&mut self, va: Va) {
        if let Some(buffer) = &mut self.buffer
            && let Some(slot) = buffer.get_mut(self.written)
        {
            *slot = va;
            self.written += 1;
        }
    }
}

impl<Driver> Tracker<Driver>
where
    Driver: TrackerDriver,
{
    /// Reports, and optionally clears, the pages written in
    /// `[va, va + len)`.
    ///
    /// On success, up to `*count` page base addresses are written to the
    /// front of `addresses` in ascending order, `*count` is set to the number
    /// written, and `*granularity` to the page size. Having more dirty pages
    /// than capacity is not an error; the caller cannot tell it apart from
    /// having exactly `*count` of them.
    ///
    /// With [`QueryFlags::CLEAR`], every dirty page of the range is cleared
    /// and re-armed after being reported, and `addresses` and `count` may
    /// both be omitted.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - [`TrackerError::InvalidArgument`] if `len` is zero.
    /// - [`TrackerError::InvalidRange`] if the range is not fully contained
    ///   in mapped, writable memory.
    /// - [`TrackerError::FaultyBuffer`] if `granularity` is missing.
    /// - [`TrackerError::InvalidArgument`] if `addresses` or `count` is
    ///   missing without [`QueryFlags::CLEAR`], or if `addresses` is given
    ///   without `count`.
    /// - [`TrackerError::FaultyBuffer`] if `*count` is zero or larger than
    ///   `addresses`.
    pub fn query(
        &self,
        va: Va,
        len: u64,
        flags: QueryFlags,
        addresses: Option<&mut [Va]>,
        count: Option<&mut usize>,
        granularity: Option<&mut u64>,
    ) -> Result<(), TrackerError> {
        if len == 0 {
            return Err(TrackerError::InvalidArgument);
        }

        let (_pin, spans) = self.resolve(va, len)?;

        let Some(granularity) = granularity else {
            return Err(TrackerError::FaultyBuffer);
        };

        let clear = flags.contains(QueryFlags::CLEAR);
        if !clear && (addresses.is_none() || count.is_none()) {
            return Err(TrackerError::InvalidArgument);
        }

        let buffer = match (addresses, &count) {
            (Some(addresses), Some(count)) => {
                let capacity = **count;
                if capacity == 0 {
                    return Err(TrackerError::FaultyBuffer);
                }

                match addresses.get_mut(..capacity) {
                    Some(addresses) => Some(addresses),
                    None => return Err(TrackerError::FaultyBuffer),
                }
            }
            (Some(_), None) => return Err(TrackerError::InvalidArgument),
            (None, _) => None,
        };

        let mut sink = Sink { buffer, written: 0 };

        for Span {
            region,
            first,
            last,
        } in spans
        {
            if !clear {
                for page in region.index().iter_dirty(first, last) {
                    if sink.is_full() {
                        break;
                    }

                    sink.push(region.va_of(page));
                }

                continue;
            }

            let armed = region.access().armed();
            let summary = region.index().clear(
                first,
                last,
                |page, pages| self.driver.set_memory_access(region.va_of(page), pages, armed),
                |page| sink.push(region.va_of(page)),
            );

            if summary.degraded > 0 {
                tracing::warn!(
                    base = %region.base(),
                    degraded = summary.degraded,
                    "failed to re-arm pages, pages degraded"
                );
            }

            if summary.kept > 0 {
                tracing::debug!(
                    base = %region.base(),
                    kept = summary.kept,
                    "pages written during clear kept dirty"
                );
            }
        }

        *granularity = self.info.page_size;
        if let Some(count) = count {
            *count = sink.written;
        }

        tracing::trace!(%va, len, ?flags, count = sink.written, "query");
        Ok(())
    }

    /// Returns up to `capacity` pages written in `[va, va + len)`.
    pub fn written(&self, va: Va, len: u64, capacity: usize) -> Result<QueryResult, TrackerError> {
        self.collect(va, len, QueryFlags::empty(), capacity)
    }

    /// Returns up to `capacity` pages written in `[va, va + len)` and clears
    /// the dirty state of the whole range.
    pub fn take_written(
        &self,
        va: Va,
        len: u64,
        capacity: usize,
    ) -> Result<QueryResult, TrackerError> {
        self.collect(va, len, QueryFlags::CLEAR, capacity)
    }

    /// Clears the dirty state of `[va, va + len)` without reporting it.
    pub fn clear(&self, va: Va, len: u64) -> Result<(), TrackerError> {
        let mut granularity = 0;
        self.query(va, len, QueryFlags::CLEAR, None, None, Some(&mut granularity))
    }

    fn collect(
        &self,
        va: Va,
        len: u64,
        flags: QueryFlags,
        capacity: usize,
    ) -> Result<QueryResult, TrackerError> {
        let mut addresses = vec![Va::default(); capacity];
        let mut count = capacity;
        let mut granularity = 0;

        self.query(
            va,
            len,
            flags,
            Some(&mut addresses),
            Some(&mut count),
            Some(&mut granularity),
        )?;

        addresses.truncate(count);
        Ok(QueryResult {
            addresses,
            granularity,
        })
    }
}
