use smallvec::SmallVec;

use crate::{Mapping, MemoryAccess, TrackerError, Va};

/// A caller range that was proven to lie in writable memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRange {
    /// Start of the first page of the range.
    pub start: Va,

    /// End of the last page of the range.
    pub end: Va,

    /// The mappings backing the range, ascending and contiguous.
    pub pieces: SmallVec<[Mapping; 4]>,
}

/// Why a range was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Zero length, or the range wraps around the address space.
    Malformed,

    /// Part of the range is not mapped.
    Gap {
        /// First unmapped address.
        start: Va,

        /// End of the unmapped part, clipped to the range.
        end: Va,
    },

    /// Part of the range is mapped but not writable.
    NotWritable(Va),

    /// Part of the range belongs to the tracker itself.
    Reserved(Va),
}

impl From<Rejection> for TrackerError {
    fn from(_: Rejection) -> Self {
        TrackerError::InvalidRange
    }
}

/// Maps `[va, va + len)` onto whole pages, checking that every byte lies in
/// mapped, writable memory.
///
/// `mappings` are the mappings intersecting the range, ascending. A mapping
/// that is currently read-only is still accepted where `armed` reports it as
/// monitored memory that was write-protected by the tracker itself. `armed`
/// sees the mapping clipped to the range.
/// `reserved` ranges are never accepted.
pub fn validate(
    page_size: u64,
    va: Va,
    len: u64,
    mappings: &[Mapping],
    reserved: &[(Va, Va)],
    armed: impl Fn(&Mapping) -> bool,
) -> Result<ValidatedRange, Rejection> {
    if len == 0 {
        return Err(Rejection::Malformed);
    }

    let end = va.checked_add(len).ok_or(Rejection::Malformed)?;
    let start = va.align_down(page_size);
    let page_end = (end - 1)
        .align_down(page_size)
        .checked_add(page_size)
        .ok_or(Rejection::Malformed)?;

    if let Some(&(reserved, _)) = reserved
        .iter()
        .find(|&&(rstart, rend)| rstart < end && va < rend)
    {
        return Err(Rejection::Reserved(reserved.max(va)));
    }

    let mut pieces = SmallVec::new();
    let mut cursor = va;

    for mapping in mappings {
        if mapping.end <= cursor {
            continue;
        }

        if mapping.base > cursor {
            return Err(Rejection::Gap {
                start: cursor,
                end: mapping.base.min(end),
            });
        }

        let piece_end = mapping.end.min(end);
        let clipped = Mapping {
            base: cursor,
            end: piece_end,
            ..*mapping
        };

        if !mapping.access.contains(MemoryAccess::W) && !armed(&clipped) {
            return Err(Rejection::NotWritable(cursor));
        }

        pieces.push(*mapping);
        cursor = piece_end;

        if cursor >= end {
            return Ok(ValidatedRange {
                start,
                end: page_end,
                pieces,
            });
        }
    }

    Err(Rejection::Gap { start: cursor, end })
}
