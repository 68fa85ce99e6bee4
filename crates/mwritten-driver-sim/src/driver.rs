use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use mwritten_core::{
    FaultDisposition, Mapping, MemoryAccess, TrackerError, TrackerInfo, TrackerProtection, Va,
    WriteFault, WriteFaultHandler,
};

use crate::Error;

/// First address handed out by [`SimMemory::map`].
const MAP_BASE: u64 = 0x1000_0000;

/// How many times a single write is retried after a handled fault.
///
/// A concurrent clear may re-arm the page between the handler releasing it
/// and the retry, so more than one attempt can be needed.
const WRITE_ATTEMPTS: usize = 64;

struct SimMapping {
    end: u64,
    identity: u64,
    protection: Vec<MemoryAccess>,
    soft_dirty: Vec<bool>,
    data: Vec<u8>,
}

struct State {
    mappings: BTreeMap<u64, SimMapping>,
    next_base: u64,
    next_identity: u64,
    unarmable: HashSet<u64>,
}

impl State {
    fn find(&self, va: u64) -> Option<(u64, &SimMapping)> {
        let (&base, mapping) = self.mappings.range(..=va).next_back()?;
        (va < mapping.end).then_some((base, mapping))
    }

    fn find_mut(&mut self, va: u64) -> Option<(u64, &mut SimMapping)> {
        let (&base, mapping) = self.mappings.range_mut(..=va).next_back()?;
        (va < mapping.end).then_some((base, mapping))
    }
}

/// Simulated address space.
pub struct SimMemory {
    info: TrackerInfo,
    state: Mutex<State>,
    handler: Mutex<Option<Arc<dyn WriteFaultHandler>>>,
    faults: AtomicUsize,
}

impl SimMemory {
    pub fn new(page_size: u64) -> Self {
        Self {
            info: TrackerInfo::new(page_size),
            state: Mutex::new(State {
                mappings: BTreeMap::new(),
                next_base: MAP_BASE,
                next_identity: 1,
                unarmable: HashSet::new(),
            }),
            handler: Mutex::new(None),
            faults: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn page_size(&self) -> u64 {
        self.info.page_size
    }

    fn page_count(&self, len: u64) -> Result<u64, Error> {
        if len == 0 {
            return Err(Error::InvalidLength);
        }

        len.checked_add(self.page_size() - 1)
            .map(|len| len >> self.info.page_shift)
            .ok_or(Error::InvalidLength)
    }

    fn insert(&self, state: &mut State, base: u64, pages: u64, access: MemoryAccess) {
        let len = pages << self.info.page_shift;
        let identity = state.next_identity;
        state.next_identity += 1;

        state.mappings.insert(
            base,
            SimMapping {
                end: base + len,
                identity,
                protection: vec![access; pages as usize],
                soft_dirty: vec![false; pages as usize],
                data: vec![0; len as usize],
            },
        );

        tracing::debug!(base = %Va(base), end = %Va(base + len), %access, "mapped");
    }

    pub fn info(&self) -> Result<TrackerInfo, Error> {
        Ok(self.info)
    }

    pub fn map(&self, len: u64, access: MemoryAccess) -> Result<Va, Error> {
        let pages = self.page_count(len)?;
        let mut state = self.state();

        let base = state.next_base;
        state.next_base = base + ((pages + 1) << self.info.page_shift);
        self.insert(&mut state, base, pages, access);

        Ok(Va(base))
    }

    pub fn map_fixed(&self, va: Va, len: u64, access: MemoryAccess) -> Result<Va, Error> {
        if !va.is_aligned(self.page_size()) {
            return Err(Error::Unmapped(va));
        }

        let pages = self.page_count(len)?;
        let end = va
            .checked_add(pages << self.info.page_shift)
            .ok_or(Error::InvalidLength)?;

        let mut state = self.state();
        let overlaps = state
            .mappings
            .range(..end.0)
            .next_back()
            .is_some_and(|(_, mapping)| mapping.end > va.0);

        if overlaps {
            return Err(Error::Overlap(va));
        }

        state.next_base = state.next_base.max(end.0 + self.page_size());
        self.insert(&mut state, va.0, pages, access);

        Ok(va)
    }

    pub fn unmap(&self, va: Va) -> Result<(), Error> {
        let mut state = self.state();

        match state.mappings.remove(&va.0) {
            Some(mapping) => {
                tracing::debug!(base = %va, end = %Va(mapping.end), "unmapped");
                Ok(())
            }
            None => Err(Error::Unmapped(va)),
        }
    }

    pub fn read(&self, va: Va, len: usize) -> Result<Vec<u8>, Error> {
        let state = self.state();
        let mut result = Vec::with_capacity(len);
        let mut cursor = va.0;
        let end = va.0 + len as u64;

        while cursor < end {
            let (base, mapping) = state.find(cursor).ok_or(Error::Unmapped(Va(cursor)))?;
            let page = ((cursor - base) >> self.info.page_shift) as usize;
            if !mapping.protection[page].contains(MemoryAccess::R) {
                return Err(Error::AccessViolation(Va(cursor)));
            }

            let page_end = (cursor | (self.page_size() - 1)) + 1;
            let chunk_end = end.min(page_end);
            let offset = (cursor - base) as usize;
            let chunk_len = (chunk_end - cursor) as usize;
            result.extend_from_slice(&mapping.data[offset..offset + chunk_len]);
            cursor = chunk_end;
        }

        Ok(result)
    }

    pub fn write(&self, va: Va, content: &[u8]) -> Result<(), Error> {
        let mut cursor = va.0;
        let mut content = content;

        while !content.is_empty() {
            let page_end = (cursor | (self.page_size() - 1)) + 1;
            let chunk_len = content.len().min((page_end - cursor) as usize);
            let (chunk, rest) = content.split_at(chunk_len);

            self.write_page(Va(cursor), chunk)?;

            cursor = page_end;
            content = rest;
        }

        Ok(())
    }

    pub fn xor(&self, va: Va, value: u8) -> Result<(), Error> {
        let current = self.read(va, 1)?;
        self.write(va, &[current[0] ^ value])
    }

    //
    // Writes within a single page, delivering a write fault each time the
    // page turns out to be protected.
    //
    fn write_page(&self, va: Va, chunk: &[u8]) -> Result<(), Error> {
        for _ in 0..WRITE_ATTEMPTS {
            let access = {
                let mut state = self.state();
                let (base, mapping) = state.find_mut(va.0).ok_or(Error::Unmapped(va))?;
                let offset = (va.0 - base) as usize;
                let page = offset >> self.info.page_shift;
                let access = mapping.protection[page];

                if access.contains(MemoryAccess::W) {
                    mapping.data[offset..offset + chunk.len()].copy_from_slice(chunk);
                    mapping.soft_dirty[page] = true;
                    return Ok(());
                }

                access
            };

            let handler = self
                .handler
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();

            let Some(handler) = handler else {
                return Err(Error::AccessViolation(va));
            };

            self.faults.fetch_add(1, Ordering::Relaxed);

            let fault = WriteFault {
                va,
                access: Some(access),
            };

            if handler.handle_write_fault(self, &fault) == FaultDisposition::NotMonitored {
                return Err(Error::AccessViolation(va));
            }
        }

        Err(Error::AccessViolation(va))
    }

    pub fn faults(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn inject_protection_failure(&self, va: Va) {
        self.state()
            .unarmable
            .insert(va.align_down(self.page_size()).0);
    }

    pub fn set_memory_access(
        &self,
        va: Va,
        pages: u64,
        access: MemoryAccess,
    ) -> Result<(), Error> {
        let mut state = self.state();

        for page in 0..pages {
            let page_va = va.0 + (page << self.info.page_shift);

            if !access.contains(MemoryAccess::W) && state.unarmable.contains(&page_va) {
                return Err(Error::ProtectionFailure(Va(page_va)));
            }

            let (base, mapping) = state
                .find_mut(page_va)
                .ok_or(Error::Unmapped(Va(page_va)))?;

            let index = ((page_va - base) >> self.info.page_shift) as usize;
            mapping.protection[index] = access;
        }

        Ok(())
    }

    pub fn mappings(&self, va: Va, len: u64) -> Result<Vec<Mapping>, Error> {
        let state = self.state();
        let end = va.0.saturating_add(len);
        let mut result: Vec<Mapping> = Vec::new();

        let first = match state.find(va.0) {
            Some((base, _)) => base,
            None => va.0,
        };

        for (&base, mapping) in state.mappings.range(first..end) {
            for (page, &access) in mapping.protection.iter().enumerate() {
                let page_va = Va(base + ((page as u64) << self.info.page_shift));
                let page_end = page_va + self.page_size();

                match result.last_mut() {
                    Some(last)
                        if last.end == page_va
                            && last.access == access
                            && last.identity == mapping.identity =>
                    {
                        last.end = page_end;
                    }
                    _ => result.push(Mapping {
                        base: page_va,
                        end: page_end,
                        access,
                        identity: mapping.identity,
                    }),
                }
            }
        }

        //
        // Keep only the runs that intersect the range.
        //
        result.retain(|mapping| mapping.end.0 > va.0 && mapping.base.0 < end);
        Ok(result)
    }

    pub fn reset_baseline(&self) -> Result<bool, Error> {
        for mapping in self.state().mappings.values_mut() {
            mapping.soft_dirty.fill(false);
        }

        Ok(true)
    }

    pub fn written_pages(&self, base: Va, pages: u64) -> Result<Option<Vec<u64>>, Error> {
        let state = self.state();
        let mut result = Vec::new();

        for page in 0..pages {
            let page_va = base.0 + (page << self.info.page_shift);

            if let Some((mbase, mapping)) = state.find(page_va) {
                let index = ((page_va - mbase) >> self.info.page_shift) as usize;
                if mapping.soft_dirty[index] {
                    result.push(page);
                }
            }
        }

        Ok(Some(result))
    }

    pub fn attach(&self, handler: Arc<dyn WriteFaultHandler>) -> Result<(), Error> {
        let mut current = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if current.is_some() {
            return Err(Error::AlreadyAttached);
        }

        *current = Some(handler);
        Ok(())
    }

    pub fn detach(&self) -> Result<(), Error> {
        *self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

impl TrackerProtection for SimMemory {
    fn set_memory_access(
        &self,
        va: Va,
        pages: u64,
        access: MemoryAccess,
    ) -> Result<(), TrackerError> {
        Ok(SimMemory::set_memory_access(self, va, pages, access)?)
    }
}
