use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use mwritten_core::{Mapping, MemoryAccess, TrackerInfo, Va, WriteFaultHandler};
use once_cell::sync::OnceCell;

use crate::{Error, UnixDriverOptions, maps, pagemap, signal};

fn page_size() -> u64 {
    static PAGE_SIZE: OnceCell<u64> = OnceCell::new();

    *PAGE_SIZE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as u64,
        _ => 4096,
    })
}

/// The address space of the current process.
pub struct ProcessDriver {
    info: TrackerInfo,
    options: UnixDriverOptions,
    baseline: AtomicBool,
}

impl ProcessDriver {
    pub fn new(options: UnixDriverOptions) -> Result<Self, Error> {
        Ok(Self {
            info: TrackerInfo::new(page_size()),
            options,
            baseline: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> Result<TrackerInfo, Error> {
        Ok(self.info)
    }

    pub fn set_memory_access(&self, va: Va, pages: u64, access: MemoryAccess) -> Result<(), Error> {
        signal::protect(va, pages << self.info.page_shift, access)?;
        Ok(())
    }

    pub fn mappings(&self, va: Va, len: u64) -> Result<Vec<Mapping>, Error> {
        maps::read(va, Va(va.0.saturating_add(len)))
    }

    pub fn reserved_ranges(&self) -> Vec<(Va, Va)> {
        vec![signal::reserved(self.info.page_size)]
    }

    pub fn reset_baseline(&self) -> Result<bool, Error> {
        if !self.options.soft_dirty {
            return Ok(false);
        }

        match pagemap::reset() {
            Ok(()) => {
                self.baseline.store(true, Ordering::Relaxed);
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(?err, "soft-dirty tracking unavailable");
                self.baseline.store(false, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    pub fn written_pages(&self, base: Va, pages: u64) -> Result<Option<Vec<u64>>, Error> {
        if !self.baseline.load(Ordering::Relaxed) {
            return Ok(None);
        }

        pagemap::written_pages(base, pages, self.info.page_shift).map(Some)
    }

    pub fn attach(&self, handler: Arc<dyn WriteFaultHandler>) -> Result<(), Error> {
        signal::install(
            handler,
            self.info.page_shift,
            self.options.chain_previous_handler,
        )
    }

    pub fn detach(&self) -> Result<(), Error> {
        signal::uninstall()
    }
}
