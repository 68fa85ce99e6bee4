//! This example demonstrates incremental checkpointing of a simulated
//! address space: only the pages written since the previous checkpoint are
//! copied.

use mwritten::{MemoryAccess, Tracker, driver::sim::SimDriver};

const PAGE: u64 = 4096;
const PAGES: u64 = 256;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .init();

    // Setup the tracker.
    let tracker = Tracker::new(SimDriver::new(PAGE))?;
    let driver = tracker.driver();
    let base = driver.map(PAGES * PAGE, MemoryAccess::RW)?;

    // The initial checkpoint copies everything and starts tracking.
    let mut snapshot = driver.read(base, (PAGES * PAGE) as usize)?;
    tracker.clear(base, PAGES * PAGE)?;

    for round in 1..=4u64 {
        // Simulate a workload touching a few pages.
        for i in 0..round * 3 {
            let va = base + ((i * 37 + round) % PAGES) * PAGE + i;
            driver.write(va, &round.to_le_bytes())?;
        }

        // Copy only what changed.
        let dirty = tracker.take_written(base, PAGES * PAGE, PAGES as usize)?;
        for &va in &dirty.addresses {
            let offset = (va - base) as usize;
            let content = driver.read(va, PAGE as usize)?;
            snapshot[offset..offset + PAGE as usize].copy_from_slice(&content);
        }

        println!(
            "checkpoint {round}: {} of {PAGES} pages copied ({} faults so far)",
            dirty.len(),
            driver.faults()
        );
    }

    let memory = driver.read(base, (PAGES * PAGE) as usize)?;
    assert!(memory == snapshot);
    println!("snapshot matches memory");

    // Nothing was written since the last checkpoint.
    let pending = tracker.written(base, PAGES * PAGE, 4)?;
    println!("pending: {:?}", pending.addresses);

    Ok(())
}
