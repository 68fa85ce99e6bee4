//! Writers racing with a checkpointer.
//!
//! The checkpointer copies every page reported by a clearing query into a
//! shadow buffer. If no write is ever lost between two checkpoints, the
//! shadow equals memory once the writers are done and a final checkpoint
//! has been taken.

#![cfg(feature = "driver-sim")]

use std::sync::atomic::{AtomicBool, Ordering};

use mwritten::{MemoryAccess, Tracker, TrackerError, Va, driver::sim::SimDriver};

const PAGE: u64 = 4096;
const PAGES: u64 = 64;
const WRITERS: u64 = 4;
const ITERATIONS: u64 = 2000;

fn checkpoint(
    tracker: &Tracker<SimDriver>,
    base: Va,
    shadow: &mut [u8],
) -> Result<usize, TrackerError> {
    let result = tracker.take_written(base, PAGES * PAGE, PAGES as usize)?;

    for &va in &result.addresses {
        let offset = (va - base) as usize;
        let content = tracker.driver().read(va, PAGE as usize)?;
        shadow[offset..offset + PAGE as usize].copy_from_slice(&content);
    }

    Ok(result.len())
}

#[test]
fn checkpoints_never_miss_a_write() -> Result<(), TrackerError> {
    let tracker = Tracker::new(SimDriver::default())?;
    let base = tracker.driver().map(PAGES * PAGE, MemoryAccess::RW)?;
    let mut shadow = vec![0u8; (PAGES * PAGE) as usize];

    assert_eq!(checkpoint(&tracker, base, &mut shadow)?, 0);

    let done = AtomicBool::new(false);

    std::thread::scope(|scope| -> Result<(), TrackerError> {
        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let tracker = &tracker;
                scope.spawn(move || -> Result<(), TrackerError> {
                    for i in 0..ITERATIONS {
                        // Each writer owns every WRITERS-th page.
                        let page = (i * WRITERS + writer) % PAGES;
                        let offset = page * PAGE + (i % PAGE);
                        tracker.driver().write(base + offset, &[(i % 251) as u8 + 1])?;
                    }

                    Ok(())
                })
            })
            .collect();

        let checkpointer = scope.spawn(|| -> Result<usize, TrackerError> {
            let mut rounds = 0;
            while !done.load(Ordering::Acquire) {
                checkpoint(&tracker, base, &mut shadow)?;
                rounds += 1;
            }
            Ok(rounds)
        });

        for writer in writers {
            writer.join().expect("writer panicked")?;
        }

        done.store(true, Ordering::Release);
        checkpointer.join().expect("checkpointer panicked")?;
        Ok(())
    })?;

    checkpoint(&tracker, base, &mut shadow)?;

    let memory = tracker.driver().read(base, (PAGES * PAGE) as usize)?;
    assert!(memory == shadow, "checkpoint diverged from memory");

    // Everything was just checkpointed.
    assert!(tracker.written(base, PAGES * PAGE, PAGES as usize)?.is_empty());
    Ok(())
}

#[test]
fn concurrent_faults_on_one_page_collapse() -> Result<(), TrackerError> {
    let tracker = Tracker::new(SimDriver::default())?;
    let base = tracker.driver().map(4 * PAGE, MemoryAccess::RW)?;
    assert!(tracker.written(base, 4 * PAGE, 4)?.is_empty());

    std::thread::scope(|scope| -> Result<(), TrackerError> {
        let threads: Vec<_> = (0..8u64)
            .map(|thread| {
                let tracker = &tracker;
                scope.spawn(move || tracker.driver().write(base + PAGE + thread * 8, &[1; 8]))
            })
            .collect();

        for thread in threads {
            thread.join().expect("writer panicked")?;
        }

        Ok(())
    })?;

    let result = tracker.written(base, 4 * PAGE, 4)?;
    assert_eq!(result.addresses, [base + PAGE]);
    Ok(())
}
