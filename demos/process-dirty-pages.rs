//! This example demonstrates tracking writes to memory of the current
//! process with the Linux driver.

#[cfg(target_os = "linux")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use mwritten::{Tracker, Va, driver::unix::UnixDriver};

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .init();

    // Setup the tracker.
    let tracker = Tracker::new(UnixDriver::new()?)?;
    let page = tracker.info().page_size as usize;

    let mut map = memmap2::MmapMut::map_anon(64 * page)?;
    let base = Va::from(map.as_ptr());
    let len = map.len() as u64;

    // Start tracking the mapping.
    tracker.clear(base, len)?;

    for i in [3, 5, 8, 13, 21, 34, 55] {
        map[i * page + 42] = i as u8;
    }

    let result = tracker.take_written(base, len, 64)?;
    println!("{} pages written:", result.len());
    for va in &result.addresses {
        println!("  {va} (page {})", (*va - base) / result.granularity);
    }

    let result = tracker.written(base, len, 64)?;
    println!("after clear: {} pages written", result.len());

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("this example requires Linux");
}
