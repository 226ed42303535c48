//! Crash and recover: one transaction commits, another is cut off mid-flight

use pagevault::database::{Database, DatabaseConfig};
use pagevault::storage::PageStore;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    println!("=== Recovery Demo ===\n");

    let config = DatabaseConfig {
        page_size: 64,
        cache_capacity: 8,
        ..DatabaseConfig::new("recovery_demo_data")
    };
    // Clean up any previous run
    std::fs::remove_dir_all(&config.data_dir).ok();

    let (committed, in_flight) = {
        let db = Database::create(config.clone())?;
        let committed = db.allocate_page(1)?;
        let in_flight = db.allocate_page(1)?;

        println!("1. T1 writes \"durable\" and commits");
        let t1 = db.begin()?;
        t1.write(committed, |data| data[..7].copy_from_slice(b"durable"))?;
        t1.commit()?;

        println!("2. T2 writes \"doomed\"; its page is flushed before the crash");
        let t2 = db.begin()?;
        t2.write(in_flight, |data| data[..6].copy_from_slice(b"doomed"))?;
        db.cache().flush_page(in_flight)?;
        println!("   on disk now: {:?}", text(&db.store().read_page(in_flight)?));

        // Crash: T2 never commits or aborts
        std::mem::forget(t2);
        (committed, in_flight)
    };

    println!("\n3. Reopen; recovery runs before any transaction");
    let db = Database::open(config.clone())?;
    let report = db.recovery_report();
    println!(
        "   redone: {}, undone: {}, pages rewritten: {:?}",
        report.redone, report.undone, report.pages_written
    );
    println!("   committed page: {:?}", text(&db.store().read_page(committed)?));
    println!("   in-flight page: {:?}", text(&db.store().read_page(in_flight)?));

    println!("\n4. Shutdown checkpoints and truncates the log");
    let log_path = config.log_path();
    let before = std::fs::metadata(&log_path)?.len();
    db.shutdown()?;
    let after = std::fs::metadata(&log_path)?.len();
    println!("   log size: {before} -> {after} bytes");

    std::fs::remove_dir_all(&config.data_dir).ok();
    Ok(())
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}
