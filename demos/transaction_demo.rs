//! Concurrent transactions over shared pages, retried on deadlock

use pagevault::database::{Database, DatabaseConfig};
use pagevault::storage::PageStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const WORKERS: usize = 4;
const INCREMENTS: usize = 20;

fn counter(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn bump(data: &mut [u8]) {
    let next = counter(data) + 1;
    data[..4].copy_from_slice(&next.to_be_bytes());
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    println!("=== Transaction Demo ===\n");

    let config = DatabaseConfig {
        page_size: 64,
        cache_capacity: 4,
        ..DatabaseConfig::new("transaction_demo_data")
    };
    std::fs::remove_dir_all(&config.data_dir).ok();

    let db = Database::create(config.clone())?;
    let left = db.allocate_page(1)?;
    let right = db.allocate_page(1)?;
    let retries = AtomicUsize::new(0);

    println!("{WORKERS} workers each bump both counters {INCREMENTS} times.");
    println!("Half lock left-then-right, half right-then-left, so some deadlock.\n");

    thread::scope(|scope| -> anyhow::Result<()> {
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let (db, retries) = (&db, &retries);
                let order = if worker % 2 == 0 { [left, right] } else { [right, left] };
                scope.spawn(move || -> anyhow::Result<()> {
                    for _ in 0..INCREMENTS {
                        loop {
                            let txn = db.begin()?;
                            let result = order.iter().try_for_each(|page| txn.write(*page, bump));
                            match result {
                                Ok(()) => {
                                    txn.commit()?;
                                    break;
                                }
                                Err(e) if e.is_transient() => {
                                    println!("   worker {worker}: {e}; retrying");
                                    retries.fetch_add(1, Ordering::SeqCst);
                                    txn.abort()?;
                                }
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }
        Ok(())
    })?;

    let expected = (WORKERS * INCREMENTS) as u32;
    println!("\nleft counter:  {} (expected {expected})", counter(&db.store().read_page(left)?));
    println!("right counter: {} (expected {expected})", counter(&db.store().read_page(right)?));
    println!("transactions retried: {}", retries.load(Ordering::SeqCst));

    db.shutdown()?;
    std::fs::remove_dir_all(&config.data_dir).ok();
    Ok(())
}
