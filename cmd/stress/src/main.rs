//! Stress test - many fibers
//!
//! Spawns a large number of yielding fibers from the main thread and
//! waits for all of them.
//!
//! Usage: `stress [num_fibers] [yields_per_fiber]`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rfiber::{yield_now, Runtime, SchedulerConfig};

fn main() {
    println!("=== rfiber Stress Test ===\n");
    rfiber::init_logging();

    let mut args = std::env::args().skip(1);
    let num_fibers: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let yields: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    let config = SchedulerConfig::default();
    println!(
        "Spawning {} fibers ({} groups x {} workers, {} yields each)...",
        num_fibers, config.num_groups, config.workers_per_group, yields
    );

    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    for i in 0..num_fibers {
        let completed = Arc::clone(&completed);
        runtime
            .spawn(move || {
                for _ in 0..yields {
                    yield_now();
                }
                completed.fetch_add(1, Ordering::Relaxed);
            })
            .detach();

        if (i + 1) % 1000 == 0 {
            print!("\rSpawned: {}/{}", i + 1, num_fibers);
        }
    }

    let spawn_time = start.elapsed();
    println!("\n\nSpawn time: {:?}", spawn_time);
    println!(
        "Spawn rate: {:.0} fibers/sec",
        num_fibers as f64 / spawn_time.as_secs_f64()
    );

    println!("\nWaiting for completion...");
    let run_start = Instant::now();
    loop {
        let done = completed.load(Ordering::Relaxed) as usize;
        if done >= num_fibers {
            break;
        }
        if run_start.elapsed() > Duration::from_secs(30) {
            println!("\nTimeout! Only {}/{} completed", done, num_fibers);
            break;
        }
        print!("\rCompleted: {}/{}", done, num_fibers);
        std::thread::sleep(Duration::from_millis(100));
    }

    let total_time = start.elapsed();
    let switches = num_fibers as f64 * (yields as f64 + 1.0);

    println!("\n\n=== Results ===");
    println!("Total fibers:    {}", num_fibers);
    println!("Completed:       {}", completed.load(Ordering::Relaxed));
    println!("Spawn time:      {:?}", spawn_time);
    println!("Total time:      {:?}", total_time);
    println!(
        "Switch rate:     {:.0} switches/sec",
        switches / total_time.as_secs_f64()
    );

    if let Err(e) = runtime.shutdown() {
        eprintln!("shutdown failed: {}", e);
    }
    println!("Live fibers after shutdown: {}", rfiber::fiber_count());
}
