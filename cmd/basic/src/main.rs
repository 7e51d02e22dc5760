//! Basic rfiber example
//!
//! Spawns a few fibers across two scheduling groups, joins them from a
//! fiber, and shows fiber-local storage.
//!
//! # Environment Variables
//!
//! - `RFB_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `RFB_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::cell::Cell;

use rfiber::{kdebug, kinfo, spawn, yield_now, Builder, FiberLocal, Launch, Runtime, SchedulerConfig};

static STEPS: FiberLocal<Cell<u32>> = FiberLocal::new(|| Cell::new(0));

// RFB_LOG_LEVEL=debug RFB_FLUSH_EPRINT=1 cargo run -p rfiber-basic
fn main() {
    println!("=== rfiber Basic Example ===\n");
    rfiber::init_logging();

    let config = SchedulerConfig::default()
        .num_groups(2)
        .workers_per_group(2)
        .debug_logging(true);

    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let total = runtime.block_on(|| {
        kinfo!("Spawning fibers...");

        let mut fibers = Vec::new();
        for i in 1..=3u32 {
            let fiber = spawn(move || {
                kdebug!("[fiber {}] started", i);
                for j in 0..3 {
                    STEPS.with(|s| s.set(s.get() + 1));
                    kdebug!("[fiber {}] iteration {}", i, j);
                    yield_now();
                }
                kdebug!("[fiber {}] finished", i);
                STEPS.with(|s| s.get()) * i
            });
            println!("Spawned fiber {} (ID={})", i, fiber.id());
            fibers.push(fiber);
        }

        // Runs before this fiber gets back control
        let eager = Builder::new()
            .launch(Launch::Dispatch)
            .spawn(|| {
                kdebug!("[eager] running");
                100
            })
            .map(|f| f.join().unwrap_or(0))
            .unwrap_or(0);

        fibers.into_iter().map(|f| f.join().unwrap_or(0)).sum::<u32>() + eager
    });

    match total {
        Ok(total) => println!("\nSum of results: {} (expected 118)", total),
        Err(e) => println!("\nblock_on failed: {}", e),
    }
    println!("Fibers still alive: {}", rfiber::fiber_count());

    if let Err(e) = runtime.shutdown() {
        eprintln!("shutdown failed: {}", e);
    }
    println!("\n=== Example Complete ===");
}
