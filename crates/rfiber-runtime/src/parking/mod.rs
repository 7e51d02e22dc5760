//! Worker parking
//!
//! Idle workers sleep on an event count so that a wake issued between
//! "I found no work" and "I am asleep" is never lost:
//!
//! ```text
//!   worker                         waker
//!   token = prepare_park()         push work
//!   re-check queues                wake_one() / wake_all()
//!     found work -> cancel_park()    (bumps the epoch, then wakes
//!     none       -> park(token)       sleepers if any are registered)
//! ```
//!
//! `park` returns immediately if the epoch moved since `prepare_park`.

use std::time::Duration;

/// Event-count style sleep/wake for idle workers
pub trait WorkerParking: Send + Sync {
    /// Register as a prospective sleeper and snapshot the epoch
    ///
    /// Must be followed by exactly one `cancel_park` or `park`.
    fn prepare_park(&self) -> u32;

    /// Withdraw a `prepare_park` without sleeping
    fn cancel_park(&self);

    /// Sleep until the epoch differs from `token`, or until `timeout`
    ///
    /// Returns `true` if the epoch moved. Callers re-check for work either way.
    fn park(&self, token: u32, timeout: Option<Duration>) -> bool;

    /// Bump the epoch and wake one sleeper, if any
    fn wake_one(&self);

    /// Bump the epoch and wake every sleeper
    fn wake_all(&self);

    /// Number of registered sleepers (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Create the platform's parking implementation
pub fn new_parking() -> Box<dyn WorkerParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = new_parking();
        let token = parking.prepare_park();
        let start = Instant::now();
        let woken = parking.park(token, Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(parking.parked_count(), 0);
    }

    #[test]
    fn test_wake_before_park_is_not_lost() {
        let parking = new_parking();
        let token = parking.prepare_park();
        parking.wake_one();

        let start = Instant::now();
        assert!(parking.park(token, Some(Duration::from_secs(10))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_park() {
        let parking = new_parking();
        parking.prepare_park();
        assert_eq!(parking.parked_count(), 1);
        parking.cancel_park();
        assert_eq!(parking.parked_count(), 0);
    }

    #[test]
    fn test_wake_one_parked_thread() {
        let parking: Arc<dyn WorkerParking> = Arc::new(PlatformParking::new());
        let done = Arc::new(AtomicBool::new(false));

        let handle = {
            let parking = Arc::clone(&parking);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let token = parking.prepare_park();
                    if done.load(Ordering::Acquire) {
                        parking.cancel_park();
                        break;
                    }
                    parking.park(token, Some(Duration::from_secs(10)));
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        done.store(true, Ordering::Release);
        parking.wake_one();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wake_all() {
        let parking: Arc<dyn WorkerParking> = Arc::new(PlatformParking::new());
        let done = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let parking = Arc::clone(&parking);
                let done = Arc::clone(&done);
                thread::spawn(move || loop {
                    let token = parking.prepare_park();
                    if done.load(Ordering::Acquire) {
                        parking.cancel_park();
                        return;
                    }
                    parking.park(token, Some(Duration::from_secs(10)));
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        done.store(true, Ordering::Release);
        parking.wake_all();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
