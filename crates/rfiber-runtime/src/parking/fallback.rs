//! Fallback parking using std::sync::Condvar
//!
//! Same event-count protocol as the futex version, with the epoch kept
//! under a mutex.

use super::WorkerParking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct FallbackParking {
    epoch: Mutex<u32>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn epoch(&self) -> MutexGuard<'_, u32> {
        // A panic while holding this lock cannot leave the counter torn
        self.epoch.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) -> bool {
        let mut epoch = self.epoch();
        *epoch = epoch.wrapping_add(1);
        self.parked.load(Ordering::SeqCst) != 0
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for FallbackParking {
    fn prepare_park(&self) -> u32 {
        self.parked.fetch_add(1, Ordering::SeqCst);
        *self.epoch()
    }

    fn cancel_park(&self) {
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    fn park(&self, token: u32, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut epoch = self.epoch();
        while *epoch == token {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    epoch = self
                        .condvar
                        .wait_timeout(epoch, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                None => {
                    epoch = self.condvar.wait(epoch).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        let moved = *epoch != token;
        drop(epoch);

        self.parked.fetch_sub(1, Ordering::SeqCst);
        moved
    }

    fn wake_one(&self) {
        if self.bump() {
            self.condvar.notify_one();
        }
    }

    fn wake_all(&self) {
        if self.bump() {
            self.condvar.notify_all();
        }
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
