//! Worker thread management
//!
//! Each worker is an OS thread bound to one scheduling group. It runs on
//! its master fiber, pulling ready fibers and switching into them until
//! its group is stopped and no live fiber remains.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rfiber_core::{kdebug, kerror, kprint, WorkerError};

use crate::entity::{set_up_master_fiber_entity, tear_down_master_fiber_entity};
use crate::group::SchedulingGroup;
use crate::tls;

/// Worker threads of every group of a scheduler
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers()` threads for each group
    ///
    /// On failure the groups are stopped and the workers already running
    /// are joined before the error is returned.
    pub fn start(groups: &Arc<[SchedulingGroup]>) -> Result<Self, WorkerError> {
        let mut pool = WorkerPool { handles: Vec::new() };

        for group in groups.iter() {
            for index in 0..group.num_workers() {
                let worker_groups = Arc::clone(groups);
                let group_index = group.index();
                let spawned = thread::Builder::new()
                    .name(format!("rfiber-g{}-w{}", group_index, index))
                    .spawn(move || worker_main_loop(&worker_groups, group_index, index));

                match spawned {
                    Ok(handle) => pool.handles.push(handle),
                    Err(e) => {
                        kerror!("failed to spawn worker {}.{}: {}", group_index, index, e);
                        groups.iter().for_each(SchedulingGroup::stop);
                        let _ = pool.join();
                        return Err(WorkerError::SpawnFailed);
                    }
                }
            }
        }
        Ok(pool)
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Wait for all workers to finish
    pub fn join(self) -> Result<(), WorkerError> {
        let mut result = Ok(());
        for handle in self.handles {
            if handle.join().is_err() {
                result = Err(WorkerError::Panicked);
            }
        }
        result
    }
}

/// Main worker loop
fn worker_main_loop(groups: &[SchedulingGroup], group_index: usize, index: usize) {
    let group = &groups[group_index];
    kprint::set_worker_tag(group_index, index);
    tls::set_worker(group, index);
    set_up_master_fiber_entity();
    kdebug!("started");

    let spin_limit = group.idle_spins();
    let mut idle_spins: u32 = 0;

    loop {
        if let Some(fiber) = group.acquire_fiber(index, groups) {
            idle_spins = 0;
            group.run_fiber(fiber);
            continue;
        }

        if group.should_exit() {
            break;
        }

        if idle_spins < spin_limit {
            idle_spins += 1;
            for _ in 0..32 {
                std::hint::spin_loop();
            }
            thread::yield_now();
            continue;
        }

        // Register first, then look again: a fiber readied in between
        // bumps the epoch and the park below returns at once
        let parking = group.parking();
        let token = parking.prepare_park();
        if let Some(fiber) = group.acquire_fiber(index, groups) {
            parking.cancel_park();
            idle_spins = 0;
            group.run_fiber(fiber);
            continue;
        }
        if group.should_exit() {
            parking.cancel_park();
            break;
        }
        parking.park(token, Some(group.park_timeout()));
        idle_spins = 0;
    }

    kdebug!("exiting");
    tear_down_master_fiber_entity();
    tls::clear_worker();
    kprint::clear_worker_tag();
}
