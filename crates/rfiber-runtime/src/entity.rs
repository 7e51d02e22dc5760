//! Fiber control block and context switching
//!
//! A fiber's control block lives in the top page of its own stack:
//!
//! ```text
//!   top page:  | "RFIBER_FIBER_ENTITY" (64 bytes) | FiberEntity ... |
//!              ^ initial stack pointer (stack grows down from here)
//! ```
//!
//! so creating a fiber costs one stack allocation and nothing else.
//! Master fibers (one per worker thread, standing for the worker's own
//! stack) are plain heap allocations.
//!
//! Most mutable fields are only touched by whichever context currently
//! owns the fiber: the fiber itself while it runs, or the worker that
//! holds its `scheduler_lock` while it is suspended.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rfiber_core::{impl_doubly_linked, kerror, ktrace};
use rfiber_core::{DoublyLinkedListEntry, ErasedPtr, FiberLocalStorage};
use rfiber_core::{FiberId, FiberResult, FiberState, SpinLock};

use crate::arch::{init_context, switch_context, SavedContext};
use crate::barrier::ExitBarrier;
use crate::group::SchedulingGroup;
use crate::memory::{self, Stack};
use crate::sanitizer::SanitizerContext;
use crate::tls;

/// Written into a fiber's control block the first time it runs
pub const EVER_STARTED_MAGIC: u64 = 0x1122_3344_ABAB_BBAA;

/// Marker at the start of a fiber's top page
pub const FIBER_ENTITY_MAGIC: &[u8] = b"RFIBER_FIBER_ENTITY";

/// Bytes reserved for the marker in front of the control block
const MAGIC_AREA_SIZE: usize = 64;

// The control block and its marker must fit into the smallest page size
const _: () = assert!(mem::size_of::<FiberEntity>() + MAGIC_AREA_SIZE <= 4096);
const _: () = assert!(mem::align_of::<FiberEntity>() <= MAGIC_AREA_SIZE);

static FIBER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Number of fibers alive in the process, master fibers excluded
pub fn fiber_count() -> usize {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Everything needed to create a fiber
pub struct FiberDesc {
    /// Entry closure
    pub start_proc: Box<dyn FnOnce() + Send>,
    /// Stack size; `None` takes the group's default (pooled) size
    pub stack_size: Option<usize>,
    /// Never run by workers of another group
    pub scheduling_group_local: bool,
    /// Privileged reactor fiber, never run by workers of another group
    pub is_fiber_reactor: bool,
    /// Counted down once the entry closure returned
    pub exit_barrier: Option<Arc<ExitBarrier>>,
}

impl FiberDesc {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        FiberDesc {
            start_proc: Box::new(f),
            stack_size: None,
            scheduling_group_local: false,
            is_fiber_reactor: false,
            exit_barrier: None,
        }
    }
}

impl fmt::Debug for FiberDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberDesc")
            .field("stack_size", &self.stack_size)
            .field("scheduling_group_local", &self.scheduling_group_local)
            .field("is_fiber_reactor", &self.is_fiber_reactor)
            .field("exit_barrier", &self.exit_barrier.is_some())
            .finish()
    }
}

/// Per-fiber control block
pub struct FiberEntity {
    chain: DoublyLinkedListEntry,
    debugging_fiber_id: FiberId,
    ever_started_magic: AtomicU64,

    /// Transition lock; the state can only change while it is held
    scheduler_lock: SpinLock<FiberState>,

    /// Group the fiber was last readied into
    scheduling_group: AtomicPtr<SchedulingGroup>,
    /// Group that created the fiber and counts it as live
    home_group: *const SchedulingGroup,
    scheduling_group_local: bool,
    is_fiber_reactor: bool,
    last_ready_ns: AtomicU64,

    stack_base: *mut u8,
    stack_size: usize,
    is_from_system: bool,

    state_save_area: UnsafeCell<SavedContext>,
    resume_proc: UnsafeCell<Option<Box<dyn FnOnce()>>>,
    exit_barrier: UnsafeCell<Option<Arc<ExitBarrier>>>,
    start_proc: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    fls: UnsafeCell<FiberLocalStorage>,
    sanitizer: SanitizerContext,
}

impl_doubly_linked!(FiberEntity, chain);

// Safety: the interior-mutable fields are accessed either by the running
// fiber or by the holder of `scheduler_lock`, never both at once.
unsafe impl Send for FiberEntity {}
unsafe impl Sync for FiberEntity {}

impl FiberEntity {
    #[inline]
    pub fn id(&self) -> FiberId {
        self.debugging_fiber_id
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        self.stack_base.is_null()
    }

    #[inline]
    pub fn ever_started(&self) -> bool {
        self.ever_started_magic.load(Ordering::Relaxed) == EVER_STARTED_MAGIC
    }

    #[inline]
    pub fn scheduler_lock(&self) -> &SpinLock<FiberState> {
        &self.scheduler_lock
    }

    /// Current state (takes the transition lock)
    pub fn state(&self) -> FiberState {
        *self.scheduler_lock.lock()
    }

    /// Group the fiber was last readied into
    #[inline]
    pub fn scheduling_group(&self) -> Option<&SchedulingGroup> {
        // Safety: groups outlive every fiber they have seen
        unsafe { self.scheduling_group.load(Ordering::Acquire).as_ref() }
    }

    #[inline]
    pub(crate) fn set_scheduling_group(&self, group: &SchedulingGroup) {
        self.scheduling_group
            .store(group as *const SchedulingGroup as *mut _, Ordering::Release);
    }

    #[inline]
    pub fn is_scheduling_group_local(&self) -> bool {
        self.scheduling_group_local
    }

    #[inline]
    pub fn is_fiber_reactor(&self) -> bool {
        self.is_fiber_reactor
    }

    /// Monotonic timestamp of the last time the fiber was made ready
    #[inline]
    pub fn last_ready_ns(&self) -> u64 {
        self.last_ready_ns.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_last_ready_ns(&self, ns: u64) {
        self.last_ready_ns.store(ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Highest usable stack address, where the fiber's stack pointer starts
    ///
    /// The stack grows down from here; the page from here up holds this
    /// control block. Null for master fibers, which run on their thread's
    /// stack.
    pub fn stack_top(&self) -> *mut u8 {
        if self.is_master() {
            return ptr::null_mut();
        }
        // Safety: stacks are at least two pages
        unsafe { self.stack_base.add(self.stack_size - memory::page_size()) }
    }

    /// Size of the stack below `stack_top()`, including the guard page of
    /// pooled stacks
    pub fn stack_limit(&self) -> usize {
        if self.is_master() {
            return 0;
        }
        self.stack_size - memory::page_size()
    }

    /// Whether the stack came from the system allocator rather than the pool
    #[inline]
    pub fn is_from_system(&self) -> bool {
        self.is_from_system
    }

    /// Non-trivial fiber-local slot `index`
    ///
    /// # Safety
    ///
    /// Only the fiber itself may call this, while it runs.
    #[inline]
    pub unsafe fn get_fls(&self, index: usize) -> NonNull<ErasedPtr> {
        (*self.fls.get()).slot(index)
    }

    /// Trivial fiber-local slot `index`, zero until first written
    ///
    /// # Safety
    ///
    /// Only the fiber itself may call this, while it runs.
    #[inline]
    pub unsafe fn get_trivial_fls(&self, index: usize) -> &Cell<u64> {
        (*self.fls.get()).trivial_slot(index)
    }

    fn run_pending_resume_proc(&self) {
        // Safety: set by whoever resumed us, and we are the only runner now
        if let Some(proc_) = unsafe { (*self.resume_proc.get()).take() } {
            proc_();
        }
    }
}

impl fmt::Debug for FiberEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberEntity")
            .field("id", &self.debugging_fiber_id)
            .field("master", &self.is_master())
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a fiber's control block
///
/// Copyable and thread-safe. Validity is governed by the fiber's
/// lifecycle, not by the handle: once a fiber is freed its handles dangle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberPtr(NonNull<FiberEntity>);

// Safety: see FiberEntity
unsafe impl Send for FiberPtr {}
unsafe impl Sync for FiberPtr {}

impl Deref for FiberPtr {
    type Target = FiberEntity;

    #[inline]
    fn deref(&self) -> &FiberEntity {
        // Safety: handles are only used while the fiber is alive
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for FiberPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberPtr({:p}, {})", self.0.as_ptr(), self.id())
    }
}

impl FiberPtr {
    #[inline]
    pub fn as_ptr(self) -> *mut FiberEntity {
        self.0.as_ptr()
    }

    #[inline]
    pub fn as_non_null(self) -> NonNull<FiberEntity> {
        self.0
    }

    /// # Safety
    ///
    /// `ptr` must point to a live control block.
    #[inline]
    pub unsafe fn from_non_null(ptr: NonNull<FiberEntity>) -> Self {
        FiberPtr(ptr)
    }

    /// Switch from the calling fiber to `self`
    ///
    /// Returns when someone switches back. The caller is then the current
    /// fiber again and its pending resume action (if any) has run.
    ///
    /// # Safety
    ///
    /// `self` must be alive and suspended, and the caller must own its
    /// transition: its state was moved to `Running` under its scheduler
    /// lock, or the caller holds that lock on its behalf. No other thread
    /// may resume `self` until it switches away again.
    ///
    /// ```compile_fail
    /// fn run(fiber: rfiber_runtime::FiberPtr) {
    ///     fiber.resume();
    /// }
    /// ```
    pub unsafe fn resume(self) {
        let Some(caller) = tls::current_fiber() else {
            panic!("resume() called on a thread without a master fiber");
        };
        assert_ne!(caller, self, "a fiber cannot resume itself");

        caller.sanitizer.start_switch(&self.sanitizer);
        // Safety: `self` is suspended and owned by us (lock protocol), its
        // saved context is either fresh or from an earlier switch
        unsafe { switch_context(caller.state_save_area.get(), self.state_save_area.get()) };
        caller.sanitizer.finish_switch();

        // Possibly on another worker now
        tls::set_current_fiber(Some(caller));
        caller.run_pending_resume_proc();
    }

    /// Resume `self` and have it run `cb` before anything else
    ///
    /// `cb` runs on `self`'s stack after the switch, i.e. once the caller's
    /// context is fully saved.
    ///
    /// # Safety
    ///
    /// As for [`resume`](Self::resume).
    pub unsafe fn resume_on<F>(self, cb: F)
    where
        F: FnOnce() + 'static,
    {
        // `self` is suspended, nobody else touches its resume slot
        let slot = &mut *self.resume_proc.get();
        assert!(slot.is_none(), "fiber already has a pending resume action");
        *slot = Some(Box::new(cb));
        self.resume();
    }
}

/// Create a fiber in `group` from `desc`, in state `Ready`
///
/// The fiber is not queued anywhere yet.
pub(crate) fn instantiate_fiber_entity(group: &SchedulingGroup, desc: FiberDesc) -> FiberResult<FiberPtr> {
    let default_size = group.stack_size();
    let requested = desc.stack_size.unwrap_or(default_size);
    let stack = memory::allocate_stack(requested, requested == default_size)?;
    let top = stack.top_page();

    let id = FiberId::next();
    // Safety: the top page is ours and large enough for marker plus block
    let fiber = unsafe {
        ptr::write_bytes(top, 0, MAGIC_AREA_SIZE);
        ptr::copy_nonoverlapping(FIBER_ENTITY_MAGIC.as_ptr(), top, FIBER_ENTITY_MAGIC.len());

        let entity = top.add(MAGIC_AREA_SIZE).cast::<FiberEntity>();
        entity.write(FiberEntity {
            chain: DoublyLinkedListEntry::new(),
            debugging_fiber_id: id,
            ever_started_magic: AtomicU64::new(0),
            scheduler_lock: SpinLock::new(FiberState::Ready),
            scheduling_group: AtomicPtr::new(group as *const SchedulingGroup as *mut _),
            home_group: group,
            scheduling_group_local: desc.scheduling_group_local,
            is_fiber_reactor: desc.is_fiber_reactor,
            last_ready_ns: AtomicU64::new(0),
            stack_base: stack.base(),
            stack_size: stack.size(),
            is_from_system: stack.is_from_system(),
            state_save_area: UnsafeCell::new(SavedContext::default()),
            resume_proc: UnsafeCell::new(None),
            exit_barrier: UnsafeCell::new(desc.exit_barrier),
            start_proc: UnsafeCell::new(Some(desc.start_proc)),
            fls: UnsafeCell::new(FiberLocalStorage::new()),
            sanitizer: SanitizerContext::for_stack(stack.base(), top as usize - stack.base() as usize),
        });
        (*entity).chain.init();

        init_context(&mut *(*entity).state_save_area.get(), top, fiber_proc, entity as usize);
        FiberPtr(NonNull::new_unchecked(entity))
    };

    FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
    group.fiber_created();
    ktrace!("fiber {} created with a {} byte stack", id, stack.size());
    Ok(fiber)
}

/// Destroy a dead fiber and release its stack
///
/// # Safety
///
/// Must not run on the fiber's own stack, and no handle to the fiber may
/// be used afterwards.
pub unsafe fn free_fiber_entity(fiber: FiberPtr) {
    assert!(!fiber.is_master(), "master fibers are torn down, not freed");
    assert_eq!(fiber.state(), FiberState::Dead, "freeing a fiber that is not dead");

    let entity = fiber.as_ptr();
    let stack = Stack::from_raw_parts((*entity).stack_base, (*entity).stack_size, (*entity).is_from_system);
    let home = (*entity).home_group;

    ptr::drop_in_place(entity);
    memory::free_stack(stack);

    FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    if let Some(home) = home.as_ref() {
        home.fiber_freed();
    }
}

/// Entry point of every fiber, running on the fiber's own stack
unsafe extern "C" fn fiber_proc(arg: usize) {
    let fiber = FiberPtr(NonNull::new_unchecked(arg as *mut FiberEntity));
    tls::set_current_fiber(Some(fiber));
    fiber.sanitizer.finish_switch();
    fiber.ever_started_magic.store(EVER_STARTED_MAGIC, Ordering::Relaxed);

    // A dispatching fiber may have asked us to requeue it
    fiber.run_pending_resume_proc();

    let mut panicked = false;
    if let Some(start) = (*fiber.start_proc.get()).take() {
        if panic::catch_unwind(AssertUnwindSafe(start)).is_err() {
            kerror!("fiber {} panicked", fiber.id());
            panicked = true;
        }
    }

    // Locals may reference runtime facilities, drop them while we can
    (*fiber.fls.get()).clear();

    if let Some(barrier) = (*fiber.exit_barrier.get()).take() {
        barrier.count_down(panicked);
    }

    *fiber.scheduler_lock.lock() = FiberState::Dead;

    // Our stack is released by the master once we are off it
    let Some(master) = tls::master_fiber() else {
        panic!("fiber {} finished on a thread without a master fiber", fiber.id());
    };
    master.resume_on(move || free_fiber_entity(fiber));
    unreachable!("dead fiber {} was resumed", fiber.id());
}

/// Create the calling thread's master fiber and make it current
pub fn set_up_master_fiber_entity() -> FiberPtr {
    assert!(tls::master_fiber().is_none(), "thread already has a master fiber");

    let entity = Box::new(FiberEntity {
        chain: DoublyLinkedListEntry::new(),
        debugging_fiber_id: FiberId::MASTER,
        ever_started_magic: AtomicU64::new(EVER_STARTED_MAGIC),
        scheduler_lock: SpinLock::new(FiberState::Running),
        scheduling_group: AtomicPtr::new(ptr::null_mut()),
        home_group: ptr::null(),
        scheduling_group_local: true,
        is_fiber_reactor: false,
        last_ready_ns: AtomicU64::new(0),
        stack_base: ptr::null_mut(),
        stack_size: 0,
        is_from_system: true,
        state_save_area: UnsafeCell::new(SavedContext::default()),
        resume_proc: UnsafeCell::new(None),
        exit_barrier: UnsafeCell::new(None),
        start_proc: UnsafeCell::new(None),
        fls: UnsafeCell::new(FiberLocalStorage::new()),
        sanitizer: SanitizerContext::for_current_thread(),
    });
    entity.chain.init();

    let master = FiberPtr(NonNull::from(Box::leak(entity)));
    tls::set_master_fiber(Some(master));
    tls::set_current_fiber(Some(master));
    master
}

/// Destroy the calling thread's master fiber
///
/// Must be called on the master fiber itself.
pub fn tear_down_master_fiber_entity() {
    let Some(master) = tls::master_fiber() else {
        return;
    };
    assert_eq!(
        tls::current_fiber(),
        Some(master),
        "master fiber torn down from another fiber"
    );
    tls::set_master_fiber(None);
    tls::set_current_fiber(None);
    // Safety: allocated by set_up_master_fiber_entity and no longer current
    drop(unsafe { Box::from_raw(master.as_ptr()) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::sync::atomic::AtomicBool;

    fn test_group() -> SchedulingGroup {
        SchedulingGroup::new(0, &SchedulerConfig::new().workers_per_group(1), Default::default())
    }

    #[test]
    fn test_layout_limits() {
        assert!(mem::size_of::<FiberEntity>() + MAGIC_AREA_SIZE <= memory::page_size());
    }

    #[test]
    fn test_master_fiber_lifecycle() {
        std::thread::spawn(|| {
            let master = set_up_master_fiber_entity();
            assert!(master.is_master());
            assert!(master.stack_top().is_null());
            assert_eq!(master.stack_limit(), 0);
            assert!(master.ever_started());
            assert_eq!(tls::current_fiber(), Some(master));
            assert!(!tls::is_in_fiber());
            tear_down_master_fiber_entity();
            assert!(tls::master_fiber().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_instantiate_places_block_in_top_page() {
        let group = test_group();
        let fiber = instantiate_fiber_entity(&group, FiberDesc::new(|| {})).unwrap();
        let page = memory::page_size();
        let block = fiber.as_ptr() as usize;
        let top_page = block - MAGIC_AREA_SIZE;
        assert_eq!(top_page % page, 0);

        let magic = unsafe { std::slice::from_raw_parts(top_page as *const u8, FIBER_ENTITY_MAGIC.len()) };
        assert_eq!(magic, FIBER_ENTITY_MAGIC);
        assert_eq!(fiber.state(), FiberState::Ready);
        assert!(!fiber.ever_started());
        assert!(!fiber.is_from_system());
        assert!(!fiber.chain.is_linked());
        assert_eq!(group.live_fibers(), 1);

        assert_eq!(fiber.stack_top() as usize, top_page);
        assert_eq!(fiber.stack_limit(), fiber.stack_size() - page);
        assert_eq!(fiber.stack_top() as usize - fiber.stack_limit(), fiber.stack_base as usize);

        *fiber.scheduler_lock().lock() = FiberState::Dead;
        unsafe { free_fiber_entity(fiber) };
        assert_eq!(group.live_fibers(), 0);
    }

    #[test]
    fn test_custom_stack_size_uses_system_allocator() {
        let group = test_group();
        let mut desc = FiberDesc::new(|| {});
        desc.stack_size = Some(group.stack_size() * 2);
        let fiber = instantiate_fiber_entity(&group, desc).unwrap();
        assert!(fiber.is_from_system());
        assert_eq!(fiber.stack_size(), group.stack_size() * 2);
        assert_eq!(fiber.stack_limit(), group.stack_size() * 2 - memory::page_size());
        *fiber.scheduler_lock().lock() = FiberState::Dead;
        unsafe { free_fiber_entity(fiber) };
    }

    #[test]
    #[should_panic(expected = "not dead")]
    fn test_free_live_fiber_panics() {
        let group = test_group();
        let fiber = instantiate_fiber_entity(&group, FiberDesc::new(|| {})).unwrap();
        unsafe { free_fiber_entity(fiber) };
    }

    #[test]
    fn test_resume_runs_fiber_to_completion() {
        std::thread::spawn(|| {
            let group = test_group();
            let ran = Arc::new(AtomicBool::new(false));
            let barrier = Arc::new(ExitBarrier::new());

            let mut desc = FiberDesc::new({
                let ran = Arc::clone(&ran);
                move || ran.store(true, Ordering::SeqCst)
            });
            desc.exit_barrier = Some(Arc::clone(&barrier));

            let master = set_up_master_fiber_entity();
            let fiber = instantiate_fiber_entity(&group, desc).unwrap();
            *fiber.scheduler_lock().lock() = FiberState::Running;
            unsafe { fiber.resume() };

            // Back on the master: the fiber ran, died and was freed
            assert_eq!(tls::current_fiber(), Some(master));
            assert!(ran.load(Ordering::SeqCst));
            assert!(!barrier.wait());
            assert_eq!(group.live_fibers(), 0);
            tear_down_master_fiber_entity();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_panicking_fiber_reports_through_barrier() {
        std::thread::spawn(|| {
            let group = test_group();
            let barrier = Arc::new(ExitBarrier::new());
            let mut desc = FiberDesc::new(|| panic!("boom"));
            desc.exit_barrier = Some(Arc::clone(&barrier));

            set_up_master_fiber_entity();
            let fiber = instantiate_fiber_entity(&group, desc).unwrap();
            *fiber.scheduler_lock().lock() = FiberState::Running;
            unsafe { fiber.resume() };

            assert!(barrier.wait());
            tear_down_master_fiber_entity();
        })
        .join()
        .unwrap();
    }
}
