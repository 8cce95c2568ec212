//! A deterministic in-crate "port" and the helpers used to drive the kernel
//! state machine from the test thread.
//!
//! The mock port never performs a real context switch: `yield_cpu` elects
//! the next running task on the spot, and the test impersonates whichever
//! task the scheduler designates, entering kernel services on its behalf.
//! Blocking operations are driven through their non-spinning halves
//! (`start_wait` and friends), so a "blocked task" is simply a control block
//! in the Waiting state, and the test thread carries on as the next task.
use crate::{
    error::WaitAbort,
    klock,
    task::TaskCb,
    timeout, wait,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, StackRegion, WakeEvent,
};

/// A stack for tasks that are never actually executed.
pub(super) const NULL_STACK: StackRegion = unsafe { StackRegion::new(core::ptr::null_mut(), 0) };

/// An entry point for tasks that are never actually executed.
pub(super) fn noop_entry(_: usize) {}

/// Define a kernel trait type (`SystemTraits`), its global state, and the
/// mock port, all scoped to the enclosing test function.
macro_rules! define_system {
    () => {
        define_system!(TIME_SLICE = 0);
    };
    (TIME_SLICE = $slice:expr) => {
        use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

        struct SystemTraits;

        static STATE: $crate::State<SystemTraits> =
            <$crate::State<SystemTraits> as $crate::utils::Init>::INIT;
        static CPU_LOCK: AtomicBool = AtomicBool::new(false);
        static TICK_COUNT: AtomicU32 = AtomicU32::new(0);

        unsafe impl $crate::KernelCfg for SystemTraits {
            const NUM_TASK_PRIORITY_LEVELS: usize = 16;
            const TIME_SLICE: $crate::UTicks = $slice;
            type TaskReadyQueue = $crate::readyqueue::BitmapQueue<
                SystemTraits,
                $crate::utils::OneLevelBitmap<u16>,
                16,
            >;
            type TimeoutHeap = arrayvec::ArrayVec<$crate::TimeoutRef<SystemTraits>, 32>;

            fn state() -> &'static $crate::State<SystemTraits> {
                &STATE
            }
        }

        unsafe impl $crate::PortThreading for SystemTraits {
            type PortTaskState = ();

            unsafe fn dispatch_first_task() -> ! {
                unreachable!("dispatch_first_task");
            }

            unsafe fn yield_cpu() {
                // The deterministic dispatcher: elect the next running task
                // on the spot
                assert!(!<SystemTraits as $crate::PortThreading>::is_cpu_lock_active());
                CPU_LOCK.store(true, Ordering::Relaxed);
                unsafe { <SystemTraits as $crate::PortToKernel>::choose_running_task() };
                CPU_LOCK.store(false, Ordering::Relaxed);
            }

            unsafe fn exit_and_dispatch(_task: &'static $crate::TaskCb<SystemTraits>) -> ! {
                CPU_LOCK.store(false, Ordering::Relaxed);
                panic!("exit_and_dispatch");
            }

            unsafe fn enter_cpu_lock() {
                assert!(!CPU_LOCK.swap(true, Ordering::Relaxed));
            }

            unsafe fn leave_cpu_lock() {
                assert!(CPU_LOCK.swap(false, Ordering::Relaxed));
            }

            unsafe fn initialize_task_state(_task: &'static $crate::TaskCb<SystemTraits>) {}

            fn is_cpu_lock_active() -> bool {
                CPU_LOCK.load(Ordering::Relaxed)
            }

            fn is_task_context() -> bool {
                true
            }
        }

        impl $crate::PortTimer for SystemTraits {
            const MAX_TICK_COUNT: $crate::UTicks = u32::MAX;
            const MAX_TIMEOUT: $crate::UTicks = 1 << 30;

            unsafe fn tick_count() -> $crate::UTicks {
                TICK_COUNT.load(Ordering::Relaxed)
            }
        }

        /// Advance the tick counter and announce the progress of time, as a
        /// tickful timer driver would.
        #[allow(dead_code)]
        fn advance_time(ticks: $crate::UTicks) {
            TICK_COUNT.fetch_add(ticks, Ordering::Relaxed);
            unsafe { <SystemTraits as $crate::PortToKernel>::timer_tick() };
        }

        /// Overwrite the tick counter. Only meaningful before the kernel is
        /// started.
        #[allow(dead_code)]
        fn preset_tick(value: $crate::UTicks) {
            TICK_COUNT.store(value, Ordering::Relaxed);
        }
    };
}

pub(super) use define_system;

/// Initialize the timekeeping system and elect the first running task,
/// like `PortToKernel::boot` minus the dispatch.
pub(super) fn start_kernel<Traits: KernelTraits>() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    Traits::state().timeout.init(lock.borrow_mut());
    crate::task::choose_next_running_task(lock.borrow_mut());

    log::trace!(
        "kernel started, running task = {:?}",
        Traits::state().running_task(&lock).map(|t| t as *const _)
    );
}

/// Run a closure with CPU Lock held.
pub(super) fn with_lock<Traits: KernelTraits, R>(
    f: impl FnOnce(&mut klock::CpuLockGuard<Traits>) -> R,
) -> R {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    f(&mut lock)
}

/// Get the currently running task.
pub(super) fn current<Traits: KernelTraits>() -> Option<&'static TaskCb<Traits>> {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    Traits::state().running_task(&lock)
}

pub(super) fn assert_current<Traits: KernelTraits>(task: &'static TaskCb<Traits>) {
    let running = current::<Traits>().expect("no running task");
    assert!(
        core::ptr::eq(running, task),
        "expected {:p} to be running, but {:p} is",
        task,
        running
    );
}

/// Re-run the scheduling decision.
pub(super) fn dispatch<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    crate::task::choose_next_running_task(lock.borrow_mut());
}

/// Read the result of the task's last completed wait.
pub(super) fn wait_result<Traits: KernelTraits>(
    task: &'static TaskCb<Traits>,
) -> Result<WakeEvent, WaitAbort> {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    wait::wait_result_of(&lock, task)
}

/// On behalf of the currently running task: register a wait on `queue` and
/// hand the processor over, exactly as the blocking half of a wait service
/// would before spinning.
pub(super) fn block_current_on_queue<Traits: KernelTraits>(
    queue: &'static WaitQueue<Traits>,
    payload: WaitPayload<Traits>,
    timeout32: Option<u32>,
) {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    match timeout32 {
        None => queue.start_wait(lock.borrow_mut(), payload),
        Some(time32) => queue.start_wait_timeout(lock.borrow_mut(), payload, time32),
    }
    crate::task::choose_next_running_task(lock.borrow_mut());
}

/// On behalf of the currently running task: go to sleep for `delay` ticks.
pub(super) fn block_current_sleep<Traits: KernelTraits>(delay: u32) {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let task = Traits::state().running_task(&lock).unwrap();

    wait::start_wait_no_queue(lock.borrow_mut(), WaitPayload::Sleep);
    task.timeout.set_expiration_after(lock.borrow_mut(), delay);
    timeout::insert_timeout(lock.borrow_mut(), task.timeout_ref());

    crate::task::choose_next_running_task(lock.borrow_mut());
}

/// On behalf of the currently running task: start acquiring the mutex.
/// Returns `true` if the mutex was acquired immediately; otherwise the task
/// is now blocked on it and the next task has been elected.
pub(super) fn begin_lock_mutex<Traits: KernelTraits>(
    mutex: &'static crate::MutexCb<Traits>,
    timeout32: Option<u32>,
) -> bool {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    match crate::mutex::lock_mutex_begin(mutex, lock.borrow_mut(), timeout32).unwrap() {
        crate::mutex::MutexPoll::Acquired | crate::mutex::MutexPoll::Recursive => true,
        crate::mutex::MutexPoll::Timeout => panic!("unexpected immediate timeout"),
        crate::mutex::MutexPoll::Blocked => {
            crate::task::choose_next_running_task(lock.borrow_mut());
            false
        }
    }
}
