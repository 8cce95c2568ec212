//! Osprey is a preemptive real-time kernel for single-processor
//! microcontrollers, providing prioritized scheduling with round-robin
//! tie-breaking, tick-based timeouts, and a family of blocking
//! synchronization and communication primitives.
//!
//! # Kernel trait types
//!
//! The kernel is instantiated by defining *a kernel trait type*: an empty
//! type implementing [`KernelCfg`] and the port traits ([`PortThreading`]
//! and [`PortTimer`]). All kernel state and all kernel objects are generic
//! over this type, so exactly one kernel instance exists per trait type.
//!
//! # Contexts
//!
//! Code executes in one of the following contexts:
//!
//!  - **Task context**: the context of a task, entered through the
//!    scheduler. Blocking services are only allowed here.
//!  - **Interrupt context**: the context of an interrupt handler. Services
//!    documented as interrupt-safe may be called here; they may make tasks
//!    Ready but return to the interrupted code, deferring the context switch
//!    to the interrupt epilogue.
//!  - **CPU Lock**: a state in which kernel-managed interrupts are masked.
//!    Every kernel service establishes it internally; a service called with
//!    CPU Lock already active fails with `BadContext`.
//!
//! # Priorities
//!
//! A priority is a `usize` less than
//! [`KernelCfg::NUM_TASK_PRIORITY_LEVELS`]. A numerically smaller value
//! means a *more urgent* priority. A task has a *base priority* (assigned at
//! activation and by [`TaskCb::set_priority`]) and an *effective priority*,
//! which may be temporarily raised by a mutex locking protocol.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "alloc")]
extern crate alloc;

use core::fmt;

pub mod error;
mod event;
mod fastmutex;
mod flag;
mod klock;
mod mempool;
mod mutex;
mod object;
mod semaphore;
mod state;
mod task;
mod timeout;
mod timer;
pub mod utils;
mod wait;

#[cfg(test)]
mod tests;

pub use self::{
    error::*,
    event::EventCb,
    fastmutex::FastMutexCb,
    flag::{FlagCb, FlagWaitMode},
    mempool::MemPoolCb,
    mutex::{MutexAttr, MutexCb},
    semaphore::{SemaphoreCb, SemaphoreValue},
    task::{readyqueue, StackRegion, TaskAttr, TaskCb},
    timeout::{TimeoutRef, MAX_DELAY},
    timer::TimerCb,
};

use self::utils::{binary_heap::VecLike, Init};

/// Unsigned integer type representing a tick count. The duration of a tick
/// is defined by the port timer driver.
pub type UTicks = u32;

/// A task priority. Numerically smaller values are more urgent.
pub type Priority = usize;

/// The word a wake-upper delivers to a woken task, returned from the
/// blocking call. The interpretation depends on the object waited on:
/// an event word, a flag pattern, or zero.
pub type WakeEvent = u32;

/// Bit patterns used by flag groups and task notification flags.
pub type FlagBits = u32;

/// Associates a kernel trait type with kernel-private configuration.
///
/// # Safety
///
/// `state()` must return the same instance for every call. Violating this
/// breaks the kernel's data-structure invariants.
pub unsafe trait KernelCfg: Sized + Send + Sync + 'static {
    /// The number of task priority levels. Valid priorities are
    /// `0..NUM_TASK_PRIORITY_LEVELS`.
    const NUM_TASK_PRIORITY_LEVELS: usize;

    /// The length of the time slice allotted to a task before it is required
    /// to yield to an equal-priority peer, measured in ticks. Zero disables
    /// round-robin scheduling.
    const TIME_SLICE: UTicks = 0;

    /// The task ready queue implementation.
    type TaskReadyQueue: readyqueue::Queue<Self>;

    /// The backing storage of the timeout heap. Must be able to hold an
    /// entry for every task and software timer that can be waiting at once.
    type TimeoutHeap: VecLike<Element = timeout::TimeoutRef<Self>>
        + Init
        + fmt::Debug
        + Send
        + Sync
        + 'static
    where
        Self: KernelTraits;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>
    where
        Self: PortThreading + PortTimer;
}

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: KernelCfg {
    /// Port-private per-task state, stored at the beginning of each task
    /// control block so that assembler code can refer to it easily.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// The default stack size for tasks.
    const STACK_DEFAULT_SIZE: usize = 1024;

    /// The alignment requirement for task stack regions.
    const STACK_ALIGN: usize = core::mem::size_of::<usize>();

    /// Transfer the control to the running task, discarding the current
    /// (startup) context.
    ///
    /// Precondition: CPU Lock active, Startup phase
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In a task context, this method immediately transfers the control to
    /// a dispatcher. The dispatcher should call
    /// [`PortToKernel::choose_running_task`] to find the next task to run and
    /// transfer the control to that task.
    ///
    /// In an interrupt context, the effect of this method is deferred until
    /// the processor completes the execution of all active interrupt
    /// handlers. Before the dispatcher has started (boot phase), the request
    /// is subsumed by `dispatch_first_task`.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running task (`task`, which might
    /// already have been removed from the set of schedulable tasks) and
    /// proceed to the dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !
    where
        Self: PortTimer;

    /// Disable all kernel-managed interrupts (this state is called *CPU
    /// Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Enter the CPU Lock state, returning `false` if it was already active.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Prepare the task for activation. More specifically, set the current
    /// program counter to the task trampoline and the current stack pointer
    /// to either end of [`TaskAttr::stack`], ensuring the task will start
    /// execution from its entry point next time the task receives the
    /// control.
    ///
    /// The task trampoline must invoke the entry point in a loop so that a
    /// returning entry point is simply re-entered; an explicit
    /// [`Kernel::exit_task`] is the only way to leave the loop.
    ///
    /// Precondition: CPU Lock active, the task is in the Dormant state
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>)
    where
        Self: PortTimer;

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;
}

/// Implemented by a port. This trait contains items related to controlling
/// a system timer.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub trait PortTimer {
    /// The maximum value that [`tick_count`] can return. Must be greater
    /// than zero.
    ///
    /// [`tick_count`]: Self::tick_count
    const MAX_TICK_COUNT: UTicks;

    /// The maximum value that can be passed to [`pend_tick_after`]. Must be
    /// greater than zero.
    ///
    /// This value should be somewhat smaller than `MAX_TICK_COUNT`. The
    /// difference determines the kernel's resilience against overdue timer
    /// interrupts.
    ///
    /// [`pend_tick_after`]: Self::pend_tick_after
    const MAX_TIMEOUT: UTicks;

    /// Read the current tick count (timer value).
    ///
    /// This value steadily increases over time. When it goes past
    /// `MAX_TICK_COUNT`, it wraps around to zero.
    ///
    /// Precondition: CPU Lock active
    unsafe fn tick_count() -> UTicks;

    /// Indicate that `tick_count_delta` ticks may elapse before the kernel
    /// should receive a call to [`PortToKernel::timer_tick`].
    ///
    /// It's legal to ignore the calls to this method entirely and call
    /// `timer_tick` at a steady rate ("tickful" operation). The default
    /// implementation does nothing, assuming the driver is implemented that
    /// way.
    ///
    /// `tick_count_delta` must be in range `1..=MAX_TIMEOUT`.
    ///
    /// Precondition: CPU Lock active
    unsafe fn pend_tick_after(tick_count_delta: UTicks) {
        let _ = tick_count_delta;
    }

    /// Pend a call to [`PortToKernel::timer_tick`] as soon as possible.
    ///
    /// Precondition: CPU Lock active
    unsafe fn pend_tick() {
        // Safety: Just forwarding the call
        unsafe { Self::pend_tick_after(1) };
    }
}

/// Represents a particular group of traits that a port should implement.
pub trait Port: PortThreading + PortTimer {}

impl<T: PortThreading + PortTimer> Port for T {}

/// The complete set of traits the kernel code is generic over. Automatically
/// implemented on every kernel trait type.
pub trait KernelTraits: Port {}

impl<T: Port> KernelTraits for T {}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Initialize the runtime structures and start the first task.
    ///
    /// Should be called exactly once by the port after the startup code has
    /// activated the initial task set.
    ///
    /// Precondition: CPU Lock active, Boot phase
    unsafe fn boot() -> !;

    /// Determine the next task to run and update the running task.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Called by a port timer driver to announce the progress of time.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Self>() };

        // Initialize the timekeeping system
        Traits::state().timeout.init(lock.borrow_mut());

        // Choose the first task to run
        task::choose_next_running_task(lock.borrow_mut());

        core::mem::forget(lock);

        // Safety: CPU Lock is active, Startup phase
        unsafe { Self::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Self>() };

        task::choose_next_running_task(lock.borrow_mut());

        // Post-condition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Self>();
    }
}

/// Provides access to the global API functions exposed by the kernel.
///
/// This trait is automatically implemented on every kernel trait type.
pub trait Kernel: Port + Sized + 'static {
    /// Activate CPU Lock.
    ///
    /// Returns `BadContext` if CPU Lock is already active.
    fn acquire_cpu_lock() -> Result<(), CpuLockError>;

    /// Deactivate CPU Lock.
    ///
    /// Returns `BadContext` if CPU Lock is already inactive.
    ///
    /// # Safety
    ///
    /// CPU Lock is useful for creating a critical section. By making this
    /// method `unsafe`, safe code is prevented from interfering with a
    /// critical section.
    unsafe fn release_cpu_lock() -> Result<(), CpuLockError>;

    /// Return a flag indicating whether CPU Lock is currently active.
    fn has_cpu_lock() -> bool;

    /// Get the currently running task.
    fn current_task() -> Result<&'static TaskCb<Self>, GetCurrentTaskError>;

    /// Relinquish the processor in favor of the longest-waiting Ready task
    /// of the running task's effective priority.
    fn yield_now() -> Result<(), YieldError>;

    /// Block the current task for the specified duration.
    fn sleep_for(delay: UTicks) -> Result<(), SleepError>;

    /// Block the current task until the specified absolute tick. A tick in
    /// the past (more precisely, not strictly within the next [`MAX_DELAY`]
    /// ticks) completes immediately.
    fn sleep_until(tick: UTicks) -> Result<(), SleepError>;

    /// Block the current task until `delay` ticks after its previous wake-up
    /// time, so that a periodic task does not accumulate drift.
    fn sleep_next(delay: UTicks) -> Result<(), SleepError>;

    /// Block the current task indefinitely. Only
    /// [`TaskCb::terminate`] can end such a sleep.
    fn sleep() -> Result<(), SleepError>;

    /// Wait until all the specified notification flags are delivered to the
    /// current task by [`TaskCb::give_flags`]. Returns the accumulated
    /// flags.
    fn wait_flags(flags: FlagBits) -> Result<FlagBits, WaitError>;

    /// [`wait_flags`](Self::wait_flags) with a timeout.
    fn wait_flags_for(flags: FlagBits, delay: UTicks) -> Result<FlagBits, WaitTimeoutError>;

    /// Terminate the current task, putting it into the Dormant state.
    ///
    /// # Safety
    ///
    /// On a successful call, this function destroys the current task's stack
    /// without running any destructors on stack-allocated objects and
    /// renders all references pointing to such objects invalid. The caller
    /// is responsible for ensuring this doesn't lead to undefined behavior.
    ///
    /// This function must be called from a task context with CPU Lock
    /// inactive; anything else is a precondition violation caught by an
    /// assertion.
    unsafe fn exit_task() -> !;
}

impl<Traits: KernelTraits> Kernel for Traits {
    fn acquire_cpu_lock() -> Result<(), CpuLockError> {
        if Self::is_cpu_lock_active() {
            Err(CpuLockError::BadContext)
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            Ok(())
        }
    }

    unsafe fn release_cpu_lock() -> Result<(), CpuLockError> {
        if !Self::is_cpu_lock_active() {
            Err(CpuLockError::BadContext)
        } else {
            // Safety: CPU Lock active
            unsafe { Self::leave_cpu_lock() };
            Ok(())
        }
    }

    fn has_cpu_lock() -> bool {
        Self::is_cpu_lock_active()
    }

    fn current_task() -> Result<&'static TaskCb<Self>, GetCurrentTaskError> {
        task::current_task::<Self>()
    }

    fn yield_now() -> Result<(), YieldError> {
        task::yield_current_task::<Self>()
    }

    fn sleep_for(delay: UTicks) -> Result<(), SleepError> {
        task::put_current_task_on_sleep::<Self>(timeout::TimeoutArm::After(delay))
    }

    fn sleep_until(tick: UTicks) -> Result<(), SleepError> {
        task::put_current_task_on_sleep::<Self>(timeout::TimeoutArm::At(tick))
    }

    fn sleep_next(delay: UTicks) -> Result<(), SleepError> {
        task::put_current_task_on_sleep::<Self>(timeout::TimeoutArm::AfterPrevious(delay))
    }

    fn sleep() -> Result<(), SleepError> {
        task::put_current_task_on_sleep_forever::<Self>()
    }

    fn wait_flags(flags: FlagBits) -> Result<FlagBits, WaitError> {
        task::wait_flags::<Self>(flags, None).map_err(|e| match e {
            WaitTimeoutError::BadContext => WaitError::BadContext,
            WaitTimeoutError::Stopped => WaitError::Stopped,
            // No timeout was registered
            WaitTimeoutError::Timeout | WaitTimeoutError::BadParam => unreachable!(),
        })
    }

    fn wait_flags_for(flags: FlagBits, delay: UTicks) -> Result<FlagBits, WaitTimeoutError> {
        task::wait_flags::<Self>(flags, Some(delay))
    }

    unsafe fn exit_task() -> ! {
        // Safety: Just forwarding the function call
        unsafe { task::exit_current_task::<Self>() }
    }
}

/// Global kernel state.
///
/// The application provides the storage (one instance per kernel trait
/// type) and hands it to the kernel through [`KernelCfg::state`].
pub struct State<Traits: KernelCfg + PortThreading + PortTimer> {
    /// The currently running task. `None` during the boot phase and while
    /// the processor is idle.
    running_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The task ready queue.
    task_ready_queue: Traits::TaskReadyQueue,

    /// The global state of the timekeeping system.
    timeout: timeout::TimeoutGlobals<Traits, Traits::TimeoutHeap>,
}

impl<Traits: KernelCfg + PortThreading + PortTimer> Init for State<Traits> {
    const INIT: Self = Self {
        running_task: Init::INIT,
        task_ready_queue: Init::INIT,
        timeout: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field(
                "running_task",
                &self
                    .running_task
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("task_ready_queue", &self.task_ready_queue)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<Traits: KernelCfg + PortThreading + PortTimer> State<Traits> {
    /// Get the currently running task.
    pub(crate) fn running_task(
        &self,
        lock: &klock::CpuLockToken<Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.running_task.get(lock)
    }
}
