//! Tasks
use core::{fmt, mem::ManuallyDrop};

use crate::{
    error::{
        ActivateTaskError, DetachTaskError, GetCurrentTaskError, GetTaskPriorityError,
        GiveFlagsError, JoinTaskError, ResumeTaskError, SetTaskPriorityError, SleepError,
        SuspendTaskError, TerminateTaskError, WaitAbort, WaitTimeoutError, YieldError,
    },
    klock, mutex, object, state,
    timeout::{self, Timeout, TimeoutArm},
    wait::{self, QueueOrder, TaskWait, WaitPayload, WaitQueue},
    utils::Init,
    FlagBits, KernelCfg, KernelTraits, Priority, UTicks, WakeEvent,
};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::Queue as _;

#[cfg(feature = "alloc")]
use crate::error::CreateError;

/// A task's stack region.
///
/// The kernel never accesses the region itself; it is passed to
/// [`PortThreading::initialize_task_state`] to fabricate the initial context.
///
/// [`PortThreading::initialize_task_state`]: crate::PortThreading::initialize_task_state
#[derive(Clone, Copy)]
pub struct StackRegion {
    ptr: *mut u8,
    len: usize,
}

// Safety: Safe code can't access the pointee. The port is responsible for
// using the region in the correct way.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// Construct a `StackRegion` from a raw pointer and a length.
    ///
    /// # Safety
    ///
    /// The region must be valid for the whole lifetime of the task using it
    /// and must not be used for any other purpose.
    pub const unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Get a raw pointer to the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StackRegion({:p}, {})", self.ptr, self.len)
    }
}

/// The static properties of a task.
pub struct TaskAttr {
    /// The entry point of the task.
    ///
    /// The port's task trampoline invokes this function in a loop, so a
    /// returning entry point is simply restarted. An explicit
    /// [`Kernel::exit_task`](crate::Kernel::exit_task) is the only way to
    /// leave the loop.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The stack region for the task.
    pub stack: StackRegion,

    /// The initial base priority of the task.
    pub priority: Priority,
}

impl TaskAttr {
    pub const fn new(
        entry_point: fn(usize),
        entry_param: usize,
        stack: StackRegion,
        priority: Priority,
    ) -> Self {
        Self {
            entry_point,
            entry_param,
            stack,
            priority,
        }
    }
}

impl fmt::Debug for TaskAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &self.entry_point)
            .field("entry_param", &self.entry_param)
            .field("stack", &self.stack)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// The task is not schedulable. The initial state; also entered through
    /// task exit and termination.
    Dormant,

    Ready,

    /// The task is in the Running state.
    Running,

    /// The task is in the Waiting state: blocked on an object, sleeping, or
    /// suspended.
    Waiting,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// Whether a Dormant task's termination is observed by a `join` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Joinable,
    Detached,
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: KernelTraits> {
    /// Port-private state data.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembler code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    /// The static properties of the task.
    pub attr: &'static TaskAttr,

    /// The task's base priority.
    pub(crate) base_priority: klock::CpuLockCell<Traits, Priority>,

    /// The task's effective priority. It's calculated based on
    /// `base_priority` and may be temporarily elevated by a mutex locking
    /// protocol.
    ///
    /// The effective priority determines the task's position within the task
    /// ready queue and within priority-ordered wait queues. Use
    /// [`set_effective_priority`] to update it so the containing queue is
    /// re-sorted accordingly.
    pub(crate) effective_priority: klock::CpuLockCell<Traits, Priority>,

    pub(crate) st: klock::CpuLockCell<Traits, TaskSt>,

    /// The remaining portion of the task's time slice, in ticks.
    pub(crate) slice: klock::CpuLockCell<Traits, UTicks>,

    /// Allows `TaskCb` to participate in the ready queue's linked lists.
    pub(crate) ready_queue_data:
        <<Traits as KernelCfg>::TaskReadyQueue as readyqueue::Queue<Traits>>::PerTaskData,

    /// The wait state of the task.
    pub(crate) wait: TaskWait<Traits>,

    /// The task's timeout heap entry, used while the task sleeps or waits
    /// with a deadline.
    pub(crate) timeout: ManuallyDrop<Timeout<Traits>>,

    /// The last mutex locked by the task. Forms the list of all mutexes the
    /// task currently owns.
    pub(crate) last_mutex_held: klock::CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// Whether a `join` call observes this task's termination.
    join: klock::CpuLockCell<Traits, JoinState>,

    /// The tasks blocked in `join` on this task.
    pub(crate) join_queue: WaitQueue<Traits>,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Construct a `TaskCb` in the Dormant state.
    pub const fn new(attr: &'static TaskAttr) -> Self {
        Self {
            port_task_state: Init::INIT,
            attr,
            base_priority: klock::CpuLockCell::new(attr.priority),
            effective_priority: klock::CpuLockCell::new(attr.priority),
            st: klock::CpuLockCell::new(TaskSt::Dormant),
            slice: klock::CpuLockCell::new(0),
            ready_queue_data: Init::INIT,
            wait: TaskWait::INIT,
            timeout: ManuallyDrop::new(Timeout::new(wait::expire_wait_timeout::<Traits>)),
            last_mutex_held: klock::CpuLockCell::new(None),
            join: klock::CpuLockCell::new(JoinState::Joinable),
            join_queue: WaitQueue::new(QueueOrder::TaskPriority),
            res: object::ObjectRes::new(),
        }
    }

    pub(crate) fn timeout_ref(&'static self) -> &'static Timeout<Traits> {
        &self.timeout
    }

    /// Transition the task from the Dormant state into the Ready state,
    /// (re)initializing its execution context. The task restarts from its
    /// entry point with a fresh stack frame.
    pub fn activate(&'static self) -> Result<(), ActivateTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        activate(lock, self)
    }

    /// Forcibly terminate the task, putting it into the Dormant state.
    ///
    /// The task is removed from whatever queue currently holds it; the
    /// mutexes it holds are abandoned; its joiners are woken up with
    /// `Stopped`. Terminating the currently running task behaves like
    /// [`Kernel::exit_task`](crate::Kernel::exit_task) except for the
    /// wake event delivered to the joiners.
    pub fn terminate(&'static self) -> Result<(), TerminateTaskError> {
        state::expect_task_context::<Traits>()?;
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        terminate(lock, self)
    }

    /// Block the calling task until this task enters the Dormant state.
    ///
    /// Returns `Err(Stopped)` if the task was terminated by
    /// [`Self::terminate`] rather than by exiting.
    pub fn join(&'static self) -> Result<(), JoinTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        join(lock, self)
    }

    /// Put the task into the detached state, in which its termination is not
    /// observed by anyone.
    pub fn detach(&'static self) -> Result<(), DetachTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if self.join.get(&*lock) == JoinState::Detached
            || self.join_queue.first_waiting_task(lock.borrow_mut()).is_some()
        {
            return Err(DetachTaskError::BadObjectState);
        }

        self.join.replace(&mut *lock, JoinState::Detached);
        Ok(())
    }

    /// Change the task's base priority.
    ///
    /// Returns `Err(BadParam)` if the priority is out of range or if raising
    /// the priority would violate the locking protocol of a mutex the task
    /// holds or waits for.
    pub fn set_priority(&'static self, priority: Priority) -> Result<(), SetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        set_task_base_priority(lock, self, priority)
    }

    /// Get the task's base priority.
    pub fn priority(&'static self) -> Result<Priority, GetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if *self.st.read(&*lock) == TaskSt::Dormant {
            Err(GetTaskPriorityError::BadObjectState)
        } else {
            Ok(self.base_priority.get(&*lock))
        }
    }

    /// Get the task's effective priority.
    pub fn effective_priority(&'static self) -> Result<Priority, GetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if *self.st.read(&*lock) == TaskSt::Dormant {
            Err(GetTaskPriorityError::BadObjectState)
        } else {
            Ok(self.effective_priority.get(&*lock))
        }
    }

    /// Suspend the task.
    ///
    /// Only a Ready, Running (the caller itself), or sleeping task can be
    /// suspended; a task blocked on an object fails with `BadObjectState`.
    /// A sleeping task's remaining delay is preserved and restored by
    /// [`Self::resume`].
    pub fn suspend(&'static self) -> Result<(), SuspendTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        suspend(lock, self)
    }

    /// Resume the task from the suspended state.
    ///
    /// This service is interrupt-safe.
    pub fn resume(&'static self) -> Result<(), ResumeTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        resume(lock, self)
    }

    /// Deliver notification flags to the task.
    ///
    /// Succeeds only if the task is currently parked in
    /// [`Kernel::wait_flags`](crate::Kernel::wait_flags) (or its timed
    /// variant); the task is woken up once every wanted flag has been
    /// delivered.
    ///
    /// This service is interrupt-safe.
    pub fn give_flags(&'static self, flags: FlagBits) -> Result<(), GiveFlagsError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        give_flags(lock, self, flags)
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Allocate and construct a task, along with its attribute record and
    /// stack region. A zero `stack_size` selects
    /// [`PortThreading::STACK_DEFAULT_SIZE`].
    ///
    /// The task is created in the Dormant state; use [`Self::activate`] to
    /// start it.
    ///
    /// [`PortThreading::STACK_DEFAULT_SIZE`]: crate::PortThreading::STACK_DEFAULT_SIZE
    pub fn create(
        entry_point: fn(usize),
        entry_param: usize,
        stack_size: usize,
        priority: Priority,
    ) -> Result<&'static Self, CreateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let stack_size = if stack_size == 0 {
            Traits::STACK_DEFAULT_SIZE
        } else {
            stack_size
        };

        let stack_ptr = object::allocate_bytes(stack_size, Traits::STACK_ALIGN)
            .ok_or(CreateError::NoMemory)?;
        // Safety: The region was just allocated for this task's exclusive
        // use
        let stack = unsafe { StackRegion::new(stack_ptr.as_ptr(), stack_size) };

        let attr: &'static TaskAttr = match object::allocate_value(TaskAttr::new(
            entry_point,
            entry_param,
            stack,
            priority,
        )) {
            Some(attr) => attr,
            None => {
                // Safety: `stack_ptr` was just returned by `allocate_bytes`
                unsafe { object::deallocate_bytes(stack_ptr, stack_size, Traits::STACK_ALIGN) };
                return Err(CreateError::NoMemory);
            }
        };

        let task: &'static Self = match object::allocate_value(TaskCb::new(attr)) {
            Some(task) => task,
            None => {
                // Safety: Both were just allocated above
                unsafe {
                    object::deallocate_value(attr);
                    object::deallocate_bytes(stack_ptr, stack_size, Traits::STACK_ALIGN);
                }
                return Err(CreateError::NoMemory);
            }
        };

        task.res.mark_owned(&mut lock);

        Ok(task)
    }

    /// Terminate the task if necessary and release its storage.
    ///
    /// # Safety
    ///
    /// There must be no other references to the task in use. After this
    /// call, the task control block is gone; using any outstanding reference
    /// to it is undefined behavior (a best-effort assertion catches late
    /// calls through such references).
    pub unsafe fn delete(&'static self) -> Result<(), TerminateTaskError> {
        state::expect_task_context::<Traits>()?;

        match self.terminate() {
            // Already dormant is fine
            Ok(()) | Err(TerminateTaskError::BadObjectState) => {}
            Err(e) => return Err(e),
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.release(&mut lock);

        let attr = self.attr;
        drop(lock);

        // Safety: The object was allocated by `create` (checked by
        // `release`), and the caller vouches for the absence of other users
        unsafe {
            object::deallocate_value(self);
            if let Some(stack_ptr) = core::ptr::NonNull::new(attr.stack.as_ptr()) {
                object::deallocate_bytes(stack_ptr, attr.stack.len(), Traits::STACK_ALIGN);
            }
            object::deallocate_value(attr);
        }

        Ok(())
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("attr", self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("slice", &self.slice)
            .field("wait", &self.wait)
            .field(
                "last_mutex_held",
                // Don't print the contents of the mutex; this avoids
                // infinite recursion (TaskCb → MutexCb → TaskCb → …)
                &self
                    .last_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("join", &self.join)
            .field("res", &self.res)
            .finish()
    }
}

/// Recover the task control block containing the given timeout object.
pub(super) fn task_cb_from_timeout<Traits: KernelTraits>(
    timeout: &'static Timeout<Traits>,
) -> &'static TaskCb<Traits> {
    let offset = core::mem::offset_of!(TaskCb<Traits>, timeout);
    // Safety: Every `Timeout` registered with `expire_wait_timeout` as its
    // callback is the one embedded in a `TaskCb`
    unsafe { &*((timeout as *const Timeout<Traits>).byte_sub(offset) as *const TaskCb<Traits>) }
}

/// Implements [`Kernel::current_task`](crate::Kernel::current_task).
pub(super) fn current_task<Traits: KernelTraits>(
) -> Result<&'static TaskCb<Traits>, GetCurrentTaskError> {
    state::expect_task_context::<Traits>()?;
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().running_task(&lock).unwrap())
}

/// Implements `Task::activate`.
fn activate<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), ActivateTaskError> {
    if *task_cb.st.read(&*lock) != TaskSt::Dormant {
        return Err(ActivateTaskError::BadObjectState);
    }

    // Safety: CPU Lock active, the task is in the Dormant state
    unsafe { Traits::initialize_task_state(task_cb) };

    // Reset the task priority and the join state
    task_cb
        .base_priority
        .replace(&mut *lock, task_cb.attr.priority);
    task_cb
        .effective_priority
        .replace(&mut *lock, task_cb.attr.priority);
    task_cb.join.replace(&mut *lock, JoinState::Joinable);

    // Safety: The previous state is Dormant, and we just initialized the
    // task state, so this is safe
    unsafe { make_ready(lock.borrow_mut(), task_cb) };

    if Traits::state().running_task(&lock).is_some() {
        // If `task_cb` has a higher priority, perform a context switch.
        unlock_cpu_and_check_preemption(lock);
    } else {
        // Boot phase - the dispatcher will pick this task up
    }

    Ok(())
}

/// Mark the task Ready and file it at the back of its priority level in the
/// ready queue.
///
/// No clean-up of the task's previous state happens here; in particular,
/// a task coming out of `Dormant` must have had its execution context set
/// up by `initialize_task_state` beforehand.
pub(super) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    // Make the task Ready
    task_cb.st.replace(&mut *lock, TaskSt::Ready);

    // Insert the task to the ready queue.
    //
    // Safety: `task_cb` is not in the ready queue
    unsafe {
        Traits::state()
            .task_ready_queue
            .push_back_task(lock.into(), task_cb);
    }
}

/// Drop CPU Lock and, if the ready queue now holds something more urgent
/// than whatever is running, ask the port to dispatch.
///
/// Every service that can make a task Ready ends with this call, so a
/// wake-up never sits in the queue past the end of the system call that
/// produced it.
pub(super) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let prev_task_priority =
        if let Some(running_task) = Traits::state().running_task(&lock) {
            if *running_task.st.read(&*lock) == TaskSt::Running {
                running_task.effective_priority.get(&*lock)
            } else {
                usize::MAX
            }
        } else {
            usize::MAX
        };

    let has_preempting_task = Traits::state()
        .task_ready_queue
        .has_ready_task_in_priority_range(lock.borrow_mut().into(), ..prev_task_priority);

    // The dispatch request must go out with the lock released
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements `PortToKernel::choose_running_task`.
#[inline]
pub(super) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) {
    // The priority the incumbent defends its position with. `usize::MAX`
    // stands for "no incumbent": either nothing was running at all, or the
    // previous task just left the Running state.
    let prev_running_task = Traits::state().running_task(&lock);
    let prev_task_priority = if let Some(running_task) = prev_running_task {
        if *running_task.st.read(&*lock) == TaskSt::Running {
            running_task.effective_priority.get(&*lock)
        } else {
            usize::MAX
        }
    } else {
        usize::MAX
    };

    // Ask the ready queue for a successor.
    //
    // With no incumbent, the outcome must be `SwitchTo(_)` no matter what:
    // the stale `running_task` value has to be replaced even when the queue
    // is empty, which is why an empty queue comes back as `SwitchTo(None)`
    // rather than `Keep` in that case.
    let decision = Traits::state()
        .task_ready_queue
        .pop_front_task(lock.borrow_mut().into(), prev_task_priority);

    let next_running_task = match decision {
        readyqueue::ScheduleDecision::SwitchTo(task) => task,

        // Nobody outranks the incumbent, and it can still run - leave
        // everything as it is.
        readyqueue::ScheduleDecision::Keep => {
            // `Keep` is never produced for a `MAX` defending priority
            debug_assert_ne!(prev_task_priority, usize::MAX);
            return;
        }
    };

    if let Some(task) = next_running_task {
        // The elected task starts Running with a full time slice
        task.st.replace(&mut *lock, TaskSt::Running);
        task.slice.replace(&mut *lock, Traits::TIME_SLICE);

        if ptr_from_option_ref(prev_running_task) == task as *const _ {
            // The queue handed back the incumbent itself
            return;
        }
    }

    // The previous task is being displaced; file it wherever its state says
    // it belongs.
    if let Some(running_task) = prev_running_task {
        match *running_task.st.read(&*lock) {
            TaskSt::Running => {
                // Still Running means it was preempted, not blocked: it
                // goes back to the ready queue.
                // Safety: The previous state is Running, so this is safe
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            TaskSt::Waiting | TaskSt::Ready => {
                // Already filed somewhere else; nothing to do.
            }
            TaskSt::Dormant => unreachable!(),
        }
    }

    Traits::state()
        .running_task
        .replace(&mut *lock, next_running_task);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Transition the currently running task out of the Running state, spinning
/// until the scheduler gives the processor back. Returns when the task is
/// woken up.
///
/// The current context must be waitable (this function doesn't check that).
pub(super) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    let running_task = Traits::state().running_task(&lock).unwrap();
    debug_assert_eq!(*running_task.st.read(&*lock), TaskSt::Waiting);

    loop {
        // Temporarily release CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *running_task.st.read(&*lock) == TaskSt::Running {
            break;
        }

        assert_eq!(*running_task.st.read(&*lock), TaskSt::Waiting);
    }
}

/// Implements `Kernel::yield_now`.
pub(super) fn yield_current_task<Traits: KernelTraits>() -> Result<(), YieldError> {
    state::expect_task_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;

    let running_task = Traits::state().running_task(&lock).unwrap();
    debug_assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);

    // Move the task to the back of its priority level. The scheduler will
    // pick the longest-waiting task of the most urgent non-empty level,
    // which is the task itself if there's no peer.
    //
    // Safety: The previous state is Running
    unsafe { make_ready(lock.borrow_mut(), running_task) };

    unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Consume the running task's time slice by `elapsed` ticks. On exhaustion,
/// the slice is recharged, and if a Ready task exists at the same (or a more
/// urgent) priority, the running task is required to yield.
///
/// Called by the tick handler. The caller is responsible for the subsequent
/// dispatch (`unlock_cpu_and_check_preemption`).
pub(super) fn consume_time_slice<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    elapsed: UTicks,
) {
    if Traits::TIME_SLICE == 0 {
        return;
    }

    let Some(running_task) = Traits::state().running_task(&lock) else { return };
    if *running_task.st.read(&*lock) != TaskSt::Running {
        return;
    }

    let slice = running_task.slice.get(&*lock).saturating_sub(elapsed);
    running_task.slice.replace(&mut *lock, slice);

    if slice == 0 {
        running_task.slice.replace(&mut *lock, Traits::TIME_SLICE);

        // Time-slice exhaustion yields only to a peer of the same priority;
        // a more urgent task would have preempted already.
        let pri = running_task.effective_priority.get(&*lock);
        let has_peer = Traits::state()
            .task_ready_queue
            .has_ready_task_in_priority_range(lock.borrow_mut().into(), ..pri + 1);

        if has_peer {
            // Safety: The previous state is Running
            unsafe { make_ready(lock.borrow_mut(), running_task) };
        }
    }
}

/// The number of ticks until the running task's time slice expires, provided
/// that round-robin scheduling is enabled and a Ready peer exists to yield
/// to. Used to cap the delay until the next tick.
pub(super) fn time_slice_cap<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) -> Option<UTicks> {
    if Traits::TIME_SLICE == 0 {
        return None;
    }

    let running_task = Traits::state().running_task(&lock)?;
    if *running_task.st.read(&*lock) != TaskSt::Running {
        return None;
    }

    let pri = running_task.effective_priority.get(&*lock);
    let has_peer = Traits::state()
        .task_ready_queue
        .has_ready_task_in_priority_range(lock.borrow_mut().into(), ..pri + 1);

    if has_peer {
        Some(running_task.slice.get(&*lock))
    } else {
        None
    }
}

/// Implements `Kernel::exit_task`.
///
/// # Safety
///
/// See [`Kernel::exit_task`](crate::Kernel::exit_task).
pub(super) unsafe fn exit_current_task<Traits: KernelTraits>() -> ! {
    assert!(
        Traits::is_task_context(),
        "`exit_task` called from an interrupt context"
    );

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let running_task = Traits::state().running_task(&lock).unwrap();

    exit_inner(lock.borrow_mut(), running_task, Ok(0));

    core::mem::forget(lock);

    // Safety: (1) The user of `exit_task` acknowledges that all preexisting
    // data on the task stack will be invalidated. (2) CPU Lock active
    unsafe { Traits::exit_and_dispatch(running_task) }
}

/// The common part of task exit and self-termination: abandon held mutexes,
/// wake up the joiners, and transition the task into the Dormant state.
fn exit_inner<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    running_task: &'static TaskCb<Traits>,
    join_result: Result<WakeEvent, WaitAbort>,
) {
    // Abandon mutexes, waking up the next waiters of the mutexes (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_task);
    debug_assert!(running_task.last_mutex_held.read(&*lock).is_none());

    // Wake up the tasks waiting to join
    while let Some(joiner) = running_task.join_queue.dequeue_first(lock.borrow_mut()) {
        wait::finish_dequeued(lock.borrow_mut(), joiner, join_result);
    }

    // Transition the task to Dormant
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Dormant);

    // Erase `running_task`
    Traits::state().running_task.replace(&mut *lock, None);
}

/// Implements `Task::terminate`.
fn terminate<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), TerminateTaskError> {
    let running_task = Traits::state().running_task(&lock);

    if ptr_from_option_ref(running_task) == task_cb as *const _ {
        // Terminating the caller itself - take the exit path, but deliver
        // `Stopped` to the joiners
        exit_inner(lock.borrow_mut(), task_cb, Err(WaitAbort::Stopped));

        core::mem::forget(lock);

        // Safety: (1) The task requested its own termination. (2) CPU Lock
        // active
        unsafe { Traits::exit_and_dispatch(task_cb) }
    }

    match *task_cb.st.read(&*lock) {
        TaskSt::Dormant => return Err(TerminateTaskError::BadObjectState),
        TaskSt::Ready => {
            let pri = task_cb.effective_priority.get(&*lock);
            // Safety: The task is Ready, so it's linked to the ready queue
            // under `pri`
            unsafe {
                Traits::state().task_ready_queue.remove_task(
                    lock.borrow_mut().into(),
                    task_cb,
                    pri,
                );
            }
        }
        TaskSt::Waiting => {
            wait::abort_wait(lock.borrow_mut(), task_cb);
        }
        // The running task was handled above; on a uniprocessor nothing else
        // can be Running
        TaskSt::Running => unreachable!(),
    }

    task_cb.st.replace(&mut *lock, TaskSt::Dormant);

    // Abandon mutexes and wake up the joiners with `Stopped`
    mutex::abandon_held_mutexes(lock.borrow_mut(), task_cb);
    task_cb.join_queue.wake_up_all_stopped(lock.borrow_mut());

    unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Implements `Task::join`.
fn join<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), JoinTaskError> {
    let running_task = Traits::state().running_task(&lock).unwrap();

    if ptr_from_option_ref(Some(running_task)) == task_cb as *const _ {
        // Joining the caller itself would deadlock
        return Err(JoinTaskError::BadParam);
    }

    if task_cb.join.get(&*lock) == JoinState::Detached {
        return Err(JoinTaskError::BadObjectState);
    }

    if *task_cb.st.read(&*lock) == TaskSt::Dormant {
        return Ok(());
    }

    task_cb
        .join_queue
        .wait(lock.borrow_mut(), WaitPayload::Join(task_cb))?;

    Ok(())
}

/// Implements `Task::set_priority`.
fn set_task_base_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
    base_priority: Priority,
) -> Result<(), SetTaskPriorityError> {
    // Validate the given priority
    if base_priority >= Traits::NUM_TASK_PRIORITY_LEVELS {
        return Err(SetTaskPriorityError::BadParam);
    }

    let st = *task_cb.st.read(&*lock);

    if st == TaskSt::Dormant {
        return Err(SetTaskPriorityError::BadObjectState);
    }

    let old_base_priority = task_cb.base_priority.get(&*lock);

    if old_base_priority == base_priority {
        return Ok(());
    }

    // Fail with `BadParam` if the operation would violate the precondition
    // of the locking protocol used in any of the held or waited mutexes.
    // This check is only needed when raising the priority.
    if base_priority < old_base_priority {
        // Check the currently-waited mutex (if any)
        if let WaitPayload::Mutex(waited_mutex) = wait::current_payload(&lock, task_cb) {
            if !mutex::does_held_mutex_allow_new_task_base_priority(
                lock.borrow_mut(),
                waited_mutex,
                base_priority,
            ) {
                return Err(SetTaskPriorityError::BadParam);
            }
        }

        // Check the precondition for all currently-held mutexes
        if !mutex::do_held_mutexes_allow_new_task_base_priority(
            lock.borrow_mut(),
            task_cb,
            base_priority,
        ) {
            return Err(SetTaskPriorityError::BadParam);
        }
    }

    // Recalculate the effective priority according to the locking protocols
    // of held mutexes
    let effective_priority =
        mutex::evaluate_task_effective_priority(lock.borrow_mut(), task_cb, base_priority);

    task_cb.base_priority.replace(&mut *lock, base_priority);
    set_effective_priority(lock.borrow_mut(), task_cb, effective_priority);

    // If the task is waiting for a priority-inheritance mutex, the priority
    // inherited by the owner chain must be recalculated as well.
    if st == TaskSt::Waiting {
        if let WaitPayload::Mutex(waited_mutex) = wait::current_payload(&lock, task_cb) {
            mutex::reevaluate_inherited_priority(lock.borrow_mut(), waited_mutex);
        }
    }

    if let TaskSt::Running | TaskSt::Ready = st {
        // - If `st == TaskSt::Running`, `task_cb` is the currently running
        //   task. If the priority was lowered, it could be preempted by a
        //   task in the Ready state.
        // - If `st == TaskSt::Ready` and the priority was raised, it could
        //   preempt the currently running task.
        unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}

/// Update a task's effective priority, repositioning it within the queue
/// that currently holds it.
pub(super) fn set_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    effective_priority: Priority,
) {
    let old_effective_priority = task_cb
        .effective_priority
        .replace(&mut *lock, effective_priority);

    if old_effective_priority == effective_priority {
        return;
    }

    match *task_cb.st.read(&*lock) {
        TaskSt::Ready => unsafe {
            // Move the task within the ready queue
            //
            // Safety: `task_cb` was previously inserted to the ready queue
            // with an effective priority that is identical to
            // `old_effective_priority`.
            Traits::state().task_ready_queue.reorder_task(
                lock.borrow_mut().into(),
                task_cb,
                effective_priority,
                old_effective_priority,
            );
        },
        TaskSt::Waiting => {
            // Reposition the task in the wait queue if it's on one
            wait::reorder_wait_of_task(lock.borrow_mut(), task_cb);
        }
        TaskSt::Running => {}
        TaskSt::Dormant => unreachable!(),
    }
}

/// Implements `Task::suspend`.
fn suspend<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), SuspendTaskError> {
    match *task_cb.st.read(&*lock) {
        TaskSt::Dormant => Err(SuspendTaskError::BadObjectState),

        TaskSt::Running => {
            // On a uniprocessor, the only Running task is the caller itself:
            // self-suspension, which blocks
            state::expect_waitable_context::<Traits>()?;
            debug_assert!(
                ptr_from_option_ref(Traits::state().running_task(&lock)) == task_cb as *const _
            );

            wait::start_wait_no_queue(
                lock.borrow_mut(),
                WaitPayload::Suspend {
                    preserved_delay: None,
                },
            );

            // Completes when another task (or an interrupt handler) resumes
            // us. A suspended task can't time out or be woken through an
            // object, so the result is of no interest.
            let _ = wait::finish_wait(lock.borrow_mut());

            Ok(())
        }

        TaskSt::Ready => {
            let pri = task_cb.effective_priority.get(&*lock);
            // Safety: The task is Ready, so it's linked to the ready queue
            // under `pri`
            unsafe {
                Traits::state().task_ready_queue.remove_task(
                    lock.borrow_mut().into(),
                    task_cb,
                    pri,
                );
            }

            task_cb.st.replace(&mut *lock, TaskSt::Waiting);
            wait::set_payload(
                &mut lock,
                task_cb,
                WaitPayload::Suspend {
                    preserved_delay: None,
                },
            );

            Ok(())
        }

        TaskSt::Waiting => match wait::current_payload(&lock, task_cb) {
            WaitPayload::Sleep => {
                // An unbounded sleep has no delay to preserve and nothing a
                // suspension would add to it
                if !task_cb.timeout.is_linked(lock.borrow_mut()) {
                    return Err(SuspendTaskError::BadObjectState);
                }

                // Capture the remaining delay so that `resume` can restore
                // it
                let remaining = task_cb
                    .timeout
                    .saturating_duration_until_timeout(lock.borrow_mut());
                timeout::remove_timeout(lock.borrow_mut(), &task_cb.timeout);

                wait::set_payload(
                    &mut lock,
                    task_cb,
                    WaitPayload::Suspend {
                        preserved_delay: Some(remaining),
                    },
                );

                Ok(())
            }
            // Tasks blocked on an object (or already suspended) cannot be
            // suspended
            _ => Err(SuspendTaskError::BadObjectState),
        },
    }
}

/// Implements `Task::resume`.
fn resume<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), ResumeTaskError> {
    if *task_cb.st.read(&*lock) != TaskSt::Waiting {
        return Err(ResumeTaskError::BadObjectState);
    }

    match wait::current_payload(&lock, task_cb) {
        WaitPayload::Suspend {
            preserved_delay: None,
        } => {
            // The task was Ready or Running when it was suspended; it
            // becomes Ready again
            wait::interrupt_task(lock.borrow_mut(), task_cb, Ok(0)).unwrap();
            unlock_cpu_and_check_preemption(lock);
            Ok(())
        }

        WaitPayload::Suspend {
            preserved_delay: Some(remaining),
        } => {
            // The task was sleeping; restore the remainder of its delay
            if remaining == 0 {
                // The delay had already run out
                wait::interrupt_task(lock.borrow_mut(), task_cb, Err(WaitAbort::Timeout)).unwrap();
                unlock_cpu_and_check_preemption(lock);
            } else {
                wait::set_payload(&mut lock, task_cb, WaitPayload::Sleep);
                task_cb
                    .timeout
                    .set_expiration_after(lock.borrow_mut(), remaining);
                timeout::insert_timeout(lock.borrow_mut(), task_cb.timeout_ref());
            }
            Ok(())
        }

        _ => Err(ResumeTaskError::BadObjectState),
    }
}

/// Implements the sleep family of `Kernel`.
pub(super) fn put_current_task_on_sleep<Traits: KernelTraits>(
    arm: TimeoutArm,
) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let task = Traits::state().running_task(&lock).unwrap();

    // Resolve the wake-up time, bailing out if it has already been reached.
    // The timeout's raw expiration time doubles as the anchor for
    // `TimeoutArm::AfterPrevious`, so it's updated even when not sleeping.
    let now = timeout::current_time(lock.borrow_mut());
    let at = match arm {
        TimeoutArm::After(delay) => {
            timeout::checked_delay(delay)?;
            now.wrapping_add(delay)
        }
        TimeoutArm::At(tick) => tick,
        TimeoutArm::AfterPrevious(delay) => {
            timeout::checked_delay(delay)?;
            task.timeout.at_raw(lock.borrow_mut()).wrapping_add(delay)
        }
    };

    let delta = at.wrapping_sub(now);
    task.timeout.set_at_raw(lock.borrow_mut(), at);

    if delta == 0 || delta > timeout::MAX_DELAY {
        // The wake-up time is now or in the past
        return Ok(());
    }

    wait::start_wait_no_queue(lock.borrow_mut(), WaitPayload::Sleep);
    timeout::insert_timeout(lock.borrow_mut(), task.timeout_ref());

    match wait::finish_wait(lock.borrow_mut()) {
        // Reaching the wake-up time is how a sleep normally ends
        Err(WaitAbort::Timeout) | Ok(_) => Ok(()),
        Err(WaitAbort::Stopped) => Err(SleepError::Stopped),
    }
}

/// Implements `Kernel::sleep`.
pub(super) fn put_current_task_on_sleep_forever<Traits: KernelTraits>() -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    wait::start_wait_no_queue(lock.borrow_mut(), WaitPayload::Sleep);

    match wait::finish_wait(lock.borrow_mut()) {
        Err(WaitAbort::Stopped) => Err(SleepError::Stopped),
        // An unbounded sleep can't time out; a `resume` doesn't apply either
        Err(WaitAbort::Timeout) | Ok(_) => Ok(()),
    }
}

/// Implements `Kernel::wait_flags` and `Kernel::wait_flags_for`.
pub(super) fn wait_flags<Traits: KernelTraits>(
    flags: FlagBits,
    delay: Option<UTicks>,
) -> Result<FlagBits, WaitTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    if flags == 0 {
        return Ok(0);
    }

    let payload = WaitPayload::TaskFlags {
        wanted: flags,
        missing: flags,
    };

    if let Some(delay) = delay {
        let time32 = timeout::checked_delay(delay)?;
        if time32 == 0 {
            return Err(WaitTimeoutError::Timeout);
        }

        wait::start_wait_no_queue(lock.borrow_mut(), payload);

        let task = Traits::state().running_task(&lock).unwrap();
        task.timeout.set_expiration_after(lock.borrow_mut(), time32);
        timeout::insert_timeout(lock.borrow_mut(), task.timeout_ref());
    } else {
        wait::start_wait_no_queue(lock.borrow_mut(), payload);
    }

    wait::finish_wait(lock.borrow_mut()).map_err(Into::into)
}

/// Implements `Task::give_flags`.
fn give_flags<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
    flags: FlagBits,
) -> Result<(), GiveFlagsError> {
    if *task_cb.st.read(&*lock) != TaskSt::Waiting {
        return Err(GiveFlagsError::BadObjectState);
    }

    match wait::current_payload(&lock, task_cb) {
        WaitPayload::TaskFlags { wanted, missing } => {
            let missing = missing & !flags;
            if missing == 0 {
                // Every wanted flag has arrived; wake the task up, delivering
                // the complete set
                wait::interrupt_task(lock.borrow_mut(), task_cb, Ok(wanted)).unwrap();
                unlock_cpu_and_check_preemption(lock);
            } else {
                wait::set_payload(
                    &mut lock,
                    task_cb,
                    WaitPayload::TaskFlags { wanted, missing },
                );
            }
            Ok(())
        }
        _ => Err(GiveFlagsError::BadObjectState),
    }
}
