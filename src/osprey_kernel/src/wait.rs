//! The blocking-wait protocol shared by every waitable object.
//!
//! A task blocked on an object is linked into the object's [`WaitQueue`]
//! through an intrusive link in its own control block, which also records
//! *which* queue holds the task (so that a wake-upper, a timeout, or a
//! terminator can unlink it in constant time), *why* it is waiting (the
//! [`WaitPayload`]), and the outcome of the wait (a [`WakeEvent`] delivered
//! by the wake-upper, or the reason the wait was aborted).
use core::fmt;

use crate::{
    error::{expect_not_timeout, BadObjectStateError, WaitAbort, WaitError, WaitTimeoutError},
    flag::FlagWaitMode,
    klock::{CpuLockCell, CpuLockGuard, CpuLockGuardBorrowMut, CpuLockToken},
    mempool, mutex,
    task::{self, TaskCb, TaskSt},
    timeout,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
        Init,
    },
    FlagBits, KernelTraits, WakeEvent,
};

/// Get a `ListAccessorCell` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new($list, &Static, |task: &TaskCb<Traits>| &task.wait.link, $key)
    };
}

/// Describes what a waiting task is waiting for, and carries the per-object
/// scratch data exchanged between the wake-upper and the waiter.
///
/// The variant in a task's [`TaskWait::payload`] is meaningful only while
/// the task is in the Waiting state and is implied by the object on whose
/// queue the task sits.
pub(crate) enum WaitPayload<Traits: KernelTraits> {
    None,
    Event,
    Semaphore,
    Flags {
        bits: FlagBits,
        mode: FlagWaitMode,
    },
    /// A task-targeted notification-flag rendezvous. `missing` is the set of
    /// flags not yet delivered.
    TaskFlags {
        wanted: FlagBits,
        missing: FlagBits,
    },
    Mutex(&'static mutex::MutexCb<Traits>),
    FastMutex,
    /// `block` is filled in by a donor passing a memory block directly to
    /// this waiter.
    MemPool {
        block: Option<mempool::BlockRef>,
    },
    Sleep,
    /// The task was suspended. For a suspended sleeper, `preserved_delay` is
    /// the remaining delay to restore on resumption.
    Suspend {
        preserved_delay: Option<timeout::Time32>,
    },
    Join(&'static TaskCb<Traits>),
}

impl<Traits: KernelTraits> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for WaitPayload<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Event => f.write_str("Event"),
            Self::Semaphore => f.write_str("Semaphore"),
            Self::Flags { bits, mode } => f
                .debug_struct("Flags")
                .field("bits", bits)
                .field("mode", mode)
                .finish(),
            Self::TaskFlags { wanted, missing } => f
                .debug_struct("TaskFlags")
                .field("wanted", wanted)
                .field("missing", missing)
                .finish(),
            Self::Mutex(mutex) => write!(f, "Mutex({:p})", *mutex),
            Self::FastMutex => f.write_str("FastMutex"),
            Self::MemPool { block } => f.debug_struct("MemPool").field("block", block).finish(),
            Self::Sleep => f.write_str("Sleep"),
            Self::Suspend { preserved_delay } => f
                .debug_struct("Suspend")
                .field("preserved_delay", preserved_delay)
                .finish(),
            Self::Join(task) => write!(f, "Join({:p})", *task),
        }
    }
}

/// A queue of tasks waiting on a particular waitable object.
pub(crate) struct WaitQueue<Traits: KernelTraits> {
    /// The tasks waiting on the waitable object associated with this
    /// instance of `WaitQueue`. The contained tasks must be in the Waiting
    /// state.
    waits: CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>,

    order: QueueOrder,
}

impl<Traits: KernelTraits> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waits: Init::INIT,
        order: QueueOrder::Fifo,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a task priority order. Tasks with the
    /// same effective priority follow a FIFO order.
    TaskPriority,
}

/// The wait state of a task, embedded in its control block.
pub(crate) struct TaskWait<Traits: KernelTraits> {
    /// Forms a linked list headed by `WaitQueue::waits`. `None` when the
    /// task is not on any wait queue.
    link: CpuLockCell<Traits, Option<StaticLink<TaskCb<Traits>>>>,

    /// The wait queue containing this task. Guards the task against being
    /// woken up through the wrong object.
    wait_queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,

    /// What the task is waiting for. Meaningful only in the Waiting state.
    payload: CpuLockCell<Traits, WaitPayload<Traits>>,

    /// The result of the last wait operation. Written by a wake-upper before
    /// readying the task; observed by the woken task.
    wait_result: CpuLockCell<Traits, Result<WakeEvent, WaitAbort>>,
}

impl<Traits: KernelTraits> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        link: Init::INIT,
        wait_queue: Init::INIT,
        payload: CpuLockCell::new(WaitPayload::None),
        wait_result: CpuLockCell::new(Ok(0)),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("payload", &self.payload)
            .field("wait_result", &self.wait_result)
            .finish()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Construct a `WaitQueue`.
    pub(super) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(StaticListHead::new()),
            order,
        }
    }

    /// Insert the currently running task into `self`, transitioning it into
    /// the Waiting state. The wait is unbounded; only a wake-upper (or the
    /// task's termination) can end it.
    ///
    /// This method doesn't yield the processor. The caller must complete the
    /// wait with [`finish_wait`] (usually through [`Self::wait`]).
    pub(super) fn start_wait(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) {
        let task = Traits::state().running_task(&*lock).unwrap();

        debug_assert_eq!(*task.st.read(&*lock), TaskSt::Running);
        debug_assert!(task.wait.wait_queue.get(&*lock).is_none());

        task.wait.payload.replace(&mut *lock, payload);
        task.wait.wait_queue.replace(&mut *lock, Some(self));

        // Insert `task` into `self.waits`
        let insert_at = match self.order {
            QueueOrder::Fifo => {
                // FIFO order - insert at the back
                None
            }
            QueueOrder::TaskPriority => {
                let cur_task_pri = task.effective_priority.get(&*lock);
                find_insertion_position_by_task_priority(
                    lock.borrow_mut(),
                    &self.waits,
                    cur_task_pri,
                )
            }
        };

        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        // Safety: `task` is not linked (checked above), so `insert` shouldn't
        //         return `InsertError::AlreadyLinked`, and the list is
        //         structurally sound.
        unsafe { accessor.insert(Ident(task), insert_at).unwrap_unchecked() };

        // Transition the task into Waiting
        task.st.replace(&mut *lock, TaskSt::Waiting);
    }

    /// Like [`Self::start_wait`], but the wait expires after the specified
    /// duration (which must be nonzero), delivering `WaitAbort::Timeout`.
    pub(super) fn start_wait_timeout(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        duration_time32: timeout::Time32,
    ) {
        debug_assert_ne!(duration_time32, 0);

        self.start_wait(lock.borrow_mut(), payload);

        let task = Traits::state().running_task(&*lock).unwrap();
        task.timeout
            .set_expiration_after(lock.borrow_mut(), duration_time32);
        timeout::insert_timeout(lock.borrow_mut(), task.timeout_ref());
    }

    /// Insert the currently running task into `self`, transitioning it into
    /// the Waiting state, and wait until a wake-upper delivers a wake event.
    ///
    /// The current context must be waitable (this method doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    pub(super) fn wait(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WakeEvent, WaitError> {
        self.start_wait(lock.borrow_mut(), payload);

        finish_wait(lock).map_err(expect_not_timeout)
    }

    /// [`Self::wait`] with a timeout. A zero duration fails with `Timeout`
    /// right away without blocking.
    pub(super) fn wait_timeout(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        duration_time32: timeout::Time32,
    ) -> Result<WakeEvent, WaitTimeoutError> {
        if duration_time32 == 0 {
            return Err(WaitTimeoutError::Timeout);
        }

        self.start_wait_timeout(lock.borrow_mut(), payload, duration_time32);

        finish_wait(lock).map_err(Into::into)
    }

    /// Get the next waiting task to be woken up.
    pub(super) fn first_waiting_task(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        accessor.front().map(|ident| ident.0)
    }

    /// Unlink the first waiting task without readying it. The task stays in
    /// the Waiting state; the caller must eventually pass it to
    /// [`finish_dequeued`].
    ///
    /// Cancels the task's pending timeout, if any.
    pub(super) fn dequeue_first(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        // Safety: This linked list is structurally sound, so it shouldn't
        //         return `Err(InconsistentError)`
        let task = unsafe { accessor.pop_front().unwrap_unchecked() }?.0;

        debug_assert!(core::ptr::eq(
            task.wait.wait_queue.get(&*lock).unwrap(),
            self
        ));
        task.wait.wait_queue.replace(&mut *lock, None);

        // A task blocked with a timeout also sits on the timeout heap
        timeout::remove_timeout(lock.borrow_mut(), &task.timeout);

        Some(task)
    }

    /// Wake up up to one waiting task, delivering `event` as its wake event.
    /// Returns the woken task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_one(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        event: WakeEvent,
    ) -> Option<&'static TaskCb<Traits>> {
        let task = self.dequeue_first(lock.borrow_mut())?;

        finish_dequeued(lock, task, Ok(event));

        Some(task)
    }

    /// Wake up all waiting tasks in queue order, delivering `event` to each
    /// of them. Returns `true` if at least one task was woken up.
    ///
    /// This method may make tasks Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_all(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        event: WakeEvent,
    ) -> bool {
        let mut woke_up_any = false;
        while self.wake_up_one(lock.borrow_mut(), event).is_some() {
            woke_up_any = true;
        }
        woke_up_any
    }

    /// Wake up all waiting tasks with the `Stopped` abort reason. Used when
    /// the waitable object is killed.
    pub(super) fn wake_up_all_stopped(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>) -> bool {
        let mut woke_up_any = false;
        while let Some(task) = self.dequeue_first(lock.borrow_mut()) {
            finish_dequeued(lock.borrow_mut(), task, Err(WaitAbort::Stopped));
            woke_up_any = true;
        }
        woke_up_any
    }

    /// Conditionally wake up waiting tasks.
    ///
    /// `cond` receives each waiter's payload in queue order; returning
    /// `Some(event)` wakes the waiter up with that wake event.
    ///
    /// This method may make tasks Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>) -> Option<WakeEvent>,
    ) -> bool {
        let mut woke_up_any = false;

        let mut cur = {
            let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            accessor.front()
        };

        while let Some(task_ident) = cur {
            let task = task_ident.0;

            // Find the next task before we possibly remove `task` from
            // `self.waits`.
            cur = {
                let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
                // Safety: `task` is still linked, so it shouldn't return
                //         `ItemError::NotLinked`.
                unsafe { accessor.next(task_ident).unwrap_unchecked() }
            };

            // Should this task be woken up?
            let payload = task.wait.payload.get(&*lock);
            let Some(event) = cond(&payload) else { continue };

            // Wake up the task
            {
                let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
                // Safety: `task` is still linked, so it shouldn't return
                //         `ItemError::NotLinked`.
                unsafe { accessor.remove(task_ident).unwrap_unchecked() };
            }
            task.wait.wait_queue.replace(&mut *lock, None);
            timeout::remove_timeout(lock.borrow_mut(), &task.timeout);

            finish_dequeued(lock.borrow_mut(), task, Ok(event));
            woke_up_any = true;
        }

        woke_up_any
    }

    /// Reposition `task` in the wait queue. This is necessary after changing
    /// the waiting task's effective priority.
    fn reorder_wait(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) {
        match self.order {
            QueueOrder::Fifo => return,
            QueueOrder::TaskPriority => {}
        }

        {
            let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            // Safety: `task` is linked, so it shouldn't return
            //         `ItemError::NotLinked`.
            unsafe { accessor.remove(Ident(task)).unwrap_unchecked() };
        }

        let cur_task_pri = task.effective_priority.get(&*lock);
        let insert_at =
            find_insertion_position_by_task_priority(lock.borrow_mut(), &self.waits, cur_task_pri);
        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        // Safety: `task` was just unlinked, and the list is structurally
        //         sound.
        unsafe { accessor.insert(Ident(task), insert_at).unwrap_unchecked() };
    }

    #[cfg(test)]
    pub(super) fn is_empty(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>) -> bool {
        wait_queue_accessor!(&self.waits, lock.borrow_mut()).is_empty()
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field(
                "waits",
                &self.waits.debug_fmt_with(|head, f| head.fmt(f)),
            )
            .field("order", &self.order)
            .finish()
    }
}

/// Find the insertion position for a task of priority `cur_task_pri` such
/// that the queue stays sorted by task priority, and the new task goes after
/// all existing tasks of the same priority.
fn find_insertion_position_by_task_priority<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    waits: &CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>,
    cur_task_pri: usize,
) -> Option<Ident<&'static TaskCb<Traits>>> {
    let accessor = wait_queue_accessor!(waits, lock.borrow_mut());

    let mut insert_at = None;
    // Safety: The linked list is structurally sound
    let mut cursor = unsafe { accessor.back().unwrap_unchecked() };
    while let Some(next_cursor) = cursor {
        // Should the new task be inserted at this or an earlier position?
        let next_cursor_task_pri = next_cursor
            .0
            .effective_priority
            .get(&**accessor.cell_key());
        if next_cursor_task_pri > cur_task_pri {
            // If so, update `insert_at`. Continue searching because there
            // might be a viable position that is even earlier.
            insert_at = Some(next_cursor);
            // Safety: `next_cursor` is linked, so `prev` shouldn't return
            //         `ItemError::NotLinked`.
            cursor = unsafe { accessor.prev(next_cursor).unwrap_unchecked() };
        } else {
            break;
        }
    }
    insert_at
}

/// Transition the currently running task into the Waiting state without
/// associating it with any wait queue. Used for sleeping, self-suspension,
/// and task-targeted flag waits.
///
/// The only ways to end such a wait are [`interrupt_task`] and a registered
/// timeout.
pub(super) fn start_wait_no_queue<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    payload: WaitPayload<Traits>,
) {
    let task = Traits::state().running_task(&*lock).unwrap();

    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Running);
    debug_assert!(task.wait.wait_queue.get(&*lock).is_none());

    task.wait.payload.replace(&mut *lock, payload);
    task.st.replace(&mut *lock, TaskSt::Waiting);
}

/// Complete a wait operation started by [`WaitQueue::start_wait`]. Spins
/// until the running task regains the processor and returns its wait result.
pub(super) fn finish_wait<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
) -> Result<WakeEvent, WaitAbort> {
    task::wait_until_woken_up(lock.borrow_mut());

    let task = Traits::state().running_task(&*lock).unwrap();

    // The wake-upper should have unlinked the task
    debug_assert!(task.wait.wait_queue.get(&*lock).is_none());
    debug_assert!(task.wait.link.get(&*lock).is_none());

    task.wait.wait_result.get(&*lock)
}

/// Deposit a wait result into a task previously unlinked by
/// [`WaitQueue::dequeue_first`] (or never linked to a wait queue at all) and
/// make it Ready.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(super) fn finish_dequeued<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    wait_result: Result<WakeEvent, WaitAbort>,
) {
    debug_assert!(task_cb.wait.wait_queue.get(&*lock).is_none());
    debug_assert!(!task_cb.timeout.is_linked(lock.borrow_mut()));
    assert_eq!(*task_cb.st.read(&*lock), TaskSt::Waiting);

    task_cb.wait.wait_result.replace(&mut *lock, wait_result);

    // Make the task Ready
    //
    // Safety: The task is in the Waiting state, meaning the task state is
    // valid and ready to resume from the point where it was previously
    // interrupted. A proper clean-up for exiting the Waiting state is
    // already done as well.
    unsafe { task::make_ready(lock, task_cb) };
}

/// Unlink the specified task from the wait queue containing it (if any) and
/// cancel its pending timeout. The task stays in the Waiting state.
///
/// If the task was waiting for a priority-inheritance mutex, the boost it
/// donated to the owner chain is recalculated.
fn unlink_from_wait_queue<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if let Some(wait_queue) = task_cb.wait.wait_queue.replace(&mut *lock, None) {
        {
            let mut accessor = wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut());
            // Safety: The task is linked - `wait_queue` was set
            unsafe { accessor.remove(Ident(task_cb)).unwrap_unchecked() };
        }

        // Removing a waiter can lower the priority inherited by the mutex
        // owner chain
        if let WaitPayload::Mutex(mutex_cb) = task_cb.wait.payload.get(&*lock) {
            mutex::reevaluate_inherited_priority(lock.borrow_mut(), mutex_cb);
        }
    }

    timeout::remove_timeout(lock.borrow_mut(), &task_cb.timeout);
}

/// Interrupt any ongoing wait operation of the task, waking it up with the
/// specified wait result.
///
/// This method may make the task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `Err(BadObjectState)` if the task is not in the Waiting state.
pub(super) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    wait_result: Result<WakeEvent, WaitAbort>,
) -> Result<(), BadObjectStateError> {
    match *task_cb.st.read(&*lock) {
        TaskSt::Waiting => {
            unlink_from_wait_queue(lock.borrow_mut(), task_cb);
            finish_dequeued(lock, task_cb, wait_result);
            Ok(())
        }
        _ => Err(BadObjectStateError::BadObjectState),
    }
}

/// Tear down the wait state of a task that is being terminated. Unlike
/// [`interrupt_task`], the task is *not* made Ready.
///
/// Does nothing if the task is not in the Waiting state.
pub(super) fn abort_wait<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if *task_cb.st.read(&*lock) == TaskSt::Waiting {
        unlink_from_wait_queue(lock.borrow_mut(), task_cb);
        task_cb.wait.payload.replace(&mut *lock, WaitPayload::None);
    }
}

/// The timeout callback function registered for a task blocked with a
/// deadline. Aborts the task's wait with `WaitAbort::Timeout`.
pub(super) fn expire_wait_timeout<Traits: KernelTraits>(
    timeout: &'static timeout::Timeout<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let task_cb = task::task_cb_from_timeout(timeout);

    match interrupt_task(lock.borrow_mut(), task_cb, Err(WaitAbort::Timeout)) {
        // Even if the task got woken up just before the timeout fired, we
        // don't care
        Ok(()) | Err(BadObjectStateError::BadObjectState) => {}
    }

    lock
}

/// Read the payload of a task's ongoing wait operation.
pub(super) fn current_payload<Traits: KernelTraits>(
    lock: &CpuLockToken<Traits>,
    task_cb: &TaskCb<Traits>,
) -> WaitPayload<Traits> {
    task_cb.wait.payload.get(lock)
}

/// Overwrite the payload of a task's ongoing wait operation.
pub(super) fn set_payload<Traits: KernelTraits>(
    lock: &mut CpuLockToken<Traits>,
    task_cb: &TaskCb<Traits>,
    payload: WaitPayload<Traits>,
) {
    task_cb.wait.payload.replace(lock, payload);
}

/// Reposition the given task in the wait queue containing it. This is
/// necessary after changing the task's effective priority because some wait
/// queues are sorted by task priority.
///
/// Does nothing if the task is not waiting on a queue.
pub(super) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if let Some(wait_queue) = task_cb.wait.wait_queue.get(&*lock) {
        wait_queue.reorder_wait(lock, task_cb);
    }
}

/// Read the result of a task's last wait operation.
#[cfg(test)]
pub(super) fn wait_result_of<Traits: KernelTraits>(
    lock: &CpuLockToken<Traits>,
    task_cb: &TaskCb<Traits>,
) -> Result<WakeEvent, WaitAbort> {
    task_cb.wait.wait_result.get(lock)
}
