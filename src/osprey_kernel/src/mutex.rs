//! Mutexes
//!
//! A mutex optionally partakes in one or both of two priority protocols:
//!
//!  - **Priority ceiling**: a mutex constructed by [`MutexCb::with_ceiling`]
//!    raises its owner's effective priority to the ceiling for as long as
//!    the mutex is held.
//!  - **Priority inheritance** ([`MutexAttr::PRIO_INHERIT`]): whenever a
//!    task more urgent than the owner blocks on the mutex, the owner's
//!    effective priority is temporarily raised to match, transitively along
//!    the chain of owners blocked on further inheriting mutexes.
//!
//! The inherited component of a task's effective priority is always
//! recomputable from first principles: it is the minimum of the task's base
//! priority, the ceilings of all held ceiling mutexes, and the effective
//! priority of the first waiter of each held inheriting mutex.
//! [`evaluate_task_effective_priority`] implements exactly this formula, and
//! every event that can change one of its inputs (a waiter arriving,
//! leaving, or changing priority; a mutex being released or abandoned) runs
//! it again on the affected owner chain.
use bitflags::bitflags;
use core::fmt;

use crate::{
    error::{
        LockMutexError, LockMutexPrecheckError, LockMutexTimeoutError, MarkConsistentMutexError,
        QueryError, TryLockMutexError, UnlockMutexError, UpdateError, WaitError,
    },
    klock, object, state,
    task::{self, TaskCb, TaskSt},
    timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Priority, UTicks,
};

#[cfg(feature = "alloc")]
use crate::error::CreateError;

bitflags! {
    /// Mutex attribute bits. An empty set selects a plain (normal,
    /// non-recursive, non-robust) mutex. The priority-ceiling protocol is
    /// selected by constructing the mutex with [`MutexCb::with_ceiling`].
    pub struct MutexAttr: u8 {
        /// The owner may lock the mutex again, maintaining a recursion
        /// count.
        const RECURSIVE = 1 << 0;

        /// Enable the priority-inheritance protocol.
        const PRIO_INHERIT = 1 << 1;

        /// If the owner terminates while holding the mutex, the next
        /// acquirer is notified through the `Abandoned` error and the mutex
        /// stays acquirable.
        const ROBUST = 1 << 2;

        /// Relocking by the owner is reported as `WouldDeadlock`. This is
        /// also the behavior of a plain mutex; the bit exists so that the
        /// intent can be stated explicitly.
        const ERROR_CHECK = 1 << 3;
    }
}

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb<Traits: KernelTraits> {
    attr: MutexAttr,

    /// The priority ceiling. `Some(_)` selects the priority-ceiling
    /// protocol.
    ceiling: Option<Priority>,

    /// The recursion depth in excess of the initial acquisition. Nonzero
    /// only for [`MutexAttr::RECURSIVE`] mutexes.
    count: klock::CpuLockCell<Traits, u32>,

    /// `true` if the previous owner terminated while holding this (robust)
    /// mutex and no one has called [`MutexCb::mark_consistent`] since.
    pub(super) inconsistent: klock::CpuLockCell<Traits, bool>,

    pub(super) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by
    /// the owning task.
    pub(super) prev_mutex_held: klock::CpuLockCell<Traits, Option<&'static Self>>,

    /// The task that currently owns the mutex lock.
    pub(super) owning_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    /// Construct a `MutexCb`.
    pub const fn new(attr: MutexAttr) -> Self {
        Self {
            attr,
            ceiling: None,
            count: klock::CpuLockCell::new(0),
            inconsistent: klock::CpuLockCell::new(false),
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            prev_mutex_held: klock::CpuLockCell::new(None),
            owning_task: klock::CpuLockCell::new(None),
            res: object::ObjectRes::new(),
        }
    }

    /// Construct a `MutexCb` using the priority-ceiling protocol.
    ///
    /// Tasks whose base priority is more urgent than `ceiling` are not
    /// allowed to lock the mutex (`BadParam`).
    pub const fn with_ceiling(attr: MutexAttr, ceiling: Priority) -> Self {
        let mut this = Self::new(attr);
        this.ceiling = Some(ceiling);
        this
    }

    /// Acquire the mutex, blocking indefinitely.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        lock_mutex(self, lock)
    }

    /// Acquire the mutex, giving up after the specified number of ticks.
    /// A zero delay is equivalent to [`Self::try_lock`].
    pub fn lock_timeout(&'static self, delay: UTicks) -> Result<(), LockMutexTimeoutError> {
        let time32 = timeout::checked_delay(delay)?;
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        lock_mutex_timeout(self, lock, time32)
    }

    /// Acquire the mutex, giving up at the specified absolute tick.
    pub fn lock_until(&'static self, tick: UTicks) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        let time32 = timeout::delta_until_tick(lock.borrow_mut(), tick);
        lock_mutex_timeout(self, lock, time32)
    }

    /// Acquire the mutex only if that is possible without blocking.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        self.res.expect_live(&lock);
        try_lock_mutex(self, lock)
    }

    /// Release the mutex.
    ///
    /// Mutexes must be released in the reverse order of acquisition;
    /// violating this is reported as `BadObjectState`.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        unlock_mutex(self, lock)
    }

    /// Get a flag indicating whether the mutex is currently locked.
    pub fn is_locked(&'static self) -> Result<bool, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        Ok(self.owning_task.get(&*lock).is_some())
    }

    /// Restore an abandoned robust mutex to the consistent state.
    ///
    /// Only the current owner (who observed `Abandoned` when acquiring) can
    /// meaningfully do this; the kernel merely requires that the mutex be
    /// flagged inconsistent.
    pub fn mark_consistent(&'static self) -> Result<(), MarkConsistentMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if self.inconsistent.replace(&mut *lock, false) {
            Ok(())
        } else {
            Err(MarkConsistentMutexError::BadObjectState)
        }
    }

    /// Reset the mutex, waking up all waiters with `Stopped`. The current
    /// owner (if any) loses the ownership.
    pub fn kill(&'static self) -> Result<(), UpdateError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        kill_mutex(self, lock)
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> MutexCb<Traits> {
    /// Allocate and construct a mutex.
    pub fn create(
        attr: MutexAttr,
        ceiling: Option<Priority>,
    ) -> Result<&'static Self, CreateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let mutex: &'static Self = object::allocate_value(match ceiling {
            Some(ceiling) => Self::with_ceiling(attr, ceiling),
            None => Self::new(attr),
        })
        .ok_or(CreateError::NoMemory)?;

        mutex.res.mark_owned(&mut lock);

        Ok(mutex)
    }

    /// Kill the mutex and release its storage.
    ///
    /// # Safety
    ///
    /// There must be no other references to the mutex in use.
    pub unsafe fn delete(&'static self) -> Result<(), UpdateError> {
        self.kill()?;

        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.release(&mut lock);
        drop(lock);

        // Safety: The object was allocated by `create` (checked by
        // `release`), and the caller vouches for the absence of other users
        unsafe { object::deallocate_value(self) };

        Ok(())
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("ceiling", &self.ceiling)
            .field("count", &self.count)
            .field("inconsistent", &self.inconsistent)
            .field("wait_queue", &self.wait_queue)
            .field(
                "prev_mutex_held",
                // prevent O((# of held mutexes)²)-order debug printing
                &self
                    .prev_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field(
                "owning_task",
                // break infinite recursion (TaskCb → MutexCb → TaskCb → …)
                &self
                    .owning_task
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish()
    }
}

/// Check the error conditions covered by [`LockMutexPrecheckError`] and
/// handle a recursive acquisition.
///
///  - `WouldDeadlock`: The current task already owns the mutex (and the
///    mutex is not recursive).
///
///  - `BadParam`: The mutex uses the priority-ceiling protocol and the
///    current task's base priority is more urgent than the ceiling.
///
/// Returns `Ok(None)` if the acquisition was completed recursively, or
/// `Ok(Some(task))` if the caller should proceed with the normal protocol.
#[inline]
fn precheck_and_get_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<Option<&'static TaskCb<Traits>>, LockMutexPrecheckError> {
    let task = Traits::state().running_task(&lock).unwrap();

    if ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)) == task as *const _ {
        if mutex_cb.attr.contains(MutexAttr::RECURSIVE) {
            let count = mutex_cb.count.get(&*lock);
            mutex_cb.count.replace(&mut *lock, count + 1);
            return Ok(None);
        }
        return Err(LockMutexPrecheckError::WouldDeadlock);
    }

    if let Some(ceiling) = mutex_cb.ceiling {
        if ceiling > task.base_priority.get(&*lock) {
            return Err(LockMutexPrecheckError::BadParam);
        }
    }

    Ok(Some(task))
}

/// Check if the current state of a mutex satisfies the wait condition.
///
/// If it does, this function updates it (gives the ownership to
/// `running_task`) and returns `true`. Otherwise, it returns `false`,
/// indicating the calling task should be blocked.
#[inline]
fn poll_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static TaskCb<Traits>,
    lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) -> bool {
    if mutex_cb.owning_task.get(&*lock).is_some() {
        false
    } else {
        lock_core(mutex_cb, running_task, lock);
        true
    }
}

/// Give the ownership of the mutex to `task`.
///
/// The task must be in the Running state, or in the Waiting state having
/// just been unlinked from the mutex's wait queue (an ownership handoff).
/// The locking protocols' boosts are applied here, *before* a handed-off
/// task is inserted into the ready queue, so the insertion happens at the
/// final priority.
#[inline]
fn lock_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) {
    debug_assert!(matches!(
        *task.st.read(&*lock),
        TaskSt::Running | TaskSt::Waiting
    ));
    debug_assert_eq!(mutex_cb.count.get(&*lock), 0);

    mutex_cb.owning_task.replace(&mut *lock, Some(task));

    // Push `mutex_cb` to the list of the mutexes held by the task.
    let prev_mutex_held = task.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);

    let mut effective_priority = task.effective_priority.get(&*lock);

    if let Some(ceiling) = mutex_cb.ceiling {
        effective_priority = effective_priority.min(ceiling);
    }

    if mutex_cb.attr.contains(MutexAttr::PRIO_INHERIT) {
        // The new owner inherits the priority of the remaining first waiter
        if let Some(waiter) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
            effective_priority =
                effective_priority.min(waiter.effective_priority.get(&*lock));
        }
    }

    task::set_effective_priority(lock, task, effective_priority);
}

/// The result of the non-blocking part of a mutex acquisition.
pub(super) enum MutexPoll {
    /// The calling task owns the mutex now.
    Acquired,
    /// The calling task already owned the mutex; the recursion count was
    /// incremented.
    Recursive,
    /// The mutex is contended and no wait was requested (or the requested
    /// wait had a zero duration).
    Timeout,
    /// The calling task was enqueued and transitioned into the Waiting
    /// state. The wait must be completed with `wait::finish_wait`.
    Blocked,
}

/// The non-blocking part of every mutex acquisition path: precheck, poll,
/// and (if `timeout32` permits) transition into the Waiting state, donating
/// the caller's priority to the owner chain.
///
/// `timeout32` selects the deadline form: `None` waits indefinitely,
/// `Some(0)` never waits, `Some(n)` waits for `n` ticks.
pub(super) fn lock_mutex_begin<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    timeout32: Option<timeout::Time32>,
) -> Result<MutexPoll, LockMutexPrecheckError> {
    let Some(running_task) = precheck_and_get_running_task(lock.borrow_mut(), mutex_cb)? else {
        return Ok(MutexPoll::Recursive);
    };

    if poll_core(mutex_cb, running_task, lock.borrow_mut()) {
        return Ok(MutexPoll::Acquired);
    }

    match timeout32 {
        Some(0) => return Ok(MutexPoll::Timeout),
        Some(time32) => {
            mutex_cb.wait_queue.start_wait_timeout(
                lock.borrow_mut(),
                WaitPayload::Mutex(mutex_cb),
                time32,
            );
        }
        None => {
            mutex_cb
                .wait_queue
                .start_wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb));
        }
    }

    // The new waiter may raise the priority inherited by the owner chain
    reevaluate_inherited_priority(lock.borrow_mut(), mutex_cb);

    Ok(MutexPoll::Blocked)
}

#[inline]
fn lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), LockMutexError> {
    match lock_mutex_begin(mutex_cb, lock.borrow_mut(), None)? {
        MutexPoll::Acquired => {}
        // Abandonment is only reported on the initial acquisition
        MutexPoll::Recursive => return Ok(()),
        MutexPoll::Timeout => unreachable!(),
        MutexPoll::Blocked => {
            // Wait for the ownership handoff by the releasing owner
            let result: Result<(), WaitError> = crate::wait::finish_wait(lock.borrow_mut())
                .map(|_| ())
                .map_err(crate::error::expect_not_timeout);
            result?;
        }
    }

    if mutex_cb.inconsistent.get(&*lock) {
        Err(LockMutexError::Abandoned)
    } else {
        Ok(())
    }
}

#[inline]
fn try_lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), TryLockMutexError> {
    match lock_mutex_begin(mutex_cb, lock.borrow_mut(), Some(0))? {
        MutexPoll::Acquired => {}
        // Abandonment is only reported on the initial acquisition
        MutexPoll::Recursive => return Ok(()),
        MutexPoll::Timeout => return Err(TryLockMutexError::Timeout),
        MutexPoll::Blocked => unreachable!(),
    }

    if mutex_cb.inconsistent.get(&*lock) {
        Err(TryLockMutexError::Abandoned)
    } else {
        Ok(())
    }
}

#[inline]
fn lock_mutex_timeout<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    time32: timeout::Time32,
) -> Result<(), LockMutexTimeoutError> {
    match lock_mutex_begin(mutex_cb, lock.borrow_mut(), Some(time32))? {
        MutexPoll::Acquired => {}
        // Abandonment is only reported on the initial acquisition
        MutexPoll::Recursive => return Ok(()),
        MutexPoll::Timeout => return Err(LockMutexTimeoutError::Timeout),
        MutexPoll::Blocked => {
            crate::wait::finish_wait(lock.borrow_mut()).map_err(
                |e| -> LockMutexTimeoutError { crate::error::WaitTimeoutError::from(e).into() },
            )?;
        }
    }

    if mutex_cb.inconsistent.get(&*lock) {
        Err(LockMutexTimeoutError::Abandoned)
    } else {
        Ok(())
    }
}

#[inline]
fn unlock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), UnlockMutexError> {
    let task = Traits::state().running_task(&lock).unwrap();

    if ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)) != task as *const _ {
        // The current task does not currently own the mutex.
        return Err(UnlockMutexError::NotOwner);
    }

    let count = mutex_cb.count.get(&*lock);
    if count > 0 {
        // Leave a recursive acquisition
        mutex_cb.count.replace(&mut *lock, count - 1);
        return Ok(());
    }

    if ptr_from_option_ref(task.last_mutex_held.get(&*lock)) != mutex_cb as *const _ {
        // The correct mutex unlocking order is violated.
        return Err(UnlockMutexError::BadObjectState);
    }

    // Remove `mutex_cb` from the list of the mutexes held by the task.
    let prev_mutex_held = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
    task.last_mutex_held.replace(&mut *lock, prev_mutex_held);

    // Lower the task's effective priority. This may cause preemption.
    let base_priority = task.base_priority.get(&*lock);
    let effective_priority =
        evaluate_task_effective_priority(lock.borrow_mut(), task, base_priority);
    task::set_effective_priority(lock.borrow_mut(), task, effective_priority);

    // Wake up the next waiter
    transfer_to_next_waiter(mutex_cb, lock.borrow_mut());

    task::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Hand the ownership of the mutex over to its first waiter, or release it
/// if there's no waiter.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn transfer_to_next_waiter<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) {
    if let Some(next_task) = mutex_cb.wait_queue.dequeue_first(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_task`. The protocol
        // boosts are applied before the task enters the ready queue.
        lock_core(mutex_cb, next_task, lock.borrow_mut());

        // Wake up the new owner
        crate::wait::finish_dequeued(lock.borrow_mut(), next_task, Ok(0));
    } else {
        // There's no one waiting
        mutex_cb.owning_task.replace(&mut *lock, None);
    }
}

/// Implements `Mutex::kill`.
fn kill_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), UpdateError> {
    let woke_up_any = mutex_cb.wait_queue.wake_up_all_stopped(lock.borrow_mut());

    // Take the mutex away from the current owner
    if let Some(owner) = mutex_cb.owning_task.replace(&mut *lock, None) {
        remove_from_held_list(lock.borrow_mut(), owner, mutex_cb);

        let base_priority = owner.base_priority.get(&*lock);
        let effective_priority =
            evaluate_task_effective_priority(lock.borrow_mut(), owner, base_priority);
        task::set_effective_priority(lock.borrow_mut(), owner, effective_priority);
    }

    mutex_cb.count.replace(&mut *lock, 0);
    mutex_cb.inconsistent.replace(&mut *lock, false);

    if woke_up_any {
        task::unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}

/// Abandon all mutexes held by the task.
///
/// This method doesn't restore the task's effective priority.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(super) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let mut maybe_mutex_cb = task.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = maybe_mutex_cb {
        maybe_mutex_cb = mutex_cb.prev_mutex_held.replace(&mut *lock, None);

        if mutex_cb.attr.contains(MutexAttr::ROBUST) {
            mutex_cb.inconsistent.replace(&mut *lock, true);
        }
        mutex_cb.count.replace(&mut *lock, 0);

        transfer_to_next_waiter(mutex_cb, lock.borrow_mut());
    }
}

/// Remove `mutex_cb` from `owner`'s held-mutex list, wherever it is in the
/// list.
fn remove_from_held_list<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    owner: &'static TaskCb<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let prev = mutex_cb.prev_mutex_held.replace(&mut *lock, None);

    let mut cur = owner.last_mutex_held.get(&*lock);
    if ptr_from_option_ref(cur) == mutex_cb as *const _ {
        owner.last_mutex_held.replace(&mut *lock, prev);
        return;
    }

    while let Some(m) = cur {
        let next = m.prev_mutex_held.get(&*lock);
        if ptr_from_option_ref(next) == mutex_cb as *const _ {
            m.prev_mutex_held.replace(&mut *lock, prev);
            return;
        }
        cur = next;
    }

    // The mutex claimed to be owned by `owner` but wasn't in its held list
    debug_assert!(false, "held-mutex list is inconsistent");
}

/// Check if the specified mutex, which is currently held or waited for by a
/// task, is compatible with the new task base priority according to the
/// mutex's locking protocol.
///
/// The check is only needed when raising the priority.
#[inline]
pub(super) fn does_held_mutex_allow_new_task_base_priority<Traits: KernelTraits>(
    _lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    if let Some(ceiling) = mutex_cb.ceiling {
        if ceiling > new_base_priority {
            return false;
        }
    }

    true
}

/// Check if the task's held mutexes are all compatible with the new task
/// base priority according to the mutexes' locking protocols.
///
/// The check is only needed when raising the priority.
#[inline]
pub(super) fn do_held_mutexes_allow_new_task_base_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    let mut maybe_mutex_cb = task.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = maybe_mutex_cb {
        if !does_held_mutex_allow_new_task_base_priority(
            lock.borrow_mut(),
            mutex_cb,
            new_base_priority,
        ) {
            return false;
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }
    true
}

/// Reevaluate the task's effective priority and return the result.
/// (This method doesn't update `TaskCb::effective_priority`.)
/// The base priority is assumed to be `base_priority`.
pub(super) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective_priority = base_priority;
    let mut maybe_mutex_cb = task.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        if let Some(ceiling) = mutex_cb.ceiling {
            effective_priority = effective_priority.min(ceiling);
        }

        if mutex_cb.attr.contains(MutexAttr::PRIO_INHERIT) {
            if let Some(waiter) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
                effective_priority =
                    effective_priority.min(waiter.effective_priority.get(&*lock));
            }
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Recompute the priority inherited through the specified mutex, walking the
/// chain of owners blocked on further inheriting mutexes.
///
/// This is the single entry point for every event that changes an input of
/// the inheritance formula: a waiter arriving at, leaving, or changing its
/// priority within the mutex's wait queue.
///
/// The walk terminates even on a cyclic ownership graph (which can only
/// arise from a deadlock, a programming error): an iteration continues only
/// when it strictly raised the urgency of some owner, and priorities are
/// bounded.
pub(super) fn reevaluate_inherited_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let mut mutex_cb = mutex_cb;

    loop {
        if !mutex_cb.attr.contains(MutexAttr::PRIO_INHERIT) {
            return;
        }

        let Some(owner) = mutex_cb.owning_task.get(&*lock) else { return };

        let base_priority = owner.base_priority.get(&*lock);
        let effective_priority =
            evaluate_task_effective_priority(lock.borrow_mut(), owner, base_priority);

        if effective_priority == owner.effective_priority.get(&*lock) {
            // The chain is already consistent past this point
            return;
        }

        task::set_effective_priority(lock.borrow_mut(), owner, effective_priority);

        // If the owner is itself blocked on another mutex, its new priority
        // feeds into that mutex's inheritance
        if *owner.st.read(&*lock) == TaskSt::Waiting {
            if let WaitPayload::Mutex(next_mutex_cb) = crate::wait::current_payload(&lock, owner) {
                mutex_cb = next_mutex_cb;
                continue;
            }
        }

        return;
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}
