//! Mutex behavior: recursion, robustness, the priority-ceiling protocol,
//! and priority inheritance.
use super::harness::*;
use crate::{
    error::{LockMutexError, TryLockMutexError, UnlockMutexError, WaitAbort},
    EventCb, MutexAttr, MutexCb, TaskAttr, TaskCb,
};

fn effective_priority_of<Traits: crate::KernelTraits>(task: &'static TaskCb<Traits>) -> usize {
    with_lock::<Traits, _>(|lock| task.effective_priority.get(&**lock))
}

#[test]
fn recursive_lock_unlock() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::RECURSIVE);

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    // Three acquisitions by the same task all succeed
    MTX.try_lock().unwrap();
    MTX.try_lock().unwrap();
    MTX.try_lock().unwrap();

    // The first two releases leave the mutex owned
    MTX.unlock().unwrap();
    assert_eq!(MTX.is_locked(), Ok(true));
    MTX.unlock().unwrap();
    assert_eq!(MTX.is_locked(), Ok(true));

    // The third release actually frees it
    MTX.unlock().unwrap();
    assert_eq!(MTX.is_locked(), Ok(false));

    // One release too many
    assert_eq!(MTX.unlock(), Err(UnlockMutexError::NotOwner));
}

#[test]
fn plain_relock_would_deadlock() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::ERROR_CHECK);

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    MTX.try_lock().unwrap();
    assert_eq!(MTX.try_lock(), Err(TryLockMutexError::WouldDeadlock));
    MTX.unlock().unwrap();
}

#[test]
fn unlock_order_is_lifo() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static MTX_A: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::empty());
    static MTX_B: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::empty());

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    MTX_A.try_lock().unwrap();
    MTX_B.try_lock().unwrap();

    assert_eq!(MTX_A.unlock(), Err(UnlockMutexError::BadObjectState));

    MTX_B.unlock().unwrap();
    MTX_A.unlock().unwrap();
}

#[test]
fn ceiling_boosts_owner() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static MTX: MutexCb<SystemTraits> = MutexCb::with_ceiling(MutexAttr::empty(), 1);

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_eq!(effective_priority_of(&TASK), 3);
    MTX.try_lock().unwrap();
    assert_eq!(effective_priority_of(&TASK), 1);
    MTX.unlock().unwrap();
    assert_eq!(effective_priority_of(&TASK), 3);
}

#[test]
fn ceiling_rejects_more_urgent_locker() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 2));
    static MTX: MutexCb<SystemTraits> = MutexCb::with_ceiling(MutexAttr::empty(), 4);

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    // The caller's base priority (2) is more urgent than the ceiling (4)
    assert_eq!(MTX.try_lock(), Err(TryLockMutexError::BadParam));
}

#[test]
fn inheritance_is_transitive() {
    define_system!();

    static TASK_L: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));
    static TASK_M: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_H: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 1));
    static MTX_X: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::PRIO_INHERIT);
    static MTX_Y: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::PRIO_INHERIT);

    TASK_L.activate().unwrap();
    start_kernel::<SystemTraits>();

    // L locks X
    assert_current(&TASK_L);
    assert!(begin_lock_mutex(&MTX_X, None));

    // M preempts, locks Y, then blocks on X: L inherits M's priority
    TASK_M.activate().unwrap();
    assert_current(&TASK_M);
    assert!(begin_lock_mutex(&MTX_Y, None));
    assert!(!begin_lock_mutex(&MTX_X, None));
    assert_current(&TASK_L);
    assert_eq!(effective_priority_of(&TASK_L), 3);

    // H preempts, blocks on Y: the boost propagates M -> L
    TASK_H.activate().unwrap();
    assert_current(&TASK_H);
    assert!(!begin_lock_mutex(&MTX_Y, None));
    assert_current(&TASK_L);
    assert_eq!(effective_priority_of(&TASK_M), 1);
    assert_eq!(effective_priority_of(&TASK_L), 1);

    // L releases X: M acquires it; L's boost is gone; M keeps H's priority
    // because it still holds Y
    MTX_X.unlock().unwrap();
    assert_eq!(effective_priority_of(&TASK_L), 5);
    assert_eq!(wait_result(&TASK_M), Ok(0));
    assert_current(&TASK_M);
    assert_eq!(effective_priority_of(&TASK_M), 1);

    // M releases Y: H acquires it; M's boost is gone
    MTX_Y.unlock().unwrap();
    assert_eq!(effective_priority_of(&TASK_M), 3);
    assert_eq!(wait_result(&TASK_H), Ok(0));
    assert_current(&TASK_H);
    assert_eq!(effective_priority_of(&TASK_H), 1);
}

#[test]
fn inheritance_boost_is_undone_by_waiter_timeout() {
    define_system!();

    static TASK_L: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));
    static TASK_M: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::PRIO_INHERIT);

    TASK_L.activate().unwrap();
    start_kernel::<SystemTraits>();
    assert!(begin_lock_mutex(&MTX, None));

    TASK_M.activate().unwrap();
    assert_current(&TASK_M);
    assert!(!begin_lock_mutex(&MTX, Some(10)));
    assert_current(&TASK_L);
    assert_eq!(effective_priority_of(&TASK_L), 3);

    // The wait times out: M never got the mutex, and L's boost is removed
    advance_time(10);
    assert_eq!(wait_result(&TASK_M), Err(WaitAbort::Timeout));
    assert_eq!(effective_priority_of(&TASK_L), 5);

    // M (prio 3) is runnable again and preempts L
    assert_current(&TASK_M);
}

#[test]
fn robust_mutex_reports_abandonment() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::ROBUST);
    static EVT: EventCb<SystemTraits> = EventCb::new();

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();

    // A acquires the mutex, then parks on an event
    assert_current(&TASK_A);
    MTX.try_lock().unwrap();
    block_current_on_queue(&EVT.wait_queue, crate::wait::WaitPayload::Event, None);
    assert_current(&TASK_B);

    // A dies holding the mutex
    TASK_A.terminate().unwrap();
    assert_eq!(MTX.is_locked(), Ok(false));

    // The next acquirer is told about the abandonment but owns the mutex
    assert_eq!(MTX.try_lock(), Err(TryLockMutexError::Abandoned));
    assert_eq!(MTX.is_locked(), Ok(true));

    // Until it vouches for the protected state being consistent again
    assert_eq!(MTX.try_lock(), Err(TryLockMutexError::WouldDeadlock));
    MTX.mark_consistent().unwrap();
    MTX.unlock().unwrap();
    assert_eq!(MTX.lock(), Ok(()));
    MTX.unlock().unwrap();
}

#[test]
fn abandoned_mutex_passes_to_waiter() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static TASK_C: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 7));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::ROBUST);

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    TASK_C.activate().unwrap();
    start_kernel::<SystemTraits>();

    // A acquires the mutex, B blocks on it, and A goes to sleep
    assert_current(&TASK_A);
    MTX.try_lock().unwrap();
    TASK_A.set_priority(6).unwrap();
    assert_current(&TASK_B);
    assert!(!begin_lock_mutex(&MTX, None));
    assert_current(&TASK_A);
    block_current_sleep::<SystemTraits>(1000);
    assert_current(&TASK_C);

    // A dies holding the mutex: B inherits the lock, flagged inconsistent
    TASK_A.terminate().unwrap();
    assert_eq!(wait_result(&TASK_B), Ok(0));
    assert_current(&TASK_B);
    with_lock::<SystemTraits, _>(|lock| {
        assert!(MTX.inconsistent.get(&**lock));
        assert!(core::ptr::eq(
            MTX.owning_task.get(&**lock).unwrap(),
            &TASK_B
        ));
    });
}

#[test]
fn lock_wakes_queue_in_priority_order() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 6));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static TASK_C: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::empty());

    TASK_A.activate().unwrap();
    start_kernel::<SystemTraits>();

    // A takes the mutex; B and C queue up on it
    assert!(begin_lock_mutex(&MTX, None));

    TASK_B.activate().unwrap();
    assert_current(&TASK_B);
    assert!(!begin_lock_mutex(&MTX, None));
    assert_current(&TASK_A);

    TASK_C.activate().unwrap();
    assert_current(&TASK_C);
    assert!(!begin_lock_mutex(&MTX, None));
    assert_current(&TASK_A);

    // The most urgent waiter (B, prio 4) gets the mutex first
    MTX.unlock().unwrap();
    assert_eq!(wait_result(&TASK_B), Ok(0));
    assert_current(&TASK_B);

    MTX.unlock().unwrap();
    assert_eq!(wait_result(&TASK_C), Ok(0));
    assert_current(&TASK_C);

    MTX.unlock().unwrap();
}

#[test]
fn kill_drains_waiters_and_owner() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::PRIO_INHERIT);

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();

    // B ends up owning the mutex with A waiting on it
    assert_current(&TASK_A);
    TASK_A.set_priority(6).unwrap();
    assert_current(&TASK_B);
    assert!(begin_lock_mutex(&MTX, None));
    TASK_A.set_priority(3).unwrap();
    assert_current(&TASK_A);
    assert!(!begin_lock_mutex(&MTX, None));
    assert_current(&TASK_B);
    assert_eq!(effective_priority_of(&TASK_B), 3);

    MTX.kill().unwrap();

    // The waiter is gone with `Stopped`, and the owner lost both the lock
    // and the inherited boost
    assert_eq!(wait_result(&TASK_A), Err(WaitAbort::Stopped));
    assert_eq!(MTX.is_locked(), Ok(false));
    assert_eq!(effective_priority_of(&TASK_B), 4);
    assert_current(&TASK_A);

    MTX.try_lock().unwrap();
    assert_eq!(MTX.unlock(), Ok(()));
}

#[test]
fn raising_base_priority_of_waiter_boosts_owner() {
    define_system!();

    static TASK_L: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));
    static TASK_M: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::PRIO_INHERIT);

    TASK_L.activate().unwrap();
    start_kernel::<SystemTraits>();
    assert!(begin_lock_mutex(&MTX, None));

    TASK_M.activate().unwrap();
    assert_current(&TASK_M);
    assert!(!begin_lock_mutex(&MTX, None));
    assert_current(&TASK_L);
    assert_eq!(effective_priority_of(&TASK_L), 4);

    // Raising the blocked waiter's priority propagates to the owner
    TASK_M.set_priority(2).unwrap();
    assert_eq!(effective_priority_of(&TASK_L), 2);

    // And lowering it releases the excess boost
    TASK_M.set_priority(5).unwrap();
    assert_eq!(effective_priority_of(&TASK_L), 5);

    MTX.unlock().unwrap();
    assert_eq!(wait_result(&TASK_M), Ok(0));
}

#[test]
fn lock_and_unlock_restore_base_priority() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::PRIO_INHERIT);

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    // An uncontended lock/unlock pair is priority-neutral
    assert_eq!(MTX.lock(), Ok(()));
    assert_eq!(effective_priority_of(&TASK), 3);
    MTX.unlock().unwrap();
    assert_eq!(effective_priority_of(&TASK), 3);
    assert_eq!(MTX.is_locked(), Ok(false));
}

#[test]
fn non_owner_cannot_unlock() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::empty());

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_current(&TASK_A);
    MTX.try_lock().unwrap();

    TASK_A.set_priority(6).unwrap();
    assert_current(&TASK_B);
    assert_eq!(MTX.unlock(), Err(UnlockMutexError::NotOwner));
}

#[test]
fn blocking_lock_returns_stopped_when_killed() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static MTX: MutexCb<SystemTraits> = MutexCb::new(MutexAttr::empty());

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_current(&TASK_A);
    MTX.try_lock().unwrap();
    block_current_sleep::<SystemTraits>(1000);
    assert_current(&TASK_B);
    assert!(!begin_lock_mutex(&MTX, None));

    MTX.kill().unwrap();
    assert_eq!(wait_result(&TASK_B), Err(WaitAbort::Stopped));

    // What `MutexCb::lock` reports for that wait result
    assert_eq!(
        LockMutexError::from(crate::error::expect_not_timeout(WaitAbort::Stopped)),
        LockMutexError::Stopped
    );
}
