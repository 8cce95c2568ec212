//! Fast (non-inheriting) mutexes
//!
//! A fast mutex tracks an owner and a wait queue and nothing else: no
//! recursion, no priority protocol, no robustness. Where that is enough, it
//! beats [`MutexCb`](crate::MutexCb) on every kernel path.
use core::fmt;

use crate::{
    error::{
        LockMutexError, LockMutexTimeoutError, QueryError, TryLockMutexError, UnlockMutexError,
        UpdateError,
    },
    klock, object, state,
    task::{self, TaskCb},
    timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, UTicks,
};

#[cfg(feature = "alloc")]
use crate::error::CreateError;

/// *Fast mutex control block* - the state data of a fast mutex.
pub struct FastMutexCb<Traits: KernelTraits> {
    /// The task that currently owns the mutex lock.
    pub(super) owning_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    pub(super) wait_queue: WaitQueue<Traits>,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> FastMutexCb<Traits> {
    /// Construct a `FastMutexCb`.
    pub const fn new() -> Self {
        Self {
            owning_task: klock::CpuLockCell::new(None),
            wait_queue: WaitQueue::new(QueueOrder::Fifo),
            res: object::ObjectRes::new(),
        }
    }

    /// Acquire the mutex only if that is possible without blocking.
    ///
    /// Returns `Err(Timeout)` if another task holds the mutex, or
    /// `Err(WouldDeadlock)` on a recursive attempt by the owner.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        self.res.expect_live(&lock);

        match poll_core(self, lock.borrow_mut()) {
            Poll::Acquired => Ok(()),
            Poll::Contended => Err(TryLockMutexError::Timeout),
            Poll::Owner => Err(TryLockMutexError::WouldDeadlock),
        }
    }

    /// Acquire the mutex, blocking indefinitely.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        match poll_core(self, lock.borrow_mut()) {
            Poll::Acquired => Ok(()),
            Poll::Owner => Err(LockMutexError::WouldDeadlock),
            Poll::Contended => {
                self.wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::FastMutex)?;
                Ok(())
            }
        }
    }

    /// Acquire the mutex, giving up after the specified number of ticks.
    pub fn lock_timeout(&'static self, delay: UTicks) -> Result<(), LockMutexTimeoutError> {
        let time32 = timeout::checked_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        lock_timeout_inner(self, lock.borrow_mut(), time32)
    }

    /// Acquire the mutex, giving up at the specified absolute tick.
    pub fn lock_until(&'static self, tick: UTicks) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        let time32 = timeout::delta_until_tick(lock.borrow_mut(), tick);
        lock_timeout_inner(self, lock.borrow_mut(), time32)
    }

    /// Release the mutex, passing the ownership directly to the first
    /// waiter (if any).
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        let task = Traits::state().running_task(&lock).unwrap();

        match self.owning_task.get(&*lock) {
            Some(owner) if core::ptr::eq(owner, task) => {}
            _ => return Err(UnlockMutexError::NotOwner),
        }

        // The new owner is whoever waited the longest
        let next = self.wait_queue.wake_up_one(lock.borrow_mut(), 0);
        self.owning_task.replace(&mut *lock, next);

        if next.is_some() {
            task::unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    /// Get a flag indicating whether the mutex is currently locked.
    pub fn is_locked(&'static self) -> Result<bool, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        Ok(self.owning_task.get(&*lock).is_some())
    }

    /// Reset the mutex, waking up all waiters with `Stopped`.
    pub fn kill(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        self.owning_task.replace(&mut *lock, None);
        if self.wait_queue.wake_up_all_stopped(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> FastMutexCb<Traits> {
    /// Allocate and construct a fast mutex.
    pub fn create() -> Result<&'static Self, CreateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let mutex: &'static Self =
            object::allocate_value(Self::new()).ok_or(CreateError::NoMemory)?;
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

impl<Traits: KernelTraits> Default for FastMutexCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for FastMutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FastMutexCb")
            .field("self", &(self as *const _))
            .field(
                "owning_task",
                &self
                    .owning_task
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

enum Poll {
    /// The mutex was free and now belongs to the calling task.
    Acquired,
    /// Another task holds the mutex.
    Contended,
    /// The calling task itself holds the mutex.
    Owner,
}

#[inline]
fn poll_core<Traits: KernelTraits>(
    mutex_cb: &'static FastMutexCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) -> Poll {
    let task = Traits::state().running_task(&lock).unwrap();

    match mutex_cb.owning_task.get(&*lock) {
        None => {
            mutex_cb.owning_task.replace(&mut *lock, Some(task));
            Poll::Acquired
        }
        Some(owner) if core::ptr::eq(owner, task) => Poll::Owner,
        Some(_) => Poll::Contended,
    }
}

#[inline]
fn lock_timeout_inner<Traits: KernelTraits>(
    mutex_cb: &'static FastMutexCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    time32: timeout::Time32,
) -> Result<(), LockMutexTimeoutError> {
    match poll_core(mutex_cb, lock.borrow_mut()) {
        Poll::Acquired => Ok(()),
        Poll::Owner => Err(LockMutexTimeoutError::WouldDeadlock),
        Poll::Contended => {
            mutex_cb
                .wait_queue
                .wait_timeout(lock, WaitPayload::FastMutex, time32)?;
            Ok(())
        }
    }
}
