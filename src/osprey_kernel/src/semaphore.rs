//! Semaphores
use core::fmt;

use crate::{
    error::{PollError, QueryError, SignalSemaphoreError, UpdateError, WaitError, WaitTimeoutError},
    klock, object, state, task, timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, UTicks,
};

#[cfg(feature = "alloc")]
use crate::error::CreateError;

/// The type of a semaphore's counter.
pub type SemaphoreValue = u32;

/// *Semaphore control block* - the state data of a semaphore.
pub struct SemaphoreCb<Traits: KernelTraits> {
    pub(super) value: klock::CpuLockCell<Traits, SemaphoreValue>,
    pub(super) max_value: SemaphoreValue,

    pub(super) wait_queue: WaitQueue<Traits>,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Construct a counting semaphore holding `initial` permits, bounded by
    /// `max_value`.
    pub const fn new(initial: SemaphoreValue, max_value: SemaphoreValue) -> Self {
        assert!(initial <= max_value);
        Self {
            value: klock::CpuLockCell::new(initial),
            max_value,
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            res: object::ObjectRes::new(),
        }
    }

    /// Construct a binary semaphore.
    pub const fn binary(initial: bool) -> Self {
        Self::new(initial as SemaphoreValue, 1)
    }

    /// Take one permit, blocking until one is available.
    pub fn wait_one(&'static self) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        if take_permit_if_available(self, lock.borrow_mut()) {
            return Ok(());
        }

        // Queue up. The permit will arrive through the wake-up itself, so
        // there is nothing to re-check afterwards.
        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore)?;
        Ok(())
    }

    /// Take one permit, giving up after the specified number of ticks.
    pub fn wait_one_timeout(&'static self, delay: UTicks) -> Result<(), WaitTimeoutError> {
        let time32 = timeout::checked_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        wait_one_with_deadline(self, lock.borrow_mut(), time32)
    }

    /// Take one permit, giving up at the specified absolute tick.
    pub fn wait_one_until(&'static self, tick: UTicks) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);
        let time32 = timeout::delta_until_tick(lock.borrow_mut(), tick);
        wait_one_with_deadline(self, lock.borrow_mut(), time32)
    }

    /// Take one permit only if one is available now.
    pub fn poll_one(&'static self) -> Result<(), PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if take_permit_if_available(self, lock.borrow_mut()) {
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Deposit `count` permits, waking up that many waiting tasks.
    ///
    /// This service is interrupt-safe.
    pub fn signal(&'static self, count: SemaphoreValue) -> Result<(), SignalSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        let value = self.value.get(&*lock);
        if count > self.max_value - value {
            return Err(SignalSemaphoreError::QueueOverflow);
        }

        // Waiting tasks outrank the counter: permits go to the queue first,
        // one per task, and only what's left over is banked
        let mut undelivered = count;
        while undelivered > 0 {
            if self.wait_queue.wake_up_one(lock.borrow_mut(), 0).is_none() {
                break;
            }
            undelivered -= 1;
        }

        if undelivered > 0 {
            self.value.replace(&mut *lock, value + undelivered);
        }

        if undelivered != count {
            // Some task became Ready
            task::unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    /// Deposit a single permit.
    ///
    /// This service is interrupt-safe.
    pub fn signal_one(&'static self) -> Result<(), SignalSemaphoreError> {
        self.signal(1)
    }

    /// Get the current number of permits.
    pub fn get(&'static self) -> Result<SemaphoreValue, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        Ok(self.value.get(&*lock))
    }

    /// Wake up all waiting tasks with `Stopped` and reset the counter.
    pub fn kill(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        self.value.replace(&mut *lock, 0);
        if self.wait_queue.wake_up_all_stopped(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Allocate and construct a semaphore.
    pub fn create(
        initial: SemaphoreValue,
        max_value: SemaphoreValue,
    ) -> Result<&'static Self, CreateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let semaphore: &'static Self =
            object::allocate_value(Self::new(initial, max_value)).ok_or(CreateError::NoMemory)?;
        semaphore.res.mark_owned(&mut lock);

        Ok(semaphore)
    }

    /// Kill the semaphore and release its storage.
    ///
    /// # Safety
    ///
    /// There must be no other references to the semaphore in use.
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

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// Decrement the counter if it holds at least one permit. A `false` return
/// means the caller found the semaphore drained and has to queue up (or
/// report `Timeout`, for the immediate form).
#[inline]
fn take_permit_if_available<Traits: KernelTraits>(
    semaphore_cb: &SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) -> bool {
    let value = semaphore_cb.value.get(&*lock);
    if value == 0 {
        return false;
    }

    semaphore_cb.value.replace(&mut *lock, value - 1);
    true
}

/// The deadline-bounded acquisition path shared by `wait_one_timeout` and
/// `wait_one_until`.
#[inline]
fn wait_one_with_deadline<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    time32: timeout::Time32,
) -> Result<(), WaitTimeoutError> {
    if take_permit_if_available(semaphore_cb, lock.borrow_mut()) {
        return Ok(());
    }

    semaphore_cb
        .wait_queue
        .wait_timeout(lock, WaitPayload::Semaphore, time32)?;
    Ok(())
}
