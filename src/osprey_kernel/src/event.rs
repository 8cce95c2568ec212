//! Event objects
//!
//! An event object has no state of its own: tasks park on it and a `give`
//! broadcasts a single event word to every waiter at once.
use core::fmt;

use crate::{
    error::{UpdateError, WaitError, WaitTimeoutError},
    klock, object, state, task, timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, UTicks, WakeEvent,
};

#[cfg(feature = "alloc")]
use crate::error::CreateError;

/// *Event control block* - the state data of an event object.
pub struct EventCb<Traits: KernelTraits> {
    pub(super) wait_queue: WaitQueue<Traits>,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> EventCb<Traits> {
    /// Construct an `EventCb`.
    pub const fn new() -> Self {
        Self {
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            res: object::ObjectRes::new(),
        }
    }

    /// Wait for the next broadcast, returning the delivered event word.
    pub fn wait(&'static self) -> Result<WakeEvent, WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        self.wait_queue.wait(lock.borrow_mut(), WaitPayload::Event)
    }

    /// [`Self::wait`] with a timeout in ticks.
    pub fn wait_for(&'static self, delay: UTicks) -> Result<WakeEvent, WaitTimeoutError> {
        let time32 = timeout::checked_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Event, time32)
    }

    /// [`Self::wait`] with an absolute-tick deadline.
    pub fn wait_until(&'static self, tick: UTicks) -> Result<WakeEvent, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        let time32 = timeout::delta_until_tick(lock.borrow_mut(), tick);
        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Event, time32)
    }

    /// Broadcast `event` to all waiting tasks.
    ///
    /// This service is interrupt-safe.
    pub fn give(&'static self, event: WakeEvent) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if self.wait_queue.wake_up_all(lock.borrow_mut(), event) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wake up all waiting tasks with `Stopped`.
    pub fn kill(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if self.wait_queue.wake_up_all_stopped(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> EventCb<Traits> {
    /// Allocate and construct an event object.
    pub fn create() -> Result<&'static Self, CreateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let event: &'static Self =
            object::allocate_value(Self::new()).ok_or(CreateError::NoMemory)?;
        event.res.mark_owned(&mut lock);

        Ok(event)
    }

    /// Kill the event object and release its storage.
    ///
    /// # Safety
    ///
    /// There must be no other references to the event object in use.
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

impl<Traits: KernelTraits> Default for EventCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for EventCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventCb")
            .field("self", &(self as *const _))
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}
