//! Flag groups
use bitflags::bitflags;
use core::fmt;

use crate::{
    error::{PollError, QueryError, UpdateError, WaitError, WaitTimeoutError},
    klock, object, state, task, timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    FlagBits, KernelTraits, UTicks,
};

#[cfg(feature = "alloc")]
use crate::error::CreateError;

bitflags! {
    /// Options for the wait operations of a flag group.
    pub struct FlagWaitMode: u8 {
        /// Wait until *all* the specified bits are set, instead of any of
        /// them.
        const ALL = 1 << 0;

        /// Clear the specified bits when the wait condition is satisfied.
        const CLEAR = 1 << 1;
    }
}

/// *Flag group control block* - the state data of a flag group.
pub struct FlagCb<Traits: KernelTraits> {
    pub(super) bits: klock::CpuLockCell<Traits, FlagBits>,

    pub(super) wait_queue: WaitQueue<Traits>,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> FlagCb<Traits> {
    /// Construct a `FlagCb` with all bits clear.
    pub const fn new() -> Self {
        Self {
            bits: klock::CpuLockCell::new(0),
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            res: object::ObjectRes::new(),
        }
    }

    /// Set the specified bits, waking up the waiters whose wait conditions
    /// become satisfied.
    ///
    /// This service is interrupt-safe.
    pub fn set(&'static self, bits: FlagBits) -> Result<(), UpdateError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        set(self, lock, bits)
    }

    /// Clear the specified bits.
    ///
    /// This service is interrupt-safe.
    pub fn clear(&'static self, bits: FlagBits) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        self.bits.replace_with(&mut *lock, |b| *b & !bits);
        Ok(())
    }

    /// Get the current bit pattern.
    pub fn get(&'static self) -> Result<FlagBits, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        Ok(self.bits.get(&*lock))
    }

    /// Wait until the specified bits are set (all of them, or any one,
    /// according to `mode`). Returns the bit pattern observed when the
    /// condition was satisfied, before any [`FlagWaitMode::CLEAR`]
    /// consumption.
    pub fn wait(&'static self, bits: FlagBits, mode: FlagWaitMode) -> Result<FlagBits, WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        if let Some(orig) = match_flags(self.bits.write(&mut *lock), bits, mode) {
            Ok(orig)
        } else {
            // The current state does not satisfy the wait condition. Start
            // waiting; `set` evaluates the condition on our behalf.
            self.wait_queue
                .wait(lock.borrow_mut(), WaitPayload::Flags { bits, mode })
        }
    }

    /// [`Self::wait`] with a timeout in ticks.
    pub fn wait_for(
        &'static self,
        bits: FlagBits,
        mode: FlagWaitMode,
        delay: UTicks,
    ) -> Result<FlagBits, WaitTimeoutError> {
        let time32 = timeout::checked_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        if let Some(orig) = match_flags(self.bits.write(&mut *lock), bits, mode) {
            Ok(orig)
        } else {
            self.wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::Flags { bits, mode }, time32)
        }
    }

    /// [`Self::wait`] with an absolute-tick deadline.
    pub fn wait_until(
        &'static self,
        bits: FlagBits,
        mode: FlagWaitMode,
        tick: UTicks,
    ) -> Result<FlagBits, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        if let Some(orig) = match_flags(self.bits.write(&mut *lock), bits, mode) {
            Ok(orig)
        } else {
            let time32 = timeout::delta_until_tick(lock.borrow_mut(), tick);
            self.wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::Flags { bits, mode }, time32)
        }
    }

    /// Check the wait condition without blocking.
    pub fn poll(&'static self, bits: FlagBits, mode: FlagWaitMode) -> Result<FlagBits, PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if let Some(orig) = match_flags(self.bits.write(&mut *lock), bits, mode) {
            Ok(orig)
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Wake up all waiting tasks with `Stopped` and clear all bits.
    pub fn kill(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        self.bits.replace(&mut *lock, 0);
        if self.wait_queue.wake_up_all_stopped(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> FlagCb<Traits> {
    /// Allocate and construct a flag group.
    pub fn create() -> Result<&'static Self, CreateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let flag: &'static Self =
            object::allocate_value(Self::new()).ok_or(CreateError::NoMemory)?;
        flag.res.mark_owned(&mut lock);

        Ok(flag)
    }

    /// Kill the flag group and release its storage.
    ///
    /// # Safety
    ///
    /// There must be no other references to the flag group in use.
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

impl<Traits: KernelTraits> Default for FlagCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for FlagCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlagCb")
            .field("self", &(self as *const _))
            .field("bits", &self.bits)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// Evaluate one waiter's `(bits, mode)` condition against the group's
/// current pattern `flag_bits`.
///
/// A match yields the pattern as it stood *before* any consumption - that
/// is the value the waiter gets back - and, under [`FlagWaitMode::CLEAR`],
/// knocks the requested bits out of `flag_bits`. A non-match touches
/// nothing and yields `None`.
fn match_flags(flag_bits: &mut FlagBits, bits: FlagBits, mode: FlagWaitMode) -> Option<FlagBits> {
    let satisfied = if mode.contains(FlagWaitMode::ALL) {
        *flag_bits & bits == bits
    } else {
        *flag_bits & bits != 0
    };

    if !satisfied {
        return None;
    }

    let observed = *flag_bits;
    if mode.contains(FlagWaitMode::CLEAR) {
        *flag_bits &= !bits;
    }
    Some(observed)
}

fn set<Traits: KernelTraits>(
    flag_cb: &'static FlagCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    added_bits: FlagBits,
) -> Result<(), UpdateError> {
    let mut flag_bits = flag_cb.bits.get(&*lock);

    // Return early if no bits will change
    if (flag_bits | added_bits) == flag_bits {
        return Ok(());
    }

    flag_bits |= added_bits;

    // Wake up tasks whose wake-up conditions are now fulfilled.
    //
    // When waking up a task, some bits of `flag_bits` might be consumed if
    // the waiter requested clearing; the consumption is handled by
    // `match_flags`, in queue order.
    let woke_up_any = flag_cb
        .wait_queue
        .wake_up_all_conditional(lock.borrow_mut(), |wait_payload| match wait_payload {
            WaitPayload::Flags { bits, mode } => match_flags(&mut flag_bits, *bits, *mode),
            _ => unreachable!(),
        });

    flag_cb.bits.replace(&mut *lock, flag_bits);

    if woke_up_any {
        task::unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}
