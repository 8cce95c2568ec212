//! Software timers
use core::{fmt, mem::ManuallyDrop};

use crate::{
    error::{QueryError, SetTimerError, UpdateError},
    klock::{self, assume_cpu_lock, lock_cpu, CpuLockGuard, CpuLockGuardBorrowMut},
    object, timeout,
    timeout::Timeout,
    KernelTraits, UTicks,
};

#[cfg(feature = "alloc")]
use crate::error::CreateError;

/// *Timer control block* - the state data of a software timer.
///
/// A timer fires its callback function `delay` ticks after it is started
/// and, if a period is set, every `period` ticks afterwards. The periodic
/// re-arming is relative to the previous expiration, so the activations do
/// not drift even if the callback runs late.
pub struct TimerCb<Traits: KernelTraits> {
    /// The timeout object for the timer.
    ///
    ///  - If the delay is set and the timer is in the Active state, the
    ///    timeout object is linked. The delay is implicitly defined in this
    ///    case.
    ///
    ///  - Otherwise, the timeout object is unlinked, and its raw expiration
    ///    time stores the delay (or [`timeout::UNSET_DELAY`]).
    timeout: ManuallyDrop<Timeout<Traits>>,

    /// `true` iff the timer is in the Active state.
    active: klock::CpuLockCell<Traits, bool>,

    period: klock::CpuLockCell<Traits, timeout::Time32>,

    /// The callback function.
    entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    entry_param: usize,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Construct a `TimerCb` in the Dormant (stopped) state with no delay
    /// and no period.
    pub const fn new(entry_point: fn(usize), entry_param: usize) -> Self {
        Self {
            timeout: ManuallyDrop::new(
                Timeout::new(timer_timeout_handler::<Traits>).with_at_raw(timeout::UNSET_DELAY),
            ),
            active: klock::CpuLockCell::new(false),
            period: klock::CpuLockCell::new(timeout::UNSET_DELAY),
            entry_point,
            entry_param,
            res: object::ObjectRes::new(),
        }
    }

    fn timeout_ref(&'static self) -> &'static Timeout<Traits> {
        &self.timeout
    }

    /// Start the timer: schedule the callback to run after the configured
    /// delay.
    ///
    /// This service is interrupt-safe.
    pub fn start(&'static self) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        start_timer(lock.borrow_mut(), self);
        Ok(())
    }

    /// Stop the timer, preserving the remaining delay.
    ///
    /// This service is interrupt-safe.
    pub fn stop(&'static self) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        stop_timer(lock.borrow_mut(), self);
        Ok(())
    }

    /// Set the delay until the next (or first) activation. `None` disarms
    /// the timer without stopping it.
    ///
    /// This service is interrupt-safe.
    pub fn set_delay(&'static self, delay: Option<UTicks>) -> Result<(), SetTimerError> {
        let time32 = match delay {
            Some(x) => timeout::checked_delay(x)?,
            None => timeout::UNSET_DELAY,
        };
        let mut lock = lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        set_timer_delay(lock.borrow_mut(), self, time32);
        Ok(())
    }

    /// Set the activation period. `None` makes the timer one-shot.
    ///
    /// This service is interrupt-safe.
    pub fn set_period(&'static self, period: Option<UTicks>) -> Result<(), SetTimerError> {
        let time32 = match period {
            Some(x) => timeout::checked_delay(x)?,
            None => timeout::UNSET_DELAY,
        };
        let mut lock = lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        self.period.replace(&mut *lock, time32);
        Ok(())
    }

    /// Get a flag indicating whether the timer is in the Active state.
    pub fn is_active(&'static self) -> Result<bool, QueryError> {
        let lock = lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);
        Ok(self.active.get(&*lock))
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Allocate and construct a software timer.
    pub fn create(entry_point: fn(usize), entry_param: usize) -> Result<&'static Self, CreateError> {
        let mut lock = lock_cpu::<Traits>()?;

        let timer: &'static Self =
            object::allocate_value(Self::new(entry_point, entry_param)).ok_or(CreateError::NoMemory)?;
        timer.res.mark_owned(&mut lock);

        Ok(timer)
    }

    /// Stop the timer and release its storage.
    ///
    /// # Safety
    ///
    /// There must be no other references to the timer in use.
    pub unsafe fn delete(&'static self) -> Result<(), UpdateError> {
        self.stop()?;

        let mut lock = lock_cpu::<Traits>()?;
        self.res.release(&mut lock);
        drop(lock);

        // Safety: The object was allocated by `create` (checked by
        // `release`), and the caller vouches for the absence of other users
        unsafe { object::deallocate_value(self) };

        Ok(())
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("timeout", &self.timeout)
            .field("active", &self.active)
            .field("period", &self.period)
            .field("entry_point", &self.entry_point)
            .field("entry_param", &self.entry_param)
            .finish()
    }
}

/// The core portion of `Timer::start`.
fn start_timer<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
) {
    if timer_cb.active.get(&*lock) {
        return;
    }

    // Get the current delay value
    let delay = timer_cb.timeout.at_raw(lock.borrow_mut());

    if delay != timeout::UNSET_DELAY {
        // Schedule the next tick
        timer_cb
            .timeout
            .set_expiration_after(lock.borrow_mut(), delay);
        timeout::insert_timeout(lock.borrow_mut(), timer_cb.timeout_ref());
    }

    timer_cb.active.replace(&mut *lock, true);
}

/// The core portion of `Timer::stop`.
fn stop_timer<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
) {
    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        debug_assert!(timer_cb.active.get(&*lock));

        // Capture the remaining delay value
        let delay = timer_cb
            .timeout
            .saturating_duration_until_timeout(lock.borrow_mut());

        // Unlink the timeout
        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);

        // Store the captured delay value
        timer_cb.timeout.set_at_raw(lock.borrow_mut(), delay);
    }

    timer_cb.active.replace(&mut *lock, false);
}

/// The core portion of `Timer::set_delay`.
fn set_timer_delay<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
    delay: timeout::Time32,
) {
    let is_active = timer_cb.active.get(&*lock);

    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);
    }

    if is_active && delay != timeout::UNSET_DELAY {
        timer_cb
            .timeout
            .set_expiration_after(lock.borrow_mut(), delay);
        timeout::insert_timeout(lock.borrow_mut(), timer_cb.timeout_ref());
    } else {
        timer_cb.timeout.set_at_raw(lock.borrow_mut(), delay);
    }
}

/// The timeout callback function for a timer. Registered as the callback
/// when constructing [`TimerCb::timeout`].
fn timer_timeout_handler<Traits: KernelTraits>(
    timeout_obj: &'static Timeout<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let offset = core::mem::offset_of!(TimerCb<Traits>, timeout);
    // Safety: Every `Timeout` registered with `timer_timeout_handler` as
    // its callback is the one embedded in a `TimerCb`
    let timer_cb: &'static TimerCb<Traits> = unsafe {
        &*((timeout_obj as *const Timeout<Traits>).byte_sub(offset) as *const TimerCb<Traits>)
    };

    // Schedule the next tick
    debug_assert!(!timer_cb.timeout.is_linked(lock.borrow_mut()));
    debug_assert!(timer_cb.active.get(&*lock));

    let period = timer_cb.period.get(&*lock);
    if period == timeout::UNSET_DELAY {
        timer_cb
            .timeout
            .set_at_raw(lock.borrow_mut(), timeout::UNSET_DELAY);
    } else {
        timer_cb.timeout.adjust_expiration(lock.borrow_mut(), period);
        timeout::insert_timeout(lock.borrow_mut(), timer_cb.timeout_ref());
    }

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    (timer_cb.entry_point)(timer_cb.entry_param);

    // Re-acquire CPU Lock
    lock_cpu().unwrap_or_else(|_| unsafe { assume_cpu_lock() })
}
