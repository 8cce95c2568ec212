//! Manages timeouts (timed events) and the kernel's notion of time.
//!
//! # Ticks
//!
//! **A tick** is a point of time that can be used as a reference to
//! represent points of time in proximity. The first tick is created at boot
//! time. A new tick is created whenever [`PortToKernel::timer_tick`] is
//! called and whenever a new timeout is registered.
//!
//! The kernel tracks the latest tick that was created, and derives the
//! current **event time** by comparing the value of
//! [`PortTimer::tick_count`] against the value it had on the latest tick.
//! It's important for the port to announce ticks at a steady rate: tick
//! counts have a limited range (`0..=MAX_TICK_COUNT`), and the correct
//! duration between the current time and the last tick can't be recovered
//! if they are too far apart.
//!
//! [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
//! [`PortTimer::tick_count`]: crate::PortTimer::tick_count
//!
//! # Event times
//!
//! Event times wrap around at 2³². The current event time (CET) is a mobile
//! point on this circle; the arrival times of registered timeouts are
//! immobile points. Newly registered timeouts always lie in
//! `CET ..= CET + MAX_DELAY` (the *enqueueable zone*). Timeouts may fall
//! behind the CET by up to `HARD_HEADROOM` because of overdue timer
//! interrupts (the *overdue zone*); they are processed by the next call to
//! [`handle_tick`]. The point trailing the CET by `HARD_HEADROOM` is the
//! **critical point**: no timeout ever goes past it, which is what makes
//! the ordering of any two registered arrival times well defined:
//! `x.wrapping_sub(critical_point) < y.wrapping_sub(critical_point)`.
use core::{fmt, marker::PhantomData, ptr::NonNull};

use crate::{
    error::BadParamError,
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockGuardBorrowMut},
    task,
    utils::{
        binary_heap::{BinaryHeap, BinaryHeapCtx},
        Init,
    },
    KernelTraits, UTicks,
};

// ---------------------------------------------------------------------------
// Define a token type granting access to `Timeout::{at, heap_pos}`. The heap
// comparator needs to read these while the heap itself is mutably borrowed
// from its `CpuLockCell`, so they can't be `CpuLockCell`s themselves.

pub(super) struct TimeoutPropToken {
    _nonexhaustive: (),
}

#[derive(Clone, Copy)]
struct TimeoutPropKeyhole;

// This is safe because the only `TimeoutPropToken` of a given kernel is
// stored alongside the heap in `TimeoutGlobals` and can only be borrowed
// with CPU Lock active. (If a program instantiates more than one kernel
// trait type, their tokens are technically interchangeable, but each kernel
// only ever uses its own token with its own cells.)
unsafe impl tokenlock::Token<TimeoutPropKeyhole> for TimeoutPropToken {
    fn eq_id(&self, _: &TimeoutPropKeyhole) -> bool {
        true
    }
}

impl Init for TimeoutPropKeyhole {
    const INIT: Self = Self;
}

/// Cell type that can be accessed by [`TimeoutPropToken`].
type TimeoutPropCell<T> = tokenlock::TokenLock<T, TimeoutPropKeyhole>;

// Types representing times
// ---------------------------------------------------------------------------

/// Represents an absolute event time with a wrapping range. This is also
/// used to represent a relative time span in ticks.
pub(super) type Time32 = u32;

/// The maximum relative delay accepted when registering a timeout.
pub const MAX_DELAY: UTicks = 1 << 31;

/// The extent of how overdue the firing of [`timer_tick`] can be without
/// breaking the kernel timing algorithm.
///
/// [`timer_tick`]: crate::PortToKernel::timer_tick
const HARD_HEADROOM: Time32 = 1 << 30;

/// A value of type [`Time32`] used by software timers to represent an absent
/// delay or period. Never a valid arrival time parameter.
pub(super) const UNSET_DELAY: Time32 = u32::MAX;

/// Validate a relative delay given as a system call parameter.
#[inline]
pub(super) fn checked_delay(delay: UTicks) -> Result<Time32, BadParamError> {
    if delay <= MAX_DELAY {
        Ok(delay)
    } else {
        Err(BadParamError::BadParam)
    }
}

/// Convert an absolute tick given as a system call parameter to a relative
/// delay from now. An absolute time that is not strictly within the next
/// [`MAX_DELAY`] ticks is considered to have already passed and maps to
/// zero (the immediate form).
pub(super) fn delta_until_tick<Traits: KernelTraits>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    tick: UTicks,
) -> Time32 {
    let delta = tick.wrapping_sub(current_time(lock));
    if delta > MAX_DELAY {
        0
    } else {
        delta
    }
}

/// The three ways a sleeping task's wake-up time can be specified.
#[derive(Debug, Clone, Copy)]
pub(super) enum TimeoutArm {
    /// Relative to the current time.
    After(UTicks),
    /// An absolute event time.
    At(UTicks),
    /// Relative to the previous expiration time of the same timeout, so
    /// that a periodic wake-up does not accumulate drift.
    AfterPrevious(UTicks),
}

// ---------------------------------------------------------------------------

/// A kernel-global state for timed event management.
pub(super) struct TimeoutGlobals<Traits, TimeoutHeap: 'static> {
    /// The value of [`PortTimer::tick_count`] on the previous tick.
    ///
    /// [`PortTimer::tick_count`]: crate::PortTimer::tick_count
    last_tick_count: CpuLockCell<Traits, UTicks>,

    /// The event time on the previous tick.
    last_tick_time: CpuLockCell<Traits, Time32>,

    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival time, and the [`TimeoutPropToken`] used to access the
    /// contents of [`Timeout`]'s fields.
    heap_and_prop_token: CpuLockCell<Traits, TimeoutHeapAndPropToken<TimeoutHeap>>,

    /// Flag indicating whether `handle_tick` is in progress or not.
    handle_tick_in_progress: CpuLockCell<Traits, bool>,
}

struct TimeoutHeapAndPropToken<TimeoutHeap: 'static> {
    heap: TimeoutHeap,
    prop_token: TimeoutPropToken,
}

impl<Traits, TimeoutHeap: Init + 'static> Init for TimeoutGlobals<Traits, TimeoutHeap> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        last_tick_count: Init::INIT,
        last_tick_time: Init::INIT,
        heap_and_prop_token: CpuLockCell::new(TimeoutHeapAndPropToken {
            heap: Init::INIT,
            prop_token: TimeoutPropToken { _nonexhaustive: () },
        }),
        handle_tick_in_progress: Init::INIT,
    };
}

impl<Traits: KernelTraits, TimeoutHeap: fmt::Debug> fmt::Debug
    for TimeoutGlobals<Traits, TimeoutHeap>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("last_tick_count", &self.last_tick_count)
            .field("last_tick_time", &self.last_tick_time)
            .field(
                "heap",
                &self
                    .heap_and_prop_token
                    .debug_fmt_with(|x, f| x.heap.fmt(f)),
            )
            .field("handle_tick_in_progress", &self.handle_tick_in_progress)
            .finish()
    }
}

/// An internal utility to access `TimeoutGlobals`.
trait KernelTimeoutGlobalsExt: KernelTraits {
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap>;
}

impl<T: KernelTraits> KernelTimeoutGlobalsExt for T {
    /// Shortcut for `&Self::state().timeout`.
    #[inline(always)]
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap> {
        &Self::state().timeout
    }
}

// Timeouts
// ---------------------------------------------------------------------------

/// A timeout (timed event).
///
/// Once registered by [`insert_timeout`], a `Timeout` must stay in the same
/// memory location until it's unregistered; the kernel only ever embeds
/// `Timeout`s in `'static` control blocks, which guarantees this.
///
/// A `Timeout` is unregistered in one of the following ways:
///
///  - On expiration, right before its callback function is called.
///  - [`remove_timeout`] can unregister a `Timeout` at any time.
pub(super) struct Timeout<Traits: KernelTraits> {
    /// The arrival time of the timeout. This is *an event time*.
    at: TimeoutPropCell<Time32>,

    /// The position of this timeout in the timeout heap.
    /// [`HEAP_POS_NONE`] indicates this timeout is not included in the heap.
    heap_pos: TimeoutPropCell<usize>,

    /// Callback function.
    callback: TimeoutFn<Traits>,

    _phantom: PhantomData<Traits>,
}

/// Timeout callback function. Receives the expired `Timeout` itself, from
/// which the containing control block can be recovered.
///
/// The callback function is called with CPU Lock active in an interrupt
/// context when the associated [`Timeout`] expires.
///
/// The callback function may wake up tasks. When it does that, it doesn't
/// have to call `unlock_cpu_and_check_preemption` or `yield_cpu` - that's
/// automatically taken care of by [`handle_tick`].
pub(super) type TimeoutFn<Traits> =
    fn(&'static Timeout<Traits>, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// Value of [`Timeout::heap_pos`] indicating the timeout is not included in
/// the heap.
const HEAP_POS_NONE: usize = usize::MAX;

impl<Traits: KernelTraits> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("self", &(self as *const _))
            .field("callback", &self.callback)
            .finish()
    }
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Construct a `Timeout`.
    ///
    /// The expiration time is initialized to zero.
    pub(super) const fn new(callback: TimeoutFn<Traits>) -> Self {
        Self {
            at: TimeoutPropCell::new(TimeoutPropKeyhole, 0),
            heap_pos: TimeoutPropCell::new(TimeoutPropKeyhole, HEAP_POS_NONE),
            callback,
            _phantom: PhantomData,
        }
    }

    /// Get a flag indicating whether the `Timeout` is currently in the heap.
    pub(super) fn is_linked(&self, lock: CpuLockGuardBorrowMut<'_, Traits>) -> bool {
        let prop_token = &Traits::g_timeout().heap_and_prop_token.read(&*lock).prop_token;

        *self.heap_pos.read(prop_token) != HEAP_POS_NONE
    }

    /// Configure the `Timeout` to expire in the specified duration.
    pub(super) fn set_expiration_after(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        duration_time32: Time32,
    ) {
        debug_assert_ne!(duration_time32, UNSET_DELAY);

        let at = current_time(lock.borrow_mut()).wrapping_add(duration_time32);
        self.set_at_raw(lock, at);
    }

    /// Advance the `Timeout`'s expiration time by the specified duration.
    ///
    /// Intended to be used by periodic events before re-registering the
    /// `Timeout`, so that the delay between the activations does not drift
    /// away from the ideal interval.
    pub(super) fn adjust_expiration(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
        duration_time32: Time32,
    ) {
        debug_assert_ne!(duration_time32, UNSET_DELAY);

        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        let at = self.at.read(prop_token).wrapping_add(duration_time32);
        *self.at.write(prop_token) = at;
    }

    /// Calculate the duration until this timeout is reached. Returns `0` if
    /// the timeout is already overdue.
    #[inline]
    pub(super) fn saturating_duration_until_timeout(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    ) -> Time32 {
        let current_time = current_time(lock.borrow_mut());

        let prop_token = &Traits::g_timeout().heap_and_prop_token.read(&*lock).prop_token;

        saturating_duration_until_timeout(self, current_time, prop_token)
    }

    /// Get the raw expiration time.
    ///
    /// For an unlinked `Timeout` this is also useful for storing arbitrary
    /// data, such as a preserved remaining delay.
    pub(super) fn at_raw(&self, lock: CpuLockGuardBorrowMut<'_, Traits>) -> Time32 {
        let prop_token = &Traits::g_timeout().heap_and_prop_token.read(&*lock).prop_token;

        *self.at.read(prop_token)
    }

    /// Set the raw expiration time, returning the modified instance of
    /// `self`. Useful for storing arbitrary data in an unlinked `Timeout`
    /// at construction time.
    pub(super) const fn with_at_raw(mut self, at: Time32) -> Self {
        self.at = TimeoutPropCell::new(TimeoutPropKeyhole, at);
        self
    }

    /// Set the raw expiration time.
    pub(super) fn set_at_raw(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>, value: Time32) {
        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        *self.at.write(prop_token) = value;
    }
}

/// A reference to a [`Timeout`].
pub struct TimeoutRef<Traits: KernelTraits>(NonNull<Timeout<Traits>>);

// Safety: `Timeout` is `Send + Sync`
unsafe impl<Traits: KernelTraits> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

/// Used when manipulating the timeout heap. Provides the correct comparator
/// function for [`Timeout`]s and keeps [`Timeout::heap_pos`] up-to-date.
struct TimeoutHeapCtx<'a> {
    critical_point: Time32,
    prop_token: &'a mut TimeoutPropToken,
}

impl<Traits: KernelTraits> BinaryHeapCtx<TimeoutRef<Traits>> for TimeoutHeapCtx<'_> {
    #[inline]
    fn lt(&mut self, x: &TimeoutRef<Traits>, y: &TimeoutRef<Traits>) -> bool {
        // Safety: `x` and `y` are in the heap, so the pointees must be valid
        let (x, y) = unsafe {
            (
                *x.0.as_ref().at.read(&*self.prop_token),
                *y.0.as_ref().at.read(&*self.prop_token),
            )
        };
        let critical_point = self.critical_point;
        x.wrapping_sub(critical_point) < y.wrapping_sub(critical_point)
    }

    #[inline]
    fn on_move(&mut self, e: &mut TimeoutRef<Traits>, new_index: usize) {
        // Safety: `e` is in the heap, so the pointee must be valid
        *unsafe { e.0.as_ref() }.heap_pos.write(&mut *self.prop_token) = new_index;
    }
}

// Initialization
// ---------------------------------------------------------------------------

impl<Traits: KernelTraits, TimeoutHeap> TimeoutGlobals<Traits, TimeoutHeap> {
    /// Initialize the timekeeping system.
    pub(super) fn init(&self, mut lock: CpuLockGuardBorrowMut<'_, Traits>) {
        // Mark the first tick
        // Safety: CPU Lock active
        self.last_tick_count
            .replace(&mut *lock, unsafe { Traits::tick_count() });

        // Schedule the next tick. There are no timeouts registered at the
        // moment, so use `MAX_TIMEOUT`.
        // Safety: CPU Lock active
        unsafe { Traits::pend_tick_after(Traits::MAX_TIMEOUT) };
    }
}

// Global time management
// ---------------------------------------------------------------------------

/// Calculate the elapsed time since the last tick.
///
/// Returns two values:
///
///  1. The duration in range `0..=Traits::MAX_TICK_COUNT`.
///  2. The value of `Traits::tick_count()` used for the calculation.
#[inline]
fn duration_since_last_tick<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
) -> (Time32, Time32) {
    // Safety: CPU Lock active
    let tick_count = unsafe { Traits::tick_count() };

    let last_tick_count = Traits::g_timeout().last_tick_count.get(&*lock.borrow_mut());

    // Guess the current time, taking the wrap-around behavior of the tick
    // count into account. We want to find the smallest `elapsed` satisfying
    //
    //     (last_tick_count + elapsed) % (MAX_TICK_COUNT + 1) == tick_count
    //
    let elapsed = if Traits::MAX_TICK_COUNT == UTicks::MAX || tick_count >= last_tick_count {
        // last_tick_count    tick_count
        // ┌──────┴────────────────┴────────┬───────────┐
        // 0      ╚════════════════╝  MAX_TICK_COUNT   MAX
        //              elapsed
        tick_count.wrapping_sub(last_tick_count)
    } else {
        //   tick_count     last_tick_count
        // ┌──────┴────────────────┴────────┬───────────┐
        // 0 ═════╝                ╚════════           MAX
        //                          elapsed
        tick_count.wrapping_sub(last_tick_count) - (UTicks::MAX - Traits::MAX_TICK_COUNT)
    };

    (elapsed, tick_count)
}

/// Create a tick now. Returns the duration elapsed since the previous tick.
fn mark_tick<Traits: KernelTraits>(mut lock: CpuLockGuardBorrowMut<'_, Traits>) -> Time32 {
    let (duration_since_last_tick, tick_count) =
        duration_since_last_tick::<Traits>(lock.borrow_mut());

    let g_timeout = Traits::g_timeout();
    g_timeout.last_tick_count.replace(&mut *lock, tick_count);
    g_timeout.last_tick_time.replace_with(&mut *lock, |old_value| {
        old_value.wrapping_add(duration_since_last_tick)
    });

    duration_since_last_tick
}

/// Get the current event time.
pub(super) fn current_time<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
) -> Time32 {
    let (duration_since_last_tick, _) = duration_since_last_tick::<Traits>(lock.borrow_mut());

    Traits::g_timeout()
        .last_tick_time
        .get(&*lock)
        .wrapping_add(duration_since_last_tick)
}

#[cfg_attr(doc, svgbobdoc::transform)]
/// Implements [`PortToKernel::timer_tick`].
///
/// Fires every overdue timeout, consumes the running task's time slice, and
/// schedules the next timer interrupt for the earliest remaining event:
///
/// ```svgbob
///  critical point   overdue        CET      enqueueable
///        |  ▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃ |
/// ═══════╧═════o══════o════════════╧═══o═════════o═════════
///            fired  fired            pending   pending
/// ```
///
/// Precondition: CPU Lock inactive, an interrupt context
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
#[inline]
pub(super) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = lock_cpu::<Traits>().unwrap();

    let elapsed = mark_tick(lock.borrow_mut());

    // Consume the running task's time slice
    task::consume_time_slice(lock.borrow_mut(), elapsed);

    let g_timeout = Traits::g_timeout();
    let current_time = g_timeout.last_tick_time.get(&*lock);
    let critical_point = critical_point(current_time);

    // Set `handle_tick_in_progress`. This will suppress redundant calls to
    // `pend_next_tick` made by timeout handlers.
    g_timeout.handle_tick_in_progress.replace(&mut *lock, true);

    // Process expired timeouts.
    //
    // For each iteration, check the top element (representing the earliest
    // timeout) in the heap. Exit from the loop if the heap is empty.
    loop {
        let (callback, timeout) = {
            let TimeoutHeapAndPropToken { heap, prop_token } =
                g_timeout.heap_and_prop_token.write(&mut *lock);

            let Some(&timeout_ref) = heap.first() else { break };

            // Safety: `timeout_ref` is in the heap, meaning the pointee is
            // valid. All registered timeouts live in `'static` control
            // blocks.
            let timeout: &'static Timeout<Traits> = unsafe { &*timeout_ref.0.as_ptr() };

            // How much time do we have before `timeout` becomes overdue?
            let remaining =
                saturating_duration_until_timeout(timeout, current_time, prop_token);
            if remaining > 0 {
                break;
            }

            // The timeout has expired. Remove it from the heap.
            debug_assert_eq!(*timeout.heap_pos.read(prop_token), 0);
            *timeout.heap_pos.write(prop_token) = HEAP_POS_NONE;

            heap.heap_remove(
                0,
                TimeoutHeapCtx {
                    critical_point,
                    prop_token,
                },
            );

            (timeout.callback, timeout)
        };

        // (Note: the `Timeout` is not considered owned by the heap anymore
        // at this point and might be re-registered by the callback.)

        // Call the callback function.
        lock = callback(timeout, lock);
    }

    g_timeout.handle_tick_in_progress.replace(&mut *lock, false);

    // Schedule the next tick
    pend_next_tick(lock.borrow_mut(), current_time);

    // Callback functions might have woken up some tasks. Check for dispatch
    // and release CPU Lock.
    task::unlock_cpu_and_check_preemption(lock);
}

/// Schedule the next tick.
fn pend_next_tick<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    current_time: Time32,
) {
    let mut delay = Traits::MAX_TIMEOUT;

    // The running task's time slice may expire before the earliest timeout
    if let Some(cap) = task::time_slice_cap(lock.borrow_mut()) {
        delay = delay.min(cap.max(1));
    }

    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.read(&*lock);

    // Check the top element (representing the earliest timeout) in the heap
    if let Some(&timeout_ref) = heap.first() {
        // Safety: `timeout_ref` is in the heap, meaning the pointee is valid
        let timeout = unsafe { timeout_ref.0.as_ref() };

        // How much time do we have before `timeout` becomes overdue?
        delay = delay.min(saturating_duration_until_timeout(
            timeout,
            current_time,
            prop_token,
        ));
    }

    // Safety: CPU Lock active
    unsafe {
        if delay == 0 {
            Traits::pend_tick();
        } else {
            Traits::pend_tick_after(delay);
        }
    }
}

// Timeout management
// ---------------------------------------------------------------------------

/// Find the critical point based on the current event time.
#[inline]
fn critical_point(current_time: Time32) -> Time32 {
    current_time.wrapping_sub(HARD_HEADROOM)
}

/// Calculate the duration until the specified timeout is reached. Returns
/// `0` if the timeout is already overdue.
fn saturating_duration_until_timeout<Traits: KernelTraits>(
    timeout: &Timeout<Traits>,
    current_time: Time32,
    prop_token: &TimeoutPropToken,
) -> Time32 {
    let critical_point = critical_point(current_time);

    let duration_until_violating_critical_point =
        timeout.at.read(prop_token).wrapping_sub(critical_point);

    duration_until_violating_critical_point.saturating_sub(HARD_HEADROOM)
}

/// Register the specified timeout.
pub(super) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    timeout: &'static Timeout<Traits>,
) {
    // For each `Timeout`, there can be only one heap entry pointing to it.
    // `heap_pos` indicates whether there's a corresponding heap entry or
    // not. If we let two entries reside in the heap, removing the first one
    // would falsely mark the `Timeout` as unregistered, leaving the second
    // entry dangling.
    let prop_token = &Traits::g_timeout().heap_and_prop_token.read(&*lock).prop_token;
    assert_eq!(
        *timeout.heap_pos.read(prop_token),
        HEAP_POS_NONE,
        "timeout is already registered",
    );

    let current_time = current_time(lock.borrow_mut());
    let critical_point = critical_point(current_time);

    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    let pos = heap.heap_push(
        TimeoutRef(timeout.into()),
        TimeoutHeapCtx {
            critical_point,
            prop_token: &mut *prop_token,
        },
    );

    // `TimeoutHeapCtx::on_move` should have assigned `heap_pos`
    debug_assert_eq!(*timeout.heap_pos.read(prop_token), pos);

    if !Traits::g_timeout().handle_tick_in_progress.get(&*lock) {
        // (Re-)schedule the next tick
        pend_next_tick(lock, current_time);
    }
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered.
pub(super) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockGuardBorrowMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    let current_time = current_time(lock.borrow_mut());
    let critical_point = critical_point(current_time);

    // Remove `timeout` from the heap.
    //
    // If `heap_pos == HEAP_POS_NONE`, we are supposed to do nothing.
    // `HEAP_POS_NONE` is a huge value, so `heap_remove` will inevitably
    // reject it by bounds check. This way, we can check both for bounds and
    // for `HEAP_POS_NONE` in one fell swoop.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    let heap_pos = *timeout.heap_pos.read(prop_token);

    let timeout_ref = heap.heap_remove(
        heap_pos,
        TimeoutHeapCtx {
            critical_point,
            prop_token: &mut *prop_token,
        },
    );

    let Some(timeout_ref) = timeout_ref else {
        // The cause of failure must be `timeout` not being registered in the
        // first place. (An out-of-bounds `heap_pos` would clearly be a
        // kernel bug.)
        debug_assert_eq!(heap_pos, HEAP_POS_NONE);
        return;
    };

    // The removed element should have pointed to `timeout`
    debug_assert_eq!(timeout_ref.0.as_ptr() as *const _, timeout as *const _);

    *timeout.heap_pos.write(prop_token) = HEAP_POS_NONE;

    if !Traits::g_timeout().handle_tick_in_progress.get(&*lock) {
        // (Re-)schedule the next tick
        pend_next_tick(lock, current_time);
    }
}
