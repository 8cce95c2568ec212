//! Error codes returned by kernel services
//!
//! Expected outcomes are represented by per-operation error enums, each of
//! which is a subset of [`ResultCode`]. Precondition violations (operating on
//! a deleted object, calling a thread-only service from an interrupt handler)
//! are programming errors and are caught by assertion gates instead.
use core::fmt;

/// All result codes known to the kernel, at the ABI level.
///
/// A successful blocking operation reports a delivered value (such as an
/// event word or a flag pattern) through the `Ok` side of the typed API, so
/// only `Success` and the failure codes need numeric representations.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed.
    Success = 0,
    /// The deadline was reached before the resource became available, or an
    /// immediate operation found the resource contended.
    Timeout = -1,
    /// The object was killed while the caller was blocked on it, or the
    /// joined task was killed.
    Stopped = -2,
    /// The caller does not own the mutex it tried to release.
    NotOwner = -3,
    /// The operation would deadlock on a resource the caller already owns.
    WouldDeadlock = -4,
    /// The previous owner of the mutex terminated while holding the lock.
    Abandoned = -5,
    /// A counter would exceed its maximum value.
    QueueOverflow = -6,
    /// The allocator was unable to provide storage.
    NoMemory = -7,
    /// A parameter is outside the accepted domain.
    BadParam = -8,
    /// The object is not in a state that permits the operation.
    BadObjectState = -9,
    /// The operation is not permitted in the calling context.
    BadContext = -10,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Into:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident ),* $(,)*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as i8 ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error_intos!($Name, [ $( $Variant ),* ], $( $Into ),*);
    };
}

// `macro_rules!` cannot directly nest a repetition over `$Variant` inside a
// repetition over `$Into` (they're independent sequences, not a zip/product),
// so the per-`$Into` `From` impls are generated by recursing over the `$Into`
// list one path at a time, with the (already-known) variant list passed
// through as a frozen token group.
macro_rules! define_error_intos {
    ($Name:ident, [ $( $Variant:ident ),* ], ) => {};
    ($Name:ident, [ $( $Variant:ident ),* ], $Into:path $(, $Rest:path )*) => {
        impl From<$Name> for $Into {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error_intos!($Name, [ $( $Variant ),* ], $( $Rest ),*);
    };
}

define_error! {
    /// Error type for blocking operations without a timeout.
    #[into(WaitTimeoutError)]
    #[into(JoinTaskError)]
    #[into(LockMutexError)]
    #[into(SleepError)]
    pub enum WaitError {
        BadContext,
        Stopped,
    }
}

define_error! {
    /// Error type for blocking operations with a timeout.
    #[into(LockMutexTimeoutError)]
    pub enum WaitTimeoutError {
        BadContext,
        BadParam,
        Timeout,
        Stopped,
    }
}

define_error! {
    /// Error type for non-blocking (immediate) acquisition attempts.
    pub enum PollError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for non-blocking state updates (`give`, `set`, `signal`
    /// without a counter bound, timer control, `kill`).
    pub enum UpdateError {
        BadContext,
    }
}

define_error! {
    /// Error type for non-blocking state queries.
    pub enum QueryError {
        BadContext,
    }
}

define_error! {
    /// Error type for semaphore signal operations.
    pub enum SignalSemaphoreError {
        BadContext,
        QueueOverflow,
    }
}

define_error! {
    /// Error type for blocking mutex acquisition.
    pub enum LockMutexError {
        BadContext,
        WouldDeadlock,
        BadParam,
        Stopped,
        Abandoned,
    }
}

define_error! {
    /// Error type for blocking mutex acquisition with a timeout.
    pub enum LockMutexTimeoutError {
        BadContext,
        BadParam,
        Timeout,
        WouldDeadlock,
        Stopped,
        Abandoned,
    }
}

define_error! {
    /// Error type for non-blocking mutex acquisition.
    pub enum TryLockMutexError {
        BadContext,
        BadParam,
        Timeout,
        WouldDeadlock,
        Abandoned,
    }
}

define_error! {
    /// Error type for mutex release.
    pub enum UnlockMutexError {
        BadContext,
        NotOwner,
        BadObjectState,
    }
}

define_error! {
    /// Error type for restoring an abandoned robust mutex to the consistent
    /// state.
    pub enum MarkConsistentMutexError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for task activation.
    pub enum ActivateTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for task termination.
    pub enum TerminateTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for joining a task.
    pub enum JoinTaskError {
        BadContext,
        BadParam,
        BadObjectState,
        Stopped,
    }
}

define_error! {
    /// Error type for detaching a task.
    pub enum DetachTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for changing a task's base priority.
    pub enum SetTaskPriorityError {
        BadContext,
        BadParam,
        BadObjectState,
    }
}

define_error! {
    /// Error type for reading a task's priority.
    pub enum GetTaskPriorityError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for suspending a task.
    pub enum SuspendTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for resuming a suspended task.
    pub enum ResumeTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for delivering notification flags to a task.
    pub enum GiveFlagsError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for the sleep family.
    pub enum SleepError {
        BadContext,
        BadParam,
        Stopped,
    }
}

define_error! {
    /// Error type for relinquishing the processor.
    pub enum YieldError {
        BadContext,
    }
}

define_error! {
    /// Error type for identifying the running task.
    pub enum GetCurrentTaskError {
        BadContext,
    }
}

define_error! {
    /// Error type for manipulating the CPU Lock state.
    pub enum CpuLockError {
        BadContext,
    }
}

define_error! {
    /// Error type for reconfiguring a software timer.
    pub enum SetTimerError {
        BadContext,
        BadParam,
    }
}

#[cfg(feature = "alloc")]
define_error! {
    /// Error type for dynamic object construction.
    pub enum CreateError {
        BadContext,
        NoMemory,
    }
}

// Internal sub-errors
// ---------------------------------------------------------------------------

define_error! {
    /// `BadContext`
    #[into(WaitError)]
    #[into(WaitTimeoutError)]
    #[into(PollError)]
    #[into(UpdateError)]
    #[into(QueryError)]
    #[into(SignalSemaphoreError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(MarkConsistentMutexError)]
    #[into(ActivateTaskError)]
    #[into(TerminateTaskError)]
    #[into(JoinTaskError)]
    #[into(DetachTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskPriorityError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(GiveFlagsError)]
    #[into(SleepError)]
    #[into(YieldError)]
    #[into(GetCurrentTaskError)]
    #[into(SetTimerError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

#[cfg(feature = "alloc")]
impl From<BadContextError> for CreateError {
    #[inline]
    fn from(x: BadContextError) -> Self {
        match x {
            BadContextError::BadContext => Self::BadContext,
        }
    }
}

define_error! {
    /// `BadParam`
    #[into(WaitTimeoutError)]
    #[into(LockMutexTimeoutError)]
    #[into(SetTaskPriorityError)]
    #[into(SleepError)]
    #[into(SetTimerError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_error! {
    /// `BadObjectState`
    #[into(UnlockMutexError)]
    #[into(MarkConsistentMutexError)]
    #[into(ActivateTaskError)]
    #[into(TerminateTaskError)]
    #[into(JoinTaskError)]
    #[into(DetachTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskPriorityError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(GiveFlagsError)]
    pub(crate) enum BadObjectStateError {
        BadObjectState,
    }
}

define_error! {
    /// Some of the error codes shared by [`TryLockMutexError`],
    /// [`LockMutexError`], and [`LockMutexTimeoutError`]. Used internally
    /// by the mutex implementations.
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    pub(crate) enum LockMutexPrecheckError {
        WouldDeadlock,
        BadParam,
    }
}

/// The portion of [`WaitTimeoutError`] that a wake-upper may deposit as a
/// wait result.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum WaitAbort {
    Timeout,
    Stopped,
}

impl From<WaitAbort> for WaitTimeoutError {
    #[inline]
    fn from(x: WaitAbort) -> Self {
        match x {
            WaitAbort::Timeout => Self::Timeout,
            WaitAbort::Stopped => Self::Stopped,
        }
    }
}

/// Convert a wait result to `WaitError`, panicking if it's
/// `WaitAbort::Timeout`. Used by waits that never registered a timeout.
#[inline]
pub(crate) fn expect_not_timeout(e: WaitAbort) -> WaitError {
    match e {
        WaitAbort::Stopped => WaitError::Stopped,
        WaitAbort::Timeout => unreachable!("got timeout result for a non-timeout wait"),
    }
}
