use crate::{error::BadContextError, KernelTraits};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
///
/// A context is waitable iff it is a task context. The distinction from
/// [`expect_task_context`] is kept because callers mean different things:
/// services that may block use this gate, thread-only non-blocking services
/// use the other one.
#[inline]
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    expect_task_context::<Traits>()
}
