use core::cell::UnsafeCell;

use super::Init;

/// Like `UnsafeCell`, but implements `Sync`.
///
/// It's the user's responsibility to ensure the absence of data races. The
/// kernel uses this to declare storage (such as task stack regions) that is
/// handed over to a single owner at runtime.
#[repr(transparent)]
pub struct RawCell<T: ?Sized>(UnsafeCell<T>);

unsafe impl<T: ?Sized> Sync for RawCell<T> {}

impl<T> RawCell<T> {
    pub const fn new(x: T) -> Self {
        Self(UnsafeCell::new(x))
    }
}

impl<T: ?Sized> RawCell<T> {
    pub const fn get(&self) -> *mut T {
        self.0.get()
    }
}

impl<T: Init> Init for RawCell<T> {
    const INIT: Self = Self::new(T::INIT);
}
