//! Kernel state locking mechanism
//!
//! Every mutable piece of kernel-global state is wrapped in a
//! [`CpuLockCell`], which can only be read or written while CPU Lock is
//! active. The borrow checker thereby enforces the critical-section
//! discipline: code that has no [`CpuLockGuard`] (or a borrow of one) cannot
//! touch kernel state at all.
use core::{fmt, marker::PhantomData, ops};

use crate::{
    error::BadContextError,
    utils::{intrusive_list::CellLike, Init},
    PortThreading,
};

/// The key that "unlocks" [`CpuLockCell`]. There is at most one value of
/// this type at any point in time, owned by [`CpuLockGuard`].
#[non_exhaustive]
pub(crate) struct CpuLockToken<Traits> {
    _phantom: PhantomData<Traits>,
}

/// The keyhole type for [`tokenlock::TokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
#[derive(Clone, Copy)]
pub(crate) struct CpuLockKeyhole<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits> fmt::Debug for CpuLockKeyhole<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuLockKeyhole").finish()
    }
}

// This is safe because `CpuLockToken` can only be obtained through
// `CpuLockGuard`, and there is at most one instance of `CpuLockGuard` at any
// point in time
unsafe impl<Traits> tokenlock::Token<CpuLockKeyhole<Traits>> for CpuLockToken<Traits> {
    fn eq_id(&self, _: &CpuLockKeyhole<Traits>) -> bool {
        true
    }
}

impl<Traits> Init for CpuLockKeyhole<Traits> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(tokenlock::TokenLock::new(CpuLockKeyhole::INIT, x))
    }

    /// Clone the cell's contents.
    #[inline]
    pub(crate) fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Clone,
    {
        self.0.read(token).clone()
    }

    /// Borrow the cell's contents.
    #[inline]
    pub(crate) fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> &'a T {
        self.0.read(token)
    }

    /// Mutably borrow the cell's contents.
    #[inline]
    pub(crate) fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.0.write(token)
    }

    /// Assign a new value, returning the old one.
    #[inline]
    pub(crate) fn replace(&self, token: &mut CpuLockToken<Traits>, value: T) -> T {
        core::mem::replace(self.0.write(token), value)
    }

    /// Compute a new value from the current one and assign it, returning the
    /// old value.
    #[inline]
    pub(crate) fn replace_with(
        &self,
        token: &mut CpuLockToken<Traits>,
        f: impl FnOnce(&mut T) -> T,
    ) -> T {
        let slot = self.0.write(token);
        let new = f(slot);
        core::mem::replace(slot, new)
    }
}

impl<Traits: PortThreading, T: ?Sized> CpuLockCell<Traits, T> {
    /// Return a debug formatting proxy of the cell. The given closure is used
    /// to format the borrowed contents. The proxy acquires CPU Lock by itself
    /// when formatted.
    pub(crate) fn debug_fmt_with<'a, F: 'a + Fn(&T, &mut fmt::Formatter<'_>) -> fmt::Result>(
        &'a self,
        f: F,
    ) -> impl fmt::Debug + 'a {
        struct DebugFmtWith<'a, Traits, T: ?Sized, F> {
            cell: &'a CpuLockCell<Traits, T>,
            f: F,
        }

        impl<Traits: PortThreading, T: ?Sized, F: Fn(&T, &mut fmt::Formatter<'_>) -> fmt::Result>
            fmt::Debug for DebugFmtWith<'_, Traits, T, F>
        {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if let Ok(lock) = lock_cpu() {
                    f.write_str("CpuLockCell(")?;
                    (self.f)(self.cell.0.read(&*lock), f)?;
                    f.write_str(")")
                } else {
                    f.write_str("CpuLockCell(< locked >)")
                }
            }
        }

        DebugFmtWith { cell: self, f }
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.debug_fmt_with(|x, f| x.fmt(f)).fmt(f)
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<'a, Element: Clone, Traits: PortThreading> CellLike<CpuLockGuardBorrowMut<'a, Traits>>
    for CpuLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &CpuLockGuardBorrowMut<'a, Traits>) -> Self::Target {
        self.get(&**key)
    }
    fn set(&self, key: &mut CpuLockGuardBorrowMut<'a, Traits>, value: Self::Target) {
        self.replace(&mut **key, value);
    }
}

impl<'a, Element: Clone, Traits: PortThreading> CellLike<&'a mut CpuLockGuard<Traits>>
    for CpuLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &&'a mut CpuLockGuard<Traits>) -> Self::Target {
        self.get(&***key)
    }
    fn set(&self, key: &mut &'a mut CpuLockGuard<Traits>, value: Self::Target) {
        self.replace(&mut ***key, value);
    }
}

impl<Traits> CpuLockToken<Traits> {
    /// Mint a token value. Every caller must be in a position to guarantee
    /// that no other usable token exists for the same kernel - tokens are
    /// only ever handed out through [`CpuLockGuard`] and its reborrows,
    /// whose `&mut` chains make simultaneous use impossible.
    const fn mint() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

/// Owns the CPU Lock state.
///
/// A live `CpuLockGuard` *is* the critical section: kernel-managed
/// interrupts stay masked until the guard is dropped, and the
/// [`CpuLockToken`] obtained by dereferencing it is what unlocks every
/// [`CpuLockCell`].
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Reborrow the guard as a [`CpuLockGuardBorrowMut`] for passing down a
    /// call chain.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockGuardBorrowMut<'_, Traits> {
        CpuLockGuardBorrowMut {
            token: CpuLockToken::mint(),
            _borrow: PhantomData,
        }
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // The guard came into existence together with the masked state and
        // owns it exclusively, so unmasking here can't be unbalanced
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// A by-value stand-in for `&'a mut CpuLockGuard<Traits>`.
///
/// Kernel internals thread the lock through deep call chains; a real
/// `&mut CpuLockGuard` would be pointer-sized for no benefit (the guard
/// holds no data), while this type is zero-sized. The price is that the
/// compiler won't reborrow it implicitly the way it does with `&mut` - each
/// handoff to a callee needs an explicit
/// [`borrow_mut`](Self::borrow_mut).
pub(crate) struct CpuLockGuardBorrowMut<'a, Traits: PortThreading> {
    token: CpuLockToken<Traits>,
    _borrow: PhantomData<&'a mut CpuLockGuard<Traits>>,
}

impl<'a, Traits: PortThreading> CpuLockGuardBorrowMut<'a, Traits> {
    /// Reborrow for a nested call, leaving `self` usable afterwards.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockGuardBorrowMut<'_, Traits> {
        CpuLockGuardBorrowMut {
            token: CpuLockToken::mint(),
            _borrow: PhantomData,
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuardBorrowMut<'_, Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuardBorrowMut<'_, Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Engage CPU Lock and hand out the guard that owns it.
///
/// This is the entry gate of every kernel service. Failing with
/// `BadContext` when the lock is already held (rather than nesting
/// silently) is what catches services invoked from inside a critical
/// section.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: controlling the interrupt mask is the kernel's job; this is
    // kernel code
    if !unsafe { Traits::try_enter_cpu_lock() } {
        return Err(BadContextError::BadContext);
    }

    // Safety: the mask engaged just now, and the rejection above rules out
    // a preexisting guard
    Ok(unsafe { assume_cpu_lock() })
}

/// Materialize the guard for a CPU Lock state that is already in effect -
/// the interrupt-entry and boot paths, where the port masked interrupts
/// before calling into the kernel.
///
/// # Safety
///
/// CPU Lock must genuinely be active, and no other `CpuLockGuard` may exist
/// anywhere; a second guard would alias the token and unmask interrupts
/// twice.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        token: CpuLockToken::mint(),
    }
}
