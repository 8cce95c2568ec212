use core::{
    cell::{Cell, RefCell, UnsafeCell},
    mem::{ManuallyDrop, MaybeUninit},
    sync::atomic,
};

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self;
}

impl<T: 'static> Init for &'_ [T] {
    const INIT: Self = &[];
}

impl Init for &'_ str {
    const INIT: Self = "";
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = {
        let mut array: [MaybeUninit<T>; LEN] = [const { MaybeUninit::uninit() }; LEN];

        let mut i = 0;
        while i < LEN {
            array[i] = MaybeUninit::new(T::INIT);
            i += 1;
        }

        // Safety: The memory layout of `[MaybeUninit<T>; LEN]` is
        // identical to `[T; LEN]`. We initialized all elements, so it's
        // safe to reinterpret that range as `[T; LEN]`.
        unsafe { transmute_workaround(array) }
    };
}

/// `mem::transmute` can't be used between types of generic sizes.
///
/// # Safety
///
/// See `mem::transmute`.
const unsafe fn transmute_workaround<T, const LEN: usize>(x: [MaybeUninit<T>; LEN]) -> [T; LEN] {
    // Safety: Upheld by the caller
    unsafe {
        let out = core::mem::transmute_copy(&x);
        core::mem::forget(x);
        out
    }
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<T: Init> Init for RefCell<T> {
    const INIT: Self = RefCell::new(T::INIT);
}

impl<T: Init> Init for UnsafeCell<T> {
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T> Init for MaybeUninit<T> {
    const INIT: Self = MaybeUninit::uninit();
}

impl<T: Init> Init for ManuallyDrop<T> {
    const INIT: Self = ManuallyDrop::new(T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::TokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

impl Init for atomic::AtomicBool {
    const INIT: Self = atomic::AtomicBool::new(false);
}

impl<T> Init for atomic::AtomicPtr<T> {
    const INIT: Self = atomic::AtomicPtr::new(core::ptr::null_mut());
}

macro_rules! impl_init {
    (
        $(
            $( #[$meta:meta] )*
            $ty:ty => $value:expr,
        )*
    ) => {
        $(
            $( #[$meta] )*
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    char => '\0',
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    u128 => 0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    i128 => 0,
    usize => 0,
    isize => 0,
    f32 => 0.0,
    f64 => 0.0,
    () => (),
    atomic::AtomicU8 => Self::new(0),
    atomic::AtomicU16 => Self::new(0),
    atomic::AtomicU32 => Self::new(0),
    atomic::AtomicUsize => Self::new(0),
    atomic::AtomicI8 => Self::new(0),
    atomic::AtomicI16 => Self::new(0),
    atomic::AtomicI32 => Self::new(0),
    atomic::AtomicIsize => Self::new(0),
}

macro_rules! tuple_impl_init {
    ( $h:ident, $($t:ident,)* ) => {
        impl<$h: Init, $($t: Init,)*> Init for ($h, $($t,)*) {
            const INIT: Self = (
                $h::INIT,
                $($t::INIT,)*
            );
        }

        tuple_impl_init! { $($t,)* }
    };
    () => {};
}

tuple_impl_init! { A, B, C, D, E, F, G, H, I, J, K, L, }
