use core::{fmt, ops};

use super::Init;

/// Unsigned integer types with efficient bit-level operations.
///
/// This trait is implemented for all unsigned primitive integer types and is
/// what the priority bitmap (and other bit-level structures) are generic over.
pub trait BinUInteger:
    Init
    + Clone
    + Copy
    + PartialEq
    + Eq
    + Ord
    + fmt::Debug
    + Send
    + Sync
    + 'static
    + ops::BitAnd<Output = Self>
    + ops::BitOr<Output = Self>
    + ops::BitXor<Output = Self>
    + ops::Not<Output = Self>
{
    /// The number of bits this type can represent.
    const BITS: u32;

    const ZERO: Self;
    const ONE: Self;

    /// Return `true` if and only if `self == 0`.
    fn is_zero(&self) -> bool;

    /// Get the bit at the specified position.
    fn get_bit(&self, i: u32) -> bool;

    /// Set the bit at the specified position.
    fn set_bit(&mut self, i: u32);

    /// Clear the bit at the specified position.
    fn clear_bit(&mut self, i: u32);

    /// Return the number of trailing zeros in the binary representation of
    /// `self`.
    fn trailing_zeros(&self) -> u32;
}

macro_rules! impl_bin_uinteger {
    ($($ty:ty),*) => {
        $(
            impl BinUInteger for $ty {
                const BITS: u32 = <$ty>::BITS;
                const ZERO: Self = 0;
                const ONE: Self = 1;

                #[inline]
                fn is_zero(&self) -> bool {
                    *self == 0
                }

                #[inline]
                fn get_bit(&self, i: u32) -> bool {
                    if i < Self::BITS {
                        (*self >> i) & 1 != 0
                    } else {
                        false
                    }
                }

                #[inline]
                fn set_bit(&mut self, i: u32) {
                    if i < Self::BITS {
                        *self |= 1 << i;
                    }
                }

                #[inline]
                fn clear_bit(&mut self, i: u32) {
                    if i < Self::BITS {
                        *self &= !(1 << i);
                    }
                }

                #[inline]
                fn trailing_zeros(&self) -> u32 {
                    <$ty>::trailing_zeros(*self)
                }
            }
        )*
    };
}

impl_bin_uinteger! { u8, u16, u32, u64, u128, usize }
