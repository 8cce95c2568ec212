//! Bit array structures supporting constant- or logarithmic-time bit scan
//! operations, used to find the most urgent non-empty ready queue.
use core::fmt;

use super::{BinUInteger, Init};

/// A bit array structure supporting fast bit scan operations.
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the first (lowest-numbered) set bit.
    fn find_set(&self) -> Option<usize>;
}

impl PrioBitmap for () {
    fn get(&self, _: usize) -> bool {
        unreachable!()
    }

    fn clear(&mut self, _: usize) {
        unreachable!()
    }

    fn set(&mut self, _: usize) {
        unreachable!()
    }

    fn find_set(&self) -> Option<usize> {
        None
    }
}

/// Stores up to `T::BITS` entries in a single integer.
#[derive(Clone, Copy)]
pub struct OneLevelBitmap<T> {
    bits: T,
}

impl<T: BinUInteger> Init for OneLevelBitmap<T> {
    const INIT: Self = Self { bits: T::INIT };
}

impl<T: BinUInteger> fmt::Debug for OneLevelBitmap<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..T::BITS).filter(|&i| self.bits.get_bit(i)))
            .finish()
    }
}

impl<T: BinUInteger> PrioBitmap for OneLevelBitmap<T> {
    fn get(&self, i: usize) -> bool {
        assert!(i < T::BITS as usize);
        self.bits.get_bit(i as u32)
    }

    fn clear(&mut self, i: usize) {
        assert!(i < T::BITS as usize);
        self.bits.clear_bit(i as u32);
    }

    fn set(&mut self, i: usize) {
        assert!(i < T::BITS as usize);
        self.bits.set_bit(i as u32);
    }

    fn find_set(&self) -> Option<usize> {
        let i = self.bits.trailing_zeros();
        if i == T::BITS {
            None
        } else {
            Some(i as usize)
        }
    }
}

/// Stores up to `WORD_LEN * LEN` entries. The first level tracks which words
/// of the second level are non-zero.
#[derive(Clone, Copy)]
pub struct TwoLevelBitmap<T, const LEN: usize> {
    // Invariant: `first.get_bit(i) == (second[i] != 0)`
    first: T,
    second: [Word; LEN],
}

type Word = usize;
const WORD_LEN: usize = usize::BITS as usize;

impl<T: BinUInteger, const LEN: usize> Init for TwoLevelBitmap<T, LEN> {
    const INIT: Self = Self {
        first: T::INIT,
        second: [0; LEN],
    };
}

impl<T: BinUInteger, const LEN: usize> fmt::Debug for TwoLevelBitmap<T, LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.second.iter().enumerate().flat_map(|(group_i, group)| {
                (0..WORD_LEN)
                    .filter(move |&i| group.get_bit(i as u32))
                    .map(move |subgroup_i| subgroup_i + group_i * WORD_LEN)
            }))
            .finish()
    }
}

impl<T: BinUInteger, const LEN: usize> PrioBitmap for TwoLevelBitmap<T, LEN> {
    fn get(&self, i: usize) -> bool {
        self.second[i / WORD_LEN].get_bit((i % WORD_LEN) as u32)
    }

    fn clear(&mut self, i: usize) {
        let group = &mut self.second[i / WORD_LEN];
        group.clear_bit((i % WORD_LEN) as u32);
        if *group == 0 {
            self.first.clear_bit((i / WORD_LEN) as u32);
        }
    }

    fn set(&mut self, i: usize) {
        let group = &mut self.second[i / WORD_LEN];
        group.set_bit((i % WORD_LEN) as u32);
        self.first.set_bit((i / WORD_LEN) as u32);
    }

    fn find_set(&self) -> Option<usize> {
        let group_i = self.first.trailing_zeros();
        if group_i == T::BITS {
            return None;
        }
        let group = self.second[group_i as usize];
        let subgroup_i = group.trailing_zeros() as usize;
        debug_assert_ne!(subgroup_i, WORD_LEN);
        Some(subgroup_i + group_i as usize * WORD_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8], bitmap_len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if bitmap_len == 0 {
                None
            } else if let Some(instr) = bytecode.get(i..i + 5) {
                i += 5;

                let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % bitmap_len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &impl PrioBitmap, bitmap_len: usize) -> Vec<usize> {
        (0..bitmap_len).filter(|&i| bitmap.get(i)).collect()
    }

    fn test_inner<T: PrioBitmap>(bytecode: Vec<u8>, size: usize) {
        let mut subject = T::INIT;
        let mut reference = BTreePrioBitmap::new();

        for cmd in interpret(&bytecode, size) {
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
        }

        assert_eq!(subject.find_set(), reference.find_set());
        assert_eq!(enum_set_bits(&subject, size), reference.enum_set_bits());
    }

    #[quickcheck]
    fn one_level_u8(bytecode: Vec<u8>) {
        test_inner::<OneLevelBitmap<u8>>(bytecode, 8);
    }

    #[quickcheck]
    fn one_level_u32(bytecode: Vec<u8>) {
        test_inner::<OneLevelBitmap<u32>>(bytecode, 32);
    }

    #[quickcheck]
    fn one_level_u128(bytecode: Vec<u8>) {
        test_inner::<OneLevelBitmap<u128>>(bytecode, 128);
    }

    #[quickcheck]
    fn two_level_small(bytecode: Vec<u8>) {
        test_inner::<TwoLevelBitmap<u8, 8>>(bytecode, WORD_LEN * 8);
    }

    #[quickcheck]
    fn two_level_large(bytecode: Vec<u8>) {
        test_inner::<TwoLevelBitmap<u32, 32>>(bytecode, WORD_LEN * 32);
    }
}
