use super::Init;

/// Untyped storage of the specified size and alignment.
///
/// The alignment is realized by [`elain::Align`], so `ALIGN` must be one of
/// its supported values. This is intended to be wrapped by
/// [`RawCell`](super::RawCell) and used as a task stack region.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct AlignedStorage<const LEN: usize, const ALIGN: usize>(elain::Align<ALIGN>, [u8; LEN])
where
    elain::Align<ALIGN>: elain::Alignment;

impl<const LEN: usize, const ALIGN: usize> Init for AlignedStorage<LEN, ALIGN>
where
    elain::Align<ALIGN>: elain::Alignment,
{
    const INIT: Self = Self(elain::Align::NEW, [0; LEN]);
}

impl<const LEN: usize, const ALIGN: usize> AlignedStorage<LEN, ALIGN>
where
    elain::Align<ALIGN>: elain::Alignment,
{
    pub const fn as_ptr(&self) -> *const u8 {
        self.1.as_ptr()
    }
}
