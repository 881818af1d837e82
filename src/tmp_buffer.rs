//! Kernel scratch memory.
//!
//! A kernel that needs working memory declares a byte count through its
//! registration's temp-size function. The execution layer hands back one
//! [`TmpBuffer`] of at least that size, and the kernel carves it into typed
//! regions with a [`TmpBufferArena`]: one allocation, several logical
//! regions, every region bounds-checked and aligned to [`TMP_BUFFER_ALIGN`].

use crate::dtype::Element;
use crate::error::{OpError, Result};

/// Alignment, in bytes, of every temp-buffer size and region offset.
pub const TMP_BUFFER_ALIGN: usize = 8;

/// Rounds `n` up to the next multiple of `align`.
#[must_use]
pub const fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Rounds a byte count up to [`TMP_BUFFER_ALIGN`].
#[must_use]
pub const fn aligned_size(n: usize) -> usize {
    round_up(n, TMP_BUFFER_ALIGN)
}

const WORD: usize = size_of::<u64>();

/// Owned scratch storage, sized in bytes and backed by 8-byte words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TmpBuffer {
    words: Vec<u64>,
}

impl TmpBuffer {
    /// Allocates at least `bytes` of zeroed scratch space.
    #[must_use]
    pub fn with_size(bytes: usize) -> Self {
        Self {
            words: vec![0; bytes.div_ceil(WORD)],
        }
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.words.len() * WORD
    }

    /// Starts carving regions out of the whole buffer.
    pub fn arena(&mut self) -> TmpBufferArena<'_> {
        TmpBufferArena { rest: &mut self.words }
    }
}

/// Bump allocator handing out disjoint typed regions of a [`TmpBuffer`].
///
/// Each region borrows the buffer for `'a`, so regions taken earlier stay
/// usable while later ones are carved out.
#[derive(Debug, Default)]
pub struct TmpBufferArena<'a> {
    rest: &'a mut [u64],
}

impl<'a> TmpBufferArena<'a> {
    /// Bytes not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.rest.len() * WORD
    }

    /// Takes the next region of `len` elements of `T`.
    ///
    /// The region occupies `aligned_size(len * size_of::<T>())` bytes.
    ///
    /// # Errors
    ///
    /// [`OpError::TmpBufferTooSmall`] if fewer bytes remain.
    pub fn take<T: Element>(&mut self, len: usize) -> Result<&'a mut [T]> {
        let requested = aligned_size(len * size_of::<T>());
        let available = self.remaining();
        if requested > available {
            return Err(OpError::TmpBufferTooSmall {
                requested,
                available,
            });
        }
        let rest = core::mem::take(&mut self.rest);
        let (region, rest) = rest.split_at_mut(requested / WORD);
        self.rest = rest;
        Ok(&mut bytemuck::cast_slice_mut::<u64, T>(region)[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_aligned() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(1), 8);
        assert_eq!(aligned_size(8), 8);
        assert_eq!(aligned_size(12), 16);
        assert_eq!(round_up(300, 256), 512);
    }

    #[test]
    fn hands_out_disjoint_regions() {
        let mut buf = TmpBuffer::with_size(aligned_size(3 * 4) + aligned_size(2 * 8));
        let mut arena = buf.arena();
        let a = arena.take::<f32>(3).unwrap();
        let b = arena.take::<f64>(2).unwrap();
        a.copy_from_slice(&[1.0, 2.0, 3.0]);
        b.copy_from_slice(&[4.0, 5.0]);
        assert_eq!(a, &[1.0, 2.0, 3.0]);
        assert_eq!(b, &[4.0, 5.0]);
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn refuses_oversized_region() {
        let mut buf = TmpBuffer::with_size(8);
        let mut arena = buf.arena();
        let err = arena.take::<f64>(2).unwrap_err();
        assert_eq!(
            err,
            OpError::TmpBufferTooSmall {
                requested: 16,
                available: 8
            }
        );
    }

    #[test]
    fn empty_region_costs_nothing() {
        let mut buf = TmpBuffer::default();
        let mut arena = buf.arena();
        assert!(arena.take::<f32>(0).unwrap().is_empty());
    }
}
