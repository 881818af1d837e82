//! Approximate equality of floating point kernel results.
//!
//! Differences are graded into [`ApproxEquality`] tiers relative to the
//! machine epsilon of the element type, so one set of tolerances serves
//! both `f32` and `f64` kernels.

use num_traits::Float;

/// Multiple of epsilon still considered [`ApproxEquality::Precise`].
pub const PRECISE_ULPS: u32 = 4;

/// Multiple of epsilon still considered [`ApproxEquality::Partial`].
pub const PARTIAL_ULPS: u32 = 256;

/// Multiple of epsilon still considered [`ApproxEquality::Relative`].
pub const RELATIVE_ULPS: u32 = 65536;

/// How close two values are.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within a few rounding steps.
    Precise = 0,

    /// Within the error of a short reduction.
    Partial = 1,

    /// Acceptable epsilon.
    Relative = 2,

    /// Not equal.
    Scarce = 3,
}

/// Grades the distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    /// The equality tier of `self` and `rhs`.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

fn grade<T: Float>(a: T, b: T) -> ApproxEquality {
    if a == b {
        return ApproxEquality::Precise;
    }
    let scale = a.abs().max(b.abs()).max(T::one());
    let diff = (a - b).abs() / scale;
    let tier = |ulps: u32| num_traits::cast::<u32, T>(ulps).map_or(T::zero(), |u| u * T::epsilon());
    if diff.is_nan() {
        ApproxEquality::Scarce
    } else if diff <= tier(PRECISE_ULPS) {
        ApproxEquality::Precise
    } else if diff <= tier(PARTIAL_ULPS) {
        ApproxEquality::Partial
    } else if diff <= tier(RELATIVE_ULPS) {
        ApproxEquality::Relative
    } else {
        ApproxEquality::Scarce
    }
}

impl RelativeEq for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        grade(*self, *rhs)
    }
}

impl RelativeEq for f64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        grade(*self, *rhs)
    }
}

impl<T: RelativeEq> RelativeEq for [T] {
    /// The worst tier over all pairs; slices of different lengths are
    /// [`ApproxEquality::Scarce`].
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.approx_eq(b))
            .max()
            .unwrap_or(ApproxEquality::Precise)
    }
}

impl<T: RelativeEq, const N: usize> RelativeEq<[T]> for [T; N] {
    fn approx_eq(&self, rhs: &[T]) -> ApproxEquality {
        self.as_slice().approx_eq(rhs)
    }
}

/// Whether `a` and `b` are at worst [`ApproxEquality::Partial`].
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Partial
}
