//! Tensor shapes.
//!
//! A [`Shape`] is an ordered list of axis extents. Extents are unsigned, so
//! shapes that come from signed configuration values go through
//! [`Shape::try_from_dims`], which rejects negative extents. Every constructor
//! that can see untrusted input also checks that the element count does not
//! overflow `usize`, via `briny`'s `Validate`/`TrustedData` gate.

use core::fmt;

use briny::prelude::*;

use crate::error::{OpError, Result};

/// Ordered axis extents of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Validate for Shape {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.checked_elem_cnt() {
            Some(_) => Ok(()),
            None => Err(ValidationError),
        }
    }
}

impl Shape {
    /// Creates a shape from extents.
    ///
    /// No overflow check is made; use [`Shape::checked`] for extents that
    /// did not come from an already valid shape.
    #[must_use]
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Creates a shape, rejecting element counts that overflow `usize`.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidShape`] on overflow.
    pub fn checked(dims: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = Self::new(dims);
        let display = shape.to_string();
        TrustedData::new(shape)
            .map(TrustedData::into_inner)
            .map_err(|_| OpError::InvalidShape(format!("element count of {display} overflows")))
    }

    /// Creates a shape from signed extents, as stored in configuration.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidShape`] on a negative extent or overflow.
    pub fn try_from_dims(dims: &[i64]) -> Result<Self> {
        let dims = dims
            .iter()
            .map(|&d| {
                usize::try_from(d)
                    .map_err(|_| OpError::InvalidShape(format!("negative extent {d} in {dims:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::checked(dims)
    }

    /// A rank-0 shape holding a single element.
    #[must_use]
    pub const fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    /// Axis extents.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of axes.
    #[must_use]
    pub fn num_axes(&self) -> usize {
        self.dims.len()
    }

    /// Extent of `axis`.
    ///
    /// # Panics
    ///
    /// Panics if `axis >= self.num_axes()`.
    #[must_use]
    pub fn at(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    /// Product of all extents.
    ///
    /// Shapes built through [`Shape::checked`] never overflow here.
    #[must_use]
    pub fn elem_cnt(&self) -> usize {
        self.dims.iter().product()
    }

    /// Product of all extents, or `None` on overflow.
    #[must_use]
    pub fn checked_elem_cnt(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Product of the extents in `begin_axis..end_axis`.
    #[must_use]
    pub fn count(&self, begin_axis: usize, end_axis: usize) -> usize {
        self.dims[begin_axis..end_axis].iter().product()
    }

    /// Prepends size-1 axes until the shape has `num_axes` axes.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidShape`] if the shape already has more axes.
    pub fn left_extended(&self, num_axes: usize) -> Result<Self> {
        if num_axes < self.num_axes() {
            return Err(OpError::InvalidShape(format!(
                "cannot left-extend {self} to {num_axes} axes"
            )));
        }
        let mut dims = vec![1; num_axes - self.num_axes()];
        dims.extend_from_slice(&self.dims);
        Ok(Self { dims })
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str(")")
    }
}

/// Builds a [`Shape`] from extents.
///
/// # Example
/// ```
/// use opkernel::shape;
/// let s = shape![2, 3];
/// assert_eq!(s.elem_cnt(), 6);
/// ```
#[macro_export]
macro_rules! shape {
    () => {
        $crate::shape::Shape::scalar()
    };
    ($($dim:expr),+ $(,)?) => {
        $crate::shape::Shape::new(vec![$($dim as usize),+])
    };
}
