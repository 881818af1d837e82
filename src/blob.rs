//! Blob descriptors and the tensor views handed to kernels.
//!
//! Storage is a slice of 64-bit words, so any [`Element`] can be viewed in
//! place through `bytemuck` without alignment surprises. [`Blob`] owns such
//! storage and stands in for the execution layer's buffers; kernels only
//! ever see the borrowed [`Tensor`] and [`TensorMut`] views, which live no
//! longer than one compute call.

use core::fmt;

use briny::prelude::*;

use crate::dtype::{DataType, Element};
use crate::error::{OpError, Result};
use crate::shape::Shape;

/// Shape and element type of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobDesc {
    /// Logical or physical shape.
    pub shape: Shape,
    /// Element type.
    pub data_type: DataType,
}

impl Validate for BlobDesc {
    fn validate(&self) -> Result<(), ValidationError> {
        let bytes = self
            .shape
            .checked_elem_cnt()
            .and_then(|n| n.checked_mul(self.data_type.size_of()));
        match bytes {
            Some(b) if isize::try_from(b).is_ok() => Ok(()),
            _ => Err(ValidationError),
        }
    }
}

impl BlobDesc {
    /// Creates a descriptor without validation.
    #[must_use]
    pub fn new(shape: impl Into<Shape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
        }
    }

    /// Creates a descriptor whose byte size is addressable.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidShape`] if `elem_cnt * size_of(data_type)` overflows.
    pub fn checked(shape: impl Into<Shape>, data_type: DataType) -> Result<Self> {
        let desc = Self::new(shape, data_type);
        let display = desc.to_string();
        TrustedData::new(desc)
            .map(TrustedData::into_inner)
            .map_err(|_| OpError::InvalidShape(format!("{display} is not addressable")))
    }

    /// Number of elements.
    #[must_use]
    pub fn elem_cnt(&self) -> usize {
        self.shape.elem_cnt()
    }

    /// Bytes occupied by the elements.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.elem_cnt() * self.data_type.size_of()
    }

    fn word_len(&self) -> usize {
        self.byte_size().div_ceil(size_of::<u64>())
    }
}

impl fmt::Display for BlobDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.data_type, self.shape)
    }
}

fn typed<'a, T: Element>(words: &'a [u64], desc: &BlobDesc, name: &str) -> Result<&'a [T]> {
    check_type::<T>(desc, name)?;
    Ok(&bytemuck::cast_slice::<u64, T>(words)[..desc.elem_cnt()])
}

fn typed_mut<'a, T: Element>(words: &'a mut [u64], desc: &BlobDesc, name: &str) -> Result<&'a mut [T]> {
    check_type::<T>(desc, name)?;
    Ok(&mut bytemuck::cast_slice_mut::<u64, T>(words)[..desc.elem_cnt()])
}

fn check_type<T: Element>(desc: &BlobDesc, name: &str) -> Result<()> {
    if desc.data_type == T::DATA_TYPE {
        Ok(())
    } else {
        Err(OpError::DataTypeMismatch {
            op: name.to_owned(),
            expected: desc.data_type,
            actual: T::DATA_TYPE,
        })
    }
}

/// Owned blob storage.
///
/// The surrounding execution layer owns buffers in a real deployment; this
/// type plays that role for callers that bind tensors directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    desc: BlobDesc,
    words: Vec<u64>,
}

impl Blob {
    /// Allocates a zero-filled blob.
    #[must_use]
    pub fn zeros(desc: BlobDesc) -> Self {
        let words = vec![0; desc.word_len()];
        Self { desc, words }
    }

    /// Copies `data` into a new blob of `shape`.
    ///
    /// # Errors
    ///
    /// [`OpError::ShapeMismatch`] if `data.len()` differs from the element count.
    pub fn from_slice<T: Element>(shape: impl Into<Shape>, data: &[T]) -> Result<Self> {
        let desc = BlobDesc::checked(shape, T::DATA_TYPE)?;
        if desc.elem_cnt() != data.len() {
            return Err(OpError::shape_mismatch(
                "blob",
                format!("{} elements for {}", desc.elem_cnt(), desc.shape),
                format!("{} elements", data.len()),
            ));
        }
        let mut blob = Self::zeros(desc);
        blob.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(blob)
    }

    /// Descriptor of this blob.
    #[must_use]
    pub fn desc(&self) -> &BlobDesc {
        &self.desc
    }

    /// Shape of this blob.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    /// Typed view of the elements.
    ///
    /// # Errors
    ///
    /// [`OpError::DataTypeMismatch`] if `T` is not the blob's element type.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        typed(&self.words, &self.desc, "blob")
    }

    /// Mutable typed view of the elements.
    ///
    /// # Errors
    ///
    /// [`OpError::DataTypeMismatch`] if `T` is not the blob's element type.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        typed_mut(&mut self.words, &self.desc, "blob")
    }

    /// Copies the elements out.
    ///
    /// # Errors
    ///
    /// [`OpError::DataTypeMismatch`] if `T` is not the blob's element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.as_slice().map(<[T]>::to_vec)
    }

    /// Read-only view for binding as a kernel input.
    #[must_use]
    pub fn view(&self) -> Tensor<'_> {
        Tensor {
            desc: &self.desc,
            words: &self.words,
        }
    }

    /// Mutable view for binding as a kernel output.
    #[must_use]
    pub fn view_mut(&mut self) -> TensorMut<'_> {
        TensorMut {
            desc: &self.desc,
            words: &mut self.words,
        }
    }
}

/// Borrowed read-only tensor bound for one compute call.
#[derive(Debug, Clone, Copy)]
pub struct Tensor<'a> {
    desc: &'a BlobDesc,
    words: &'a [u64],
}

impl<'a> Tensor<'a> {
    /// Shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &'a Shape {
        &self.desc.shape
    }

    /// Element type of the tensor.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.desc.data_type
    }

    /// Descriptor of the tensor.
    #[must_use]
    pub fn desc(&self) -> &'a BlobDesc {
        self.desc
    }

    /// Typed element slice.
    ///
    /// # Errors
    ///
    /// [`OpError::DataTypeMismatch`] if `T` is not the tensor's element type.
    pub fn dptr<T: Element>(&self) -> Result<&'a [T]> {
        typed(self.words, self.desc, "tensor")
    }
}

/// Borrowed writable tensor bound for one compute call.
#[derive(Debug)]
pub struct TensorMut<'a> {
    desc: &'a BlobDesc,
    words: &'a mut [u64],
}

impl<'a> TensorMut<'a> {
    /// Shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &'a Shape {
        &self.desc.shape
    }

    /// Element type of the tensor.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.desc.data_type
    }

    /// Descriptor of the tensor.
    #[must_use]
    pub fn desc(&self) -> &'a BlobDesc {
        self.desc
    }

    /// Typed read-only element slice.
    ///
    /// # Errors
    ///
    /// [`OpError::DataTypeMismatch`] if `T` is not the tensor's element type.
    pub fn dptr<T: Element>(&self) -> Result<&[T]> {
        typed(&*self.words, self.desc, "tensor")
    }

    /// Typed writable element slice.
    ///
    /// # Errors
    ///
    /// [`OpError::DataTypeMismatch`] if `T` is not the tensor's element type.
    pub fn mut_dptr<T: Element>(&mut self) -> Result<&mut [T]> {
        typed_mut(&mut *self.words, self.desc, "tensor")
    }

    /// Consumes the view into a writable slice for the whole call.
    ///
    /// # Errors
    ///
    /// [`OpError::DataTypeMismatch`] if `T` is not the tensor's element type.
    pub fn into_mut_dptr<T: Element>(self) -> Result<&'a mut [T]> {
        typed_mut(self.words, self.desc, "tensor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn stores_any_element_type_in_words() {
        let b = Blob::from_slice(shape![3], &[1i8, -2, 3]).unwrap();
        assert_eq!(b.to_vec::<i8>().unwrap(), vec![1, -2, 3]);

        let b = Blob::from_slice(shape![2, 2], &[1.5f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(b.view().dptr::<f32>().unwrap(), &[1.5, 2.0, 3.0, 4.0]);
        assert_eq!(b.desc().byte_size(), 16);
    }

    #[test]
    fn rejects_wrong_element_type() {
        let b = Blob::from_slice(shape![2], &[1.0f64, 2.0]).unwrap();
        let err = b.view().dptr::<f32>().unwrap_err();
        assert!(matches!(
            err,
            OpError::DataTypeMismatch {
                expected: DataType::Float64,
                actual: DataType::Float32,
                ..
            }
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        assert!(Blob::from_slice(shape![2, 2], &[1.0f32; 3]).is_err());
    }

    #[test]
    fn empty_blob_has_no_elements() {
        let b = Blob::zeros(BlobDesc::new(shape![0, 4], DataType::Float32));
        assert!(b.as_slice::<f32>().unwrap().is_empty());
    }

    #[test]
    fn unaddressable_desc_is_rejected() {
        assert!(BlobDesc::checked(shape![usize::MAX / 2, 2], DataType::Float64).is_err());
    }

    #[test]
    fn writes_through_mutable_view() {
        let mut b = Blob::zeros(BlobDesc::new(shape![3], DataType::Int64));
        {
            let mut v = b.view_mut();
            v.mut_dptr::<i64>().unwrap().copy_from_slice(&[7, 8, 9]);
        }
        assert_eq!(b.to_vec::<i64>().unwrap(), vec![7, 8, 9]);
    }
}
