//! CPU kernels.
//!
//! One file per operator family. Kernels are generic over their element
//! types and registered once per supported type, e.g.
//! `register_prelu_kernels::<f32>`.
//!
//! Element-wise loops run through [`crate::ndarray::for_each_indexed`],
//! which switches to `rayon` once a loop is long enough for the
//! [`crate::device::DeviceCtx`] in use.

mod prelu;
mod sparse_cross_entropy;

pub use prelu::register_prelu_kernels;
pub use sparse_cross_entropy::register_sparse_cross_entropy_kernels;
