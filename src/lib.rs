//! opkernel: the operator and kernel layer of a distributed training runtime.
//!
//! Operators describe themselves (arguments, output shapes and types, batch
//! axes, legal parallel signatures); kernels implement them for one device
//! and element type. This crate holds the contract between the two and the
//! machinery that connects them: the registries, kernel resolution, and the
//! per-call dispatch context.
//!
//! # Flow
//!
//! - At startup the framework fills an [`operator::OpRegistry`] and a
//!   [`registry::KernelRegistry`], usually with [`ops::builtin_op_registry`]
//!   and [`ops::builtin_kernel_registry`]. Both are read-only afterwards.
//! - While building a graph, [`compiler::OpCompiler`] turns each
//!   [`conf::OpConf`] into an inferred operator and resolves exactly one
//!   kernel for it, producing a [`launch::BoundKernel`].
//! - At run time the scheduler calls [`launch::BoundKernel::launch`] with
//!   fresh buffers, from as many threads as it likes.
//!
//! Every error in this crate is a configuration error ([`OpError`]). They
//! are all raised while compiling or binding, never from a kernel's numeric
//! loop, and the caller is expected to abort on them.
//!
//! # Modules
//!
//! - [`operator`]: the `Operator` capability trait and descriptors.
//! - [`registry`]: kernel registrations and matcher expressions.
//! - [`kernel`]: the `OpKernel` trait and its compute context.
//! - [`launch`]: bound kernels and launch-time checks.
//! - [`ops`]: PReLU, sparse cross-entropy (class-split) and model save.
//!
//! # Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use opkernel::blob::{Blob, BlobDesc};
//! use opkernel::compiler::OpCompiler;
//! use opkernel::conf::OpConf;
//! use opkernel::device::DeviceCtx;
//! use opkernel::dtype::DataType;
//! use opkernel::launch::TensorBindings;
//! use opkernel::ops::{builtin_kernel_registry, builtin_op_registry};
//! use opkernel::sbp::ParallelContext;
//! use opkernel::shape;
//!
//! let ops = builtin_op_registry();
//! let kernels = builtin_kernel_registry();
//! let compiler = OpCompiler::new(&ops, &kernels);
//!
//! let conf = OpConf::builder("prelu", "act")
//!     .input("x", "in/out_0")
//!     .input("alpha", "alpha/out_0")
//!     .output("y", 1)
//!     .build();
//! let inputs = BTreeMap::from([
//!     ("x_0".to_owned(), BlobDesc::new(shape![4], DataType::Float32)),
//!     ("alpha_0".to_owned(), BlobDesc::new(shape![1], DataType::Float32)),
//! ]);
//! let axes = BTreeMap::from([("x_0".to_owned(), Some(0)), ("alpha_0".to_owned(), None)]);
//! let (_, kernel) = compiler.compile(conf, &inputs, &axes, &ParallelContext::single())?;
//!
//! let x = Blob::from_slice(shape![4], &[-2.0f32, 3.0, -1.0, 5.0])?;
//! let alpha = Blob::from_slice(shape![1], &[0.5f32])?;
//! let mut y = Blob::zeros(BlobDesc::new(shape![4], DataType::Float32));
//! let mut tmp = kernel.alloc_tmp_buffer();
//! kernel.launch(
//!     &DeviceCtx::cpu(),
//!     TensorBindings::new()
//!         .input("x", 0, x.view())
//!         .input("alpha", 0, alpha.view())
//!         .output("y", 0, y.view_mut())
//!         .tmp_buffer(&mut tmp),
//! )?;
//! assert_eq!(y.as_slice::<f32>()?, &[-1.0, 3.0, -0.5, 5.0]);
//! # Ok::<(), opkernel::OpError>(())
//! ```

pub mod approx;
pub mod blob;
pub mod compiler;
pub mod conf;
pub mod device;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod launch;
pub mod ndarray;
pub mod operator;
pub mod ops;
pub mod registry;
pub mod sbp;
pub mod shape;
pub mod tmp_buffer;

pub use error::{OpError, Result};
