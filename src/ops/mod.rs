//! # Built-in Operators
//!
//! Operator descriptors live one family per file; their CPU kernels live
//! under [`cpu`]. Nothing registers itself: the embedding framework builds
//! both tables once at startup, usually through [`builtin_op_registry`] and
//! [`builtin_kernel_registry`], and hands them to
//! [`crate::compiler::OpCompiler`].
//!
//! ```rust
//! use opkernel::ops::{builtin_kernel_registry, builtin_op_registry, prelu::PRELU};
//!
//! let ops = builtin_op_registry();
//! let kernels = builtin_kernel_registry();
//! assert!(ops.contains(PRELU));
//! assert_eq!(kernels.candidates(PRELU).len(), 2);
//! ```
//!
//! ## Adding an operator
//!
//! 1. Implement [`crate::operator::Operator`] in a new file here.
//! 2. Write a generic kernel under `cpu/` and a `register_*_kernels::<T>`
//!    function for it.
//! 3. Add both to the functions below, once per supported element type.

pub mod cpu;
pub mod model_save;
pub mod prelu;
pub mod sparse_cross_entropy_ms1;

use crate::conf::OpConf;
use crate::error::Result;
use crate::operator::{OpRegistry, OpRegistryBuilder, Operator};
use crate::registry::{KernelRegistry, KernelRegistryBuilder};

use model_save::{MODEL_SAVE_V2, ModelSaveV2};
use prelu::{PRELU, PRELU_ALPHA_GRAD, PRELU_X_GRAD, PRelu, PReluAlphaGrad, PReluXGrad};
use sparse_cross_entropy_ms1::{
    SPARSE_CROSS_ENTROPY_MS1, SPARSE_CROSS_ENTROPY_MS1_GRAD, SparseCrossEntropyMs1,
    SparseCrossEntropyMs1Grad,
};

fn boxed<O: Operator + 'static>(op: O) -> Result<Box<dyn Operator>> {
    Ok(Box::new(op))
}

/// Registers every built-in operator type.
pub fn register_builtin_ops(builder: &mut OpRegistryBuilder) {
    builder
        .register(PRELU, |_: &OpConf| boxed(PRelu))
        .register(PRELU_X_GRAD, |_: &OpConf| boxed(PReluXGrad))
        .register(PRELU_ALPHA_GRAD, |_: &OpConf| boxed(PReluAlphaGrad))
        .register(SPARSE_CROSS_ENTROPY_MS1, |conf: &OpConf| {
            boxed(SparseCrossEntropyMs1::from_conf(conf)?)
        })
        .register(SPARSE_CROSS_ENTROPY_MS1_GRAD, |conf: &OpConf| {
            boxed(SparseCrossEntropyMs1Grad::from_conf(conf)?)
        })
        .register(MODEL_SAVE_V2, |conf: &OpConf| boxed(ModelSaveV2::from_conf(conf)?));
}

/// Registers every built-in CPU kernel, once per supported element type.
pub fn register_builtin_kernels(builder: &mut KernelRegistryBuilder) {
    cpu::register_prelu_kernels::<f32>(builder);
    cpu::register_prelu_kernels::<f64>(builder);
    cpu::register_sparse_cross_entropy_kernels::<f32, i32>(builder);
    cpu::register_sparse_cross_entropy_kernels::<f32, i64>(builder);
    cpu::register_sparse_cross_entropy_kernels::<f64, i32>(builder);
    cpu::register_sparse_cross_entropy_kernels::<f64, i64>(builder);
}

/// An operator registry holding the built-in types.
#[must_use]
pub fn builtin_op_registry() -> OpRegistry {
    let mut builder = OpRegistry::builder();
    register_builtin_ops(&mut builder);
    builder.build()
}

/// A kernel registry holding the built-in CPU kernels.
#[must_use]
pub fn builtin_kernel_registry() -> KernelRegistry {
    let mut builder = KernelRegistry::builder();
    register_builtin_kernels(&mut builder);
    builder.build()
}
