//! Kernel instances and the per-call dispatch context.

use std::collections::BTreeMap;

use crate::blob::{Tensor, TensorMut};
use crate::conf::{KernelConf, gen_repeated_bn};
use crate::device::DeviceCtx;
use crate::error::{OpError, Result};
use crate::tmp_buffer::TmpBufferArena;

/// A device/dtype specific implementation of one operator.
///
/// Instances hold only compile-time constants. One instance may serve many
/// concurrent [`OpKernel::compute`] calls, each with its own bindings.
pub trait OpKernel: Send + Sync {
    /// Reads the bound inputs and writes the bound outputs.
    ///
    /// # Errors
    ///
    /// Only binding errors: an argument the operator never declared, a
    /// tensor read with the wrong element type, a temp buffer too small.
    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()>;

    /// Whether [`OpKernel::compute`] must run even when every output is
    /// empty. When `false` such calls are skipped by the launcher.
    fn always_compute_when_all_outputs_empty(&self) -> bool;
}

/// Tensors, scratch space and device context of one compute call.
///
/// Every reference it hands out lives for the call only.
#[derive(Debug)]
pub struct KernelComputeContext<'a> {
    op_name: &'a str,
    device_ctx: &'a DeviceCtx,
    kernel_conf: &'a KernelConf,
    inputs: BTreeMap<String, Tensor<'a>>,
    outputs: BTreeMap<String, Option<TensorMut<'a>>>,
    tmp: Option<TmpBufferArena<'a>>,
}

impl<'a> KernelComputeContext<'a> {
    pub(crate) fn new(
        op_name: &'a str,
        device_ctx: &'a DeviceCtx,
        kernel_conf: &'a KernelConf,
        inputs: BTreeMap<String, Tensor<'a>>,
        outputs: BTreeMap<String, TensorMut<'a>>,
        tmp: TmpBufferArena<'a>,
    ) -> Self {
        Self {
            op_name,
            device_ctx,
            kernel_conf,
            inputs,
            outputs: outputs.into_iter().map(|(bn, t)| (bn, Some(t))).collect(),
            tmp: Some(tmp),
        }
    }

    /// Name of the operator instance being computed.
    #[must_use]
    pub fn op_name(&self) -> &'a str {
        self.op_name
    }

    /// Execution context, to be forwarded to [`crate::ndarray`] primitives.
    #[must_use]
    pub fn device_ctx(&self) -> &'a DeviceCtx {
        self.device_ctx
    }

    /// Values the operator computed for this kernel at compile time.
    #[must_use]
    pub fn kernel_conf(&self) -> &'a KernelConf {
        self.kernel_conf
    }

    /// Input tensor bound to argument `arg` at `index`.
    ///
    /// # Errors
    ///
    /// [`OpError::OutputReadAsInput`] if `arg` is one of the outputs,
    /// [`OpError::UnknownArg`] if the operator declared no such input.
    pub fn tensor(&self, arg: &str, index: usize) -> Result<Tensor<'a>> {
        let bn = gen_repeated_bn(arg, index);
        if let Some(tensor) = self.inputs.get(&bn) {
            return Ok(*tensor);
        }
        if self.outputs.contains_key(&bn) {
            return Err(OpError::OutputReadAsInput {
                op: self.op_name.to_owned(),
                arg: bn,
            });
        }
        Err(self.unknown(arg, index))
    }

    /// Output tensor bound to argument `arg` at `index`. Each output can be
    /// taken once per call.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownArg`] if the operator declared no such output,
    /// [`OpError::ArgAlreadyTaken`] on a second request.
    pub fn tensor_mut(&mut self, arg: &str, index: usize) -> Result<TensorMut<'a>> {
        let bn = gen_repeated_bn(arg, index);
        let slot = self
            .outputs
            .get_mut(&bn)
            .ok_or_else(|| OpError::UnknownArg {
                op: self.op_name.to_owned(),
                arg: arg.to_owned(),
                index,
            })?;
        slot.take().ok_or_else(|| OpError::ArgAlreadyTaken {
            op: self.op_name.to_owned(),
            arg: bn,
        })
    }

    /// The scratch buffer, as an arena to carve typed regions from. Empty
    /// when the kernel declared no temp size. Can be taken once per call.
    ///
    /// # Errors
    ///
    /// [`OpError::ArgAlreadyTaken`] on a second request.
    pub fn tmp_buffer(&mut self) -> Result<TmpBufferArena<'a>> {
        self.tmp.take().ok_or_else(|| OpError::ArgAlreadyTaken {
            op: self.op_name.to_owned(),
            arg: "tmp_buffer".to_owned(),
        })
    }

    fn unknown(&self, arg: &str, index: usize) -> OpError {
        OpError::UnknownArg {
            op: self.op_name.to_owned(),
            arg: arg.to_owned(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Blob;
    use crate::shape;

    #[test]
    fn hands_out_each_binding_once() {
        let x = Blob::from_slice(shape![2], &[1.0f32, 2.0]).unwrap();
        let mut y = Blob::from_slice(shape![2], &[0.0f32, 0.0]).unwrap();
        let device_ctx = DeviceCtx::cpu();
        let kernel_conf = KernelConf::default();
        let mut ctx = KernelComputeContext::new(
            "op",
            &device_ctx,
            &kernel_conf,
            BTreeMap::from([("x_0".to_owned(), x.view())]),
            BTreeMap::from([("y_0".to_owned(), y.view_mut())]),
            TmpBufferArena::default(),
        );

        assert_eq!(ctx.tensor("x", 0).unwrap().dptr::<f32>().unwrap(), &[1.0, 2.0]);
        assert!(matches!(ctx.tensor("x", 1), Err(OpError::UnknownArg { index: 1, .. })));
        assert!(matches!(ctx.tensor("alpha", 0), Err(OpError::UnknownArg { .. })));
        match ctx.tensor("y", 0) {
            Err(OpError::OutputReadAsInput { arg, .. }) => assert_eq!(arg, "y_0"),
            other => panic!("expected an output read error, got {other:?}"),
        }

        assert!(ctx.tensor_mut("y", 0).is_ok());
        assert!(matches!(ctx.tensor_mut("y", 0), Err(OpError::ArgAlreadyTaken { .. })));

        assert_eq!(ctx.tmp_buffer().unwrap().remaining(), 0);
        assert!(ctx.tmp_buffer().is_err());
    }
}
