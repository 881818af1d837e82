//! Graph-construction-time driver for single operators.
//!
//! [`OpCompiler`] runs the full per-operator pipeline the graph builder
//! needs: instantiate the descriptor, infer output descriptors and batch
//! axes, enumerate parallel signatures, generate the kernel configuration
//! and finally resolve and bind a kernel. Every step can fail with a
//! configuration error; none of them runs on the compute path.

use std::collections::BTreeMap;

use tracing::debug;

use crate::blob::BlobDesc;
use crate::conf::{KernelConf, OpConf};
use crate::error::Result;
use crate::launch::BoundKernel;
use crate::operator::{BatchAxis, OpRegistry, OperatorDescriptor};
use crate::registry::{KernelRegContext, KernelRegistry};
use crate::sbp::{ParallelContext, SbpSignatureList};

/// An operator instance after inference.
#[derive(Debug)]
pub struct InferredOp {
    descriptor: OperatorDescriptor,
    parallel_ctx: ParallelContext,
    descs: BTreeMap<String, BlobDesc>,
    batch_axes: BTreeMap<String, BatchAxis>,
    sbp_signatures: SbpSignatureList,
    kernel_conf: KernelConf,
}

impl InferredOp {
    /// The operator descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &OperatorDescriptor {
        &self.descriptor
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Placement the instance was inferred for.
    #[must_use]
    pub fn parallel_ctx(&self) -> &ParallelContext {
        &self.parallel_ctx
    }

    /// Descriptors of every input and output blob, by blob name.
    #[must_use]
    pub fn descs(&self) -> &BTreeMap<String, BlobDesc> {
        &self.descs
    }

    /// Descriptor of blob `bn`.
    #[must_use]
    pub fn desc(&self, bn: &str) -> Option<&BlobDesc> {
        self.descs.get(bn)
    }

    /// Batch axes of the outputs.
    #[must_use]
    pub fn batch_axes(&self) -> &BTreeMap<String, BatchAxis> {
        &self.batch_axes
    }

    /// Legal parallel signatures.
    #[must_use]
    pub fn sbp_signatures(&self) -> &SbpSignatureList {
        &self.sbp_signatures
    }

    /// Kernel configuration generated for this instance.
    #[must_use]
    pub fn kernel_conf(&self) -> &KernelConf {
        &self.kernel_conf
    }
}

/// Runs inference and kernel binding against a pair of registries.
#[derive(Debug, Clone, Copy)]
pub struct OpCompiler<'r> {
    ops: &'r OpRegistry,
    kernels: &'r KernelRegistry,
}

impl<'r> OpCompiler<'r> {
    /// A compiler over `ops` and `kernels`.
    #[must_use]
    pub const fn new(ops: &'r OpRegistry, kernels: &'r KernelRegistry) -> Self {
        Self { ops, kernels }
    }

    /// Instantiates `conf` and runs every inference step.
    ///
    /// `inputs` and `input_axes` are keyed by blob name (`<arg>_<index>`).
    ///
    /// # Errors
    ///
    /// Any configuration error raised along the way.
    pub fn infer(
        &self,
        conf: OpConf,
        inputs: &BTreeMap<String, BlobDesc>,
        input_axes: &BTreeMap<String, BatchAxis>,
        parallel_ctx: &ParallelContext,
    ) -> Result<InferredOp> {
        let descriptor = OperatorDescriptor::new(conf, self.ops)?;

        let mut descs = BTreeMap::new();
        for ibn in descriptor.input_bns() {
            if let Some(desc) = inputs.get(&ibn) {
                descs.insert(ibn, BlobDesc::checked(desc.shape.clone(), desc.data_type)?);
            }
        }
        let outputs = descriptor.infer_blob_descs(&descs, parallel_ctx)?;
        descs.extend(outputs);

        let batch_axes = descriptor.infer_batch_axis(input_axes)?;
        let sbp_signatures = descriptor.get_sbp_signatures(&descs)?;
        let kernel_conf = descriptor.gen_kernel_conf(&descs, parallel_ctx)?;

        debug!(
            op = descriptor.name(),
            op_type = descriptor.op_type_name(),
            blobs = descs.len(),
            sbp_signatures = sbp_signatures.len(),
            "operator inferred"
        );
        Ok(InferredOp {
            descriptor,
            parallel_ctx: *parallel_ctx,
            descs,
            batch_axes,
            sbp_signatures,
            kernel_conf,
        })
    }

    /// Resolves the kernel for an inferred instance on its configured
    /// device and sizes its temp buffer.
    ///
    /// # Errors
    ///
    /// [`crate::OpError::MissingKernel`] or [`crate::OpError::AmbiguousKernel`].
    pub fn bind_kernel(&self, op: &InferredOp) -> Result<BoundKernel> {
        let conf = op.descriptor.conf();
        let ctx = KernelRegContext::new(conf, conf.device_type(), &op.descs);
        let registration = self.kernels.resolve(&ctx)?;
        let tmp_size = registration.infer_tmp_size(&ctx);
        debug!(op = conf.name(), tmp_size, "kernel bound");
        Ok(BoundKernel {
            op_name: conf.name().to_owned(),
            device_type: conf.device_type(),
            kernel: registration.create(),
            tmp_size,
            inputs: arg_slots(conf.inputs().iter().map(|(a, v)| (a, v.len()))),
            outputs: arg_slots(conf.outputs().iter().map(|(a, n)| (a, *n))),
            descs: op.descs.clone(),
            kernel_conf: op.kernel_conf.clone(),
        })
    }

    /// [`OpCompiler::infer`] followed by [`OpCompiler::bind_kernel`].
    ///
    /// # Errors
    ///
    /// Any configuration error raised along the way.
    pub fn compile(
        &self,
        conf: OpConf,
        inputs: &BTreeMap<String, BlobDesc>,
        input_axes: &BTreeMap<String, BatchAxis>,
        parallel_ctx: &ParallelContext,
    ) -> Result<(InferredOp, BoundKernel)> {
        let op = self.infer(conf, inputs, input_axes, parallel_ctx)?;
        let kernel = self.bind_kernel(&op)?;
        Ok((op, kernel))
    }

    /// Operators eligible for data-parallel placement: those with at least
    /// one parallel signature.
    #[must_use]
    pub fn partition_search_space(ops: &[InferredOp]) -> Vec<&InferredOp> {
        ops.iter()
            .filter(|op| !op.sbp_signatures.is_empty())
            .collect()
    }
}

fn arg_slots<'a>(args: impl Iterator<Item = (&'a String, usize)>) -> Vec<(String, usize)> {
    args.flat_map(|(arg, n)| (0..n).map(move |i| (arg.clone(), i)))
        .collect()
}
