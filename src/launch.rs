//! Running a resolved kernel against concrete buffers.
//!
//! A [`BoundKernel`] is what kernel resolution produces for one compiled
//! operator instance: the kernel, the descriptors it was compiled against,
//! its temp-buffer size and kernel configuration. The execution layer calls
//! [`BoundKernel::launch`] repeatedly with fresh [`TensorBindings`]. Each
//! launch checks the bindings against the compiled descriptors before the
//! kernel sees them, so a kernel never reads or writes outside the shapes
//! it was compiled for.

use core::fmt;
use std::collections::BTreeMap;

use tracing::trace;

use crate::blob::{BlobDesc, Tensor, TensorMut};
use crate::conf::{KernelConf, gen_repeated_bn};
use crate::device::{DeviceCtx, DeviceType};
use crate::error::{OpError, Result};
use crate::kernel::{KernelComputeContext, OpKernel};
use crate::tmp_buffer::{TmpBuffer, TmpBufferArena};

/// Buffers for one launch, keyed by argument name and index.
#[derive(Debug, Default)]
pub struct TensorBindings<'a> {
    inputs: BTreeMap<(String, usize), Tensor<'a>>,
    outputs: BTreeMap<(String, usize), TensorMut<'a>>,
    tmp: Option<&'a mut TmpBuffer>,
}

impl<'a> TensorBindings<'a> {
    /// No bindings yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds input `arg` at `index`.
    #[must_use]
    pub fn input(mut self, arg: impl Into<String>, index: usize, tensor: Tensor<'a>) -> Self {
        self.inputs.insert((arg.into(), index), tensor);
        self
    }

    /// Binds output `arg` at `index`.
    #[must_use]
    pub fn output(mut self, arg: impl Into<String>, index: usize, tensor: TensorMut<'a>) -> Self {
        self.outputs.insert((arg.into(), index), tensor);
        self
    }

    /// Binds the scratch buffer.
    #[must_use]
    pub fn tmp_buffer(mut self, buffer: &'a mut TmpBuffer) -> Self {
        self.tmp = Some(buffer);
        self
    }
}

/// Whether a launch ran the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The kernel computed.
    Computed,
    /// Every output was empty and the kernel does not ask to run anyway.
    Skipped,
}

/// A kernel resolved and bound for one compiled operator instance.
pub struct BoundKernel {
    pub(crate) op_name: String,
    pub(crate) device_type: DeviceType,
    pub(crate) kernel: Box<dyn OpKernel>,
    pub(crate) tmp_size: usize,
    pub(crate) inputs: Vec<(String, usize)>,
    pub(crate) outputs: Vec<(String, usize)>,
    pub(crate) descs: BTreeMap<String, BlobDesc>,
    pub(crate) kernel_conf: KernelConf,
}

impl fmt::Debug for BoundKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundKernel")
            .field("op_name", &self.op_name)
            .field("device_type", &self.device_type)
            .field("tmp_size", &self.tmp_size)
            .field("descs", &self.descs)
            .finish_non_exhaustive()
    }
}

impl BoundKernel {
    /// Name of the operator instance.
    #[must_use]
    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    /// Device the kernel was resolved for.
    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Temp-buffer bytes every launch must provide.
    #[must_use]
    pub fn tmp_size(&self) -> usize {
        self.tmp_size
    }

    /// Compiled descriptor of blob `bn`.
    #[must_use]
    pub fn desc(&self, bn: &str) -> Option<&BlobDesc> {
        self.descs.get(bn)
    }

    /// Kernel configuration generated at compile time.
    #[must_use]
    pub fn kernel_conf(&self) -> &KernelConf {
        &self.kernel_conf
    }

    /// A zeroed temp buffer of the required size.
    #[must_use]
    pub fn alloc_tmp_buffer(&self) -> TmpBuffer {
        TmpBuffer::with_size(self.tmp_size)
    }

    /// Checks `bindings` against the compiled descriptors and runs the
    /// kernel, unless every output is empty and the kernel does not ask to
    /// compute in that case.
    ///
    /// # Errors
    ///
    /// [`OpError::DeviceMismatch`], [`OpError::MissingArg`],
    /// [`OpError::UnknownArg`], [`OpError::ShapeMismatch`],
    /// [`OpError::DataTypeMismatch`] or [`OpError::TmpBufferTooSmall`] for
    /// bad bindings, plus anything the kernel reports.
    pub fn launch(&self, device_ctx: &DeviceCtx, bindings: TensorBindings<'_>) -> Result<LaunchOutcome> {
        if device_ctx.device_type() != self.device_type {
            return Err(OpError::DeviceMismatch {
                op: self.op_name.clone(),
                expected: self.device_type,
                actual: device_ctx.device_type(),
            });
        }
        let TensorBindings { inputs, outputs, tmp } = bindings;
        let inputs = self.check_bound(&self.inputs, inputs, |t| t.desc())?;
        let outputs = self.check_bound(&self.outputs, outputs, |t| t.desc())?;

        let all_outputs_empty = outputs.values().all(|t| t.desc().elem_cnt() == 0);
        if all_outputs_empty && !self.kernel.always_compute_when_all_outputs_empty() {
            trace!(op = %self.op_name, "all outputs empty, compute skipped");
            return Ok(LaunchOutcome::Skipped);
        }

        let arena = match tmp {
            Some(buffer) if buffer.byte_size() >= self.tmp_size => buffer.arena(),
            Some(buffer) => {
                return Err(OpError::TmpBufferTooSmall {
                    requested: self.tmp_size,
                    available: buffer.byte_size(),
                });
            }
            None if self.tmp_size == 0 => TmpBufferArena::default(),
            None => {
                return Err(OpError::TmpBufferTooSmall {
                    requested: self.tmp_size,
                    available: 0,
                });
            }
        };

        let mut ctx = KernelComputeContext::new(
            &self.op_name,
            device_ctx,
            &self.kernel_conf,
            inputs,
            outputs,
            arena,
        );
        self.kernel.compute(&mut ctx)?;
        Ok(LaunchOutcome::Computed)
    }

    fn check_bound<T>(
        &self,
        declared: &[(String, usize)],
        mut bound: BTreeMap<(String, usize), T>,
        desc_of: impl Fn(&T) -> &BlobDesc,
    ) -> Result<BTreeMap<String, T>> {
        let mut checked = BTreeMap::new();
        for (arg, index) in declared {
            let bn = gen_repeated_bn(arg, *index);
            let tensor = bound
                .remove(&(arg.clone(), *index))
                .ok_or_else(|| OpError::MissingArg {
                    op: self.op_name.clone(),
                    arg: bn.clone(),
                    reason: "not bound for launch".to_owned(),
                })?;
            let compiled = self.descs.get(&bn).ok_or_else(|| OpError::MissingArg {
                op: self.op_name.clone(),
                arg: bn.clone(),
                reason: "no compiled descriptor".to_owned(),
            })?;
            let actual = desc_of(&tensor);
            if actual.data_type != compiled.data_type {
                return Err(OpError::DataTypeMismatch {
                    op: format!("{}/{bn}", self.op_name),
                    expected: compiled.data_type,
                    actual: actual.data_type,
                });
            }
            if actual.shape != compiled.shape {
                return Err(OpError::shape_mismatch(
                    format!("{}/{bn}", self.op_name),
                    &compiled.shape,
                    &actual.shape,
                ));
            }
            checked.insert(bn, tensor);
        }
        if let Some((arg, index)) = bound.into_keys().next() {
            return Err(OpError::UnknownArg {
                op: self.op_name.clone(),
                arg,
                index,
            });
        }
        Ok(checked)
    }
}
