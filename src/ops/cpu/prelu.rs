//! CPU PReLU kernels.
//!
//! Each kernel materializes `alpha` broadcast to `x`'s shape in the temp
//! buffer and then runs one element-wise pass. The alpha gradient takes a
//! second region of the same size as the reduction workspace.

use core::marker::PhantomData;

use crate::device::DeviceType;
use crate::dtype::FloatElement;
use crate::error::Result;
use crate::kernel::{KernelComputeContext, OpKernel};
use crate::ndarray::{broadcast_to, for_each_indexed, reduce_sum};
use crate::ops::prelu::{PRELU, PRELU_ALPHA_GRAD, PRELU_X_GRAD};
use crate::registry::{Hob, KernelRegContext, KernelRegistration, KernelRegistryBuilder};
use crate::tmp_buffer::{TmpBufferArena, aligned_size};

/// Bytes of one `x`-sized region of `T`.
fn x_region_size<T: FloatElement>(ctx: &KernelRegContext<'_>) -> usize {
    let n = ctx.shape4arg("x", 0).map_or(0, |s| s.elem_cnt());
    aligned_size(n * size_of::<T>())
}

/// Broadcasts `alpha` into a fresh `x`-sized region of the temp buffer.
fn broadcast_alpha<'a, T: FloatElement>(
    ctx: &KernelComputeContext<'a>,
    arena: &mut TmpBufferArena<'a>,
) -> Result<&'a [T]> {
    let x = ctx.tensor("x", 0)?;
    let alpha = ctx.tensor("alpha", 0)?;
    let ext = alpha.shape().left_extended(x.shape().num_axes())?;
    let region = arena.take::<T>(x.shape().elem_cnt())?;
    broadcast_to(ctx.device_ctx(), x.shape(), region, &ext, alpha.dptr::<T>()?)?;
    Ok(region)
}

struct PReluKernel<T>(PhantomData<fn() -> T>);

impl<T: FloatElement> OpKernel for PReluKernel<T> {
    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        let mut arena = ctx.tmp_buffer()?;
        let alpha = broadcast_alpha::<T>(ctx, &mut arena)?;
        let x = ctx.tensor("x", 0)?.dptr::<T>()?;
        let y = ctx.tensor_mut("y", 0)?.into_mut_dptr::<T>()?;
        for_each_indexed(ctx.device_ctx(), y, |i, v| {
            *v = if x[i] > T::zero() { x[i] } else { x[i] * alpha[i] };
        });
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

struct PReluXGradKernel<T>(PhantomData<fn() -> T>);

impl<T: FloatElement> OpKernel for PReluXGradKernel<T> {
    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        let mut arena = ctx.tmp_buffer()?;
        let alpha = broadcast_alpha::<T>(ctx, &mut arena)?;
        let x = ctx.tensor("x", 0)?.dptr::<T>()?;
        let dy = ctx.tensor("dy", 0)?.dptr::<T>()?;
        let dx = ctx.tensor_mut("dx", 0)?.into_mut_dptr::<T>()?;
        for_each_indexed(ctx.device_ctx(), dx, |i, v| {
            *v = if x[i] > T::zero() { dy[i] } else { dy[i] * alpha[i] };
        });
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

struct PReluAlphaGradKernel<T>(PhantomData<fn() -> T>);

impl<T: FloatElement> OpKernel for PReluAlphaGradKernel<T> {
    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        let x = ctx.tensor("x", 0)?;
        let dy = ctx.tensor("dy", 0)?.dptr::<T>()?;
        let alpha = ctx.tensor("alpha", 0)?;
        let alpha_diff = ctx.tensor_mut("alpha_diff", 0)?;
        let ext = alpha.shape().left_extended(x.shape().num_axes())?;
        let xs = x.dptr::<T>()?;

        let mut arena = ctx.tmp_buffer()?;
        let products = arena.take::<T>(xs.len())?;
        let work = arena.take::<T>(xs.len())?;
        for_each_indexed(ctx.device_ctx(), products, |i, v| {
            *v = if xs[i] > T::zero() { T::zero() } else { dy[i] * xs[i] };
        });
        reduce_sum(
            ctx.device_ctx(),
            &ext,
            alpha_diff.into_mut_dptr::<T>()?,
            x.shape(),
            products,
            work,
        )
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

fn matcher<T: FloatElement>(output: &'static str) -> Hob {
    Hob::device_type_is(DeviceType::Cpu) & Hob::data_type_is(output, 0, T::DATA_TYPE)
}

/// Registers the three PReLU kernels for element type `T`.
pub fn register_prelu_kernels<T: FloatElement>(builder: &mut KernelRegistryBuilder) {
    builder
        .register(
            KernelRegistration::new(PRELU, matcher::<T>("y"), || Box::new(PReluKernel::<T>(PhantomData)))
                .with_infer_tmp_size_fn(x_region_size::<T>),
        )
        .register(
            KernelRegistration::new(PRELU_X_GRAD, matcher::<T>("dx"), || {
                Box::new(PReluXGradKernel::<T>(PhantomData))
            })
            .with_infer_tmp_size_fn(x_region_size::<T>),
        )
        .register(
            KernelRegistration::new(PRELU_ALPHA_GRAD, matcher::<T>("alpha_diff"), || {
                Box::new(PReluAlphaGradKernel::<T>(PhantomData))
            })
            .with_infer_tmp_size_fn(|ctx| 2 * x_region_size::<T>(ctx)),
        );
}
