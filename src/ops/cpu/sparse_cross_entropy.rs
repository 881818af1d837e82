//! CPU kernels for `sparse_cross_entropy_ms1` and its gradient.

use core::marker::PhantomData;

use crate::device::DeviceType;
use crate::dtype::{FloatElement, IndexElement};
use crate::error::{OpError, Result};
use crate::kernel::{KernelComputeContext, OpKernel};
use crate::ndarray::for_each_indexed;
use crate::ops::sparse_cross_entropy_ms1::{
    LOWER_BOUND, SPARSE_CROSS_ENTROPY_MS1, SPARSE_CROSS_ENTROPY_MS1_GRAD,
};
use crate::registry::{Hob, KernelRegistration, KernelRegistryBuilder};

/// Column of `label` inside this rank's `[lower, lower + classes)` range.
fn local_column<K: IndexElement>(label: K, lower: i64, classes: usize) -> Option<usize> {
    let col = label.to_i64()?.checked_sub(lower)?;
    usize::try_from(col).ok().filter(|&c| c < classes)
}

fn lower_bound(ctx: &KernelComputeContext<'_>) -> Result<i64> {
    ctx.kernel_conf().get::<i64>(LOWER_BOUND)
}

/// Rows and local classes of a `[N, C_local]` prediction.
fn rows_and_classes(ctx: &KernelComputeContext<'_>) -> Result<(usize, usize)> {
    let shape = ctx.tensor("prediction", 0)?.shape();
    match shape.dims() {
        &[n, c] => Ok((n, c)),
        _ => Err(OpError::shape_mismatch(ctx.op_name(), "prediction of 2 axes", shape)),
    }
}

struct SparseCrossEntropyMs1Kernel<T, K>(PhantomData<fn() -> (T, K)>);

impl<T: FloatElement, K: IndexElement> OpKernel for SparseCrossEntropyMs1Kernel<T, K> {
    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        let (_, classes) = rows_and_classes(ctx)?;
        let lower = lower_bound(ctx)?;
        let prediction = ctx.tensor("prediction", 0)?.dptr::<T>()?;
        let label = ctx.tensor("label", 0)?.dptr::<K>()?;
        let out = ctx.tensor_mut("out", 0)?.into_mut_dptr::<T>()?;
        for_each_indexed(ctx.device_ctx(), out, |i, v| {
            *v = match local_column(label[i], lower, classes) {
                Some(col) => -prediction[i * classes + col].max(T::min_positive_value()).ln(),
                None => T::zero(),
            };
        });
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

struct SparseCrossEntropyMs1GradKernel<T, K>(PhantomData<fn() -> (T, K)>);

impl<T: FloatElement, K: IndexElement> OpKernel for SparseCrossEntropyMs1GradKernel<T, K> {
    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        let (_, classes) = rows_and_classes(ctx)?;
        let lower = lower_bound(ctx)?;
        let prediction = ctx.tensor("prediction", 0)?.dptr::<T>()?;
        let label = ctx.tensor("label", 0)?.dptr::<K>()?;
        let dy = ctx.tensor("dy", 0)?.dptr::<T>()?;
        let diff = ctx.tensor_mut("prediction_diff", 0)?.into_mut_dptr::<T>()?;
        for_each_indexed(ctx.device_ctx(), diff, |i, v| {
            let (row, col) = (i / classes, i % classes);
            *v = if local_column(label[row], lower, classes) == Some(col) {
                -dy[row] / prediction[i].max(T::min_positive_value())
            } else {
                T::zero()
            };
        });
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

/// Registers both kernels for prediction type `T` and label type `K`.
pub fn register_sparse_cross_entropy_kernels<T: FloatElement, K: IndexElement>(
    builder: &mut KernelRegistryBuilder,
) {
    let matcher = |output: &'static str| {
        Hob::device_type_is(DeviceType::Cpu)
            & Hob::data_type_is(output, 0, T::DATA_TYPE)
            & Hob::data_type_is("label", 0, K::DATA_TYPE)
    };
    builder
        .register(KernelRegistration::new(SPARSE_CROSS_ENTROPY_MS1, matcher("out"), || {
            Box::new(SparseCrossEntropyMs1Kernel::<T, K>(PhantomData))
        }))
        .register(KernelRegistration::new(
            SPARSE_CROSS_ENTROPY_MS1_GRAD,
            matcher("prediction_diff"),
            || Box::new(SparseCrossEntropyMs1GradKernel::<T, K>(PhantomData)),
        ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_labels_into_local_range() {
        assert_eq!(local_column(7i32, 5, 3), Some(2));
        assert_eq!(local_column(8i64, 5, 3), None);
        assert_eq!(local_column(4i32, 5, 3), None);
        assert_eq!(local_column(-1i64, 0, 3), None);
    }
}
