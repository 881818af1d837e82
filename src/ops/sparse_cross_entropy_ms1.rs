//! Sparse cross-entropy with the class axis split across ranks ("ms1":
//! model-split on axis 1).
//!
//! `prediction` holds probabilities of shape `[N, C_local]`, where
//! `C_local` is this rank's balanced share of `depth` classes. `label`
//! holds `N` global class indices. Each rank only scores the labels that
//! fall in its own class range and emits 0 elsewhere, so the logical loss
//! is the sum over ranks.

use crate::blob::BlobDesc;
use crate::conf::{KernelConf, OpConf};
use crate::dtype::DataType;
use crate::error::{OpError, Result};
use crate::operator::{ArgDef, InferBlobDescCtx, KernelConfCtx, Operator, SbpCtx};
use crate::sbp::{ParallelContext, SbpSignature, SbpSignatureList};
use crate::shape;

/// Forward type name.
pub const SPARSE_CROSS_ENTROPY_MS1: &str = "sparse_cross_entropy_ms1";
/// Gradient type name.
pub const SPARSE_CROSS_ENTROPY_MS1_GRAD: &str = "sparse_cross_entropy_ms1_grad";

/// Kernel-conf key of the first class index owned by this rank.
pub const LOWER_BOUND: &str = "lower_bound";

fn read_depth(conf: &OpConf) -> Result<usize> {
    let depth = conf.attr::<i64>("depth")?;
    usize::try_from(depth)
        .ok()
        .filter(|&d| d > 0)
        .ok_or_else(|| OpError::InvalidShape(format!("`{}`: depth must be positive, got {depth}", conf.name())))
}

/// Checks `prediction` and `label` and returns `prediction`.
fn check_prediction_label<'a>(ctx: &InferBlobDescCtx<'a>, depth: usize) -> Result<&'a BlobDesc> {
    let op = ctx.conf().name();
    let prediction = ctx.input("prediction", 0)?;
    let label = ctx.input("label", 0)?;
    if !prediction.data_type.is_float() {
        return Err(OpError::DataTypeMismatch {
            op: op.to_owned(),
            expected: DataType::Float32,
            actual: prediction.data_type,
        });
    }
    if !label.data_type.is_index() {
        return Err(OpError::DataTypeMismatch {
            op: op.to_owned(),
            expected: DataType::Int32,
            actual: label.data_type,
        });
    }
    if prediction.shape.num_axes() != 2 {
        return Err(OpError::shape_mismatch(op, "prediction of 2 axes", &prediction.shape));
    }
    let n = prediction.shape.at(0);
    if label.shape != shape![n] {
        return Err(OpError::shape_mismatch(op, shape![n], &label.shape));
    }
    let local = ctx.parallel_ctx().balanced_range(depth).len();
    if prediction.shape.at(1) != local {
        return Err(OpError::shape_mismatch(
            op,
            format!("{local} classes of {depth} on rank {}", ctx.parallel_ctx().parallel_id()),
            &prediction.shape,
        ));
    }
    Ok(prediction)
}

fn gen_lower_bound(depth: usize, parallel_ctx: &ParallelContext, kernel_conf: &mut KernelConf) -> Result<()> {
    let lower = parallel_ctx.balanced_range(depth).start;
    let lower = i64::try_from(lower)
        .map_err(|_| OpError::InvalidShape(format!("class offset {lower} does not fit i64")))?;
    kernel_conf.set(LOWER_BOUND, lower);
    Ok(())
}

/// Forward loss: `out[i] = -ln(prediction[i, label[i] - lower_bound])`.
#[derive(Debug, Clone, Copy)]
pub struct SparseCrossEntropyMs1 {
    depth: usize,
}

impl SparseCrossEntropyMs1 {
    /// Reads the `depth` attribute.
    ///
    /// # Errors
    ///
    /// [`OpError::MissingAttr`], [`OpError::AttrTypeMismatch`] or
    /// [`OpError::InvalidShape`] for a non-positive depth.
    pub fn from_conf(conf: &OpConf) -> Result<Self> {
        Ok(Self {
            depth: read_depth(conf)?,
        })
    }
}

impl Operator for SparseCrossEntropyMs1 {
    fn input_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("prediction"), ArgDef::required("label")];
        DEFS
    }

    fn output_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("out")];
        DEFS
    }

    fn infer_blob_descs(&self, ctx: &mut InferBlobDescCtx<'_>) -> Result<()> {
        let prediction = check_prediction_label(ctx, self.depth)?;
        let out = BlobDesc::new(shape![prediction.shape.at(0)], prediction.data_type);
        ctx.set_output("out", 0, out)
    }

    fn get_sbp_signatures(&self, ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        let sig = SbpSignature::builder(ctx.conf().name())
            .split(["prediction_0"], 1)
            .broadcast(["label_0"])
            .partial_sum(["out_0"])
            .build()?;
        Ok([sig].into_iter().collect())
    }

    fn gen_kernel_conf(&self, ctx: &KernelConfCtx<'_>, kernel_conf: &mut KernelConf) -> Result<()> {
        gen_lower_bound(self.depth, ctx.parallel_ctx(), kernel_conf)
    }
}

/// Gradient: `prediction_diff[i, k] = -dy[i] / prediction[i, k]` at the
/// label column, 0 elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct SparseCrossEntropyMs1Grad {
    depth: usize,
}

impl SparseCrossEntropyMs1Grad {
    /// Reads the `depth` attribute.
    ///
    /// # Errors
    ///
    /// [`OpError::MissingAttr`], [`OpError::AttrTypeMismatch`] or
    /// [`OpError::InvalidShape`] for a non-positive depth.
    pub fn from_conf(conf: &OpConf) -> Result<Self> {
        Ok(Self {
            depth: read_depth(conf)?,
        })
    }
}

impl Operator for SparseCrossEntropyMs1Grad {
    fn input_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[
            ArgDef::required("prediction"),
            ArgDef::required("label"),
            ArgDef::required("dy"),
        ];
        DEFS
    }

    fn output_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("prediction_diff")];
        DEFS
    }

    fn infer_blob_descs(&self, ctx: &mut InferBlobDescCtx<'_>) -> Result<()> {
        let prediction = check_prediction_label(ctx, self.depth)?;
        let dy = ctx.input("dy", 0)?;
        let expected = BlobDesc::new(shape![prediction.shape.at(0)], prediction.data_type);
        if *dy != expected {
            return Err(OpError::shape_mismatch(ctx.conf().name(), &expected, dy));
        }
        ctx.set_output("prediction_diff", 0, prediction.clone())
    }

    fn get_sbp_signatures(&self, ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        let sig = SbpSignature::builder(ctx.conf().name())
            .split(["prediction_0", "prediction_diff_0"], 1)
            .broadcast(["label_0", "dy_0"])
            .build()?;
        Ok([sig].into_iter().collect())
    }

    fn gen_kernel_conf(&self, ctx: &KernelConfCtx<'_>, kernel_conf: &mut KernelConf) -> Result<()> {
        gen_lower_bound(self.depth, ctx.parallel_ctx(), kernel_conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_must_be_positive() {
        let conf = OpConf::builder(SPARSE_CROSS_ENTROPY_MS1, "loss").attr("depth", 0i64).build();
        assert!(matches!(
            SparseCrossEntropyMs1::from_conf(&conf),
            Err(OpError::InvalidShape(_))
        ));
        let conf = OpConf::builder(SPARSE_CROSS_ENTROPY_MS1, "loss").build();
        assert!(matches!(
            SparseCrossEntropyMs1Grad::from_conf(&conf),
            Err(OpError::MissingAttr { .. })
        ));
    }

    #[test]
    fn lower_bound_follows_balanced_split() {
        let mut kc = KernelConf::default();
        gen_lower_bound(10, &ParallelContext::new(2, 3).unwrap(), &mut kc).unwrap();
        assert_eq!(kc.get::<i64>(LOWER_BOUND).unwrap(), 7);
    }
}
