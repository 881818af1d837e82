//! PReLU operators: `prelu`, `prelu_x_grad` and `prelu_alpha_grad`.
//!
//! `alpha` is left-extended with unit axes to the rank of `x`; every axis of
//! the extended shape is either 1 (broadcast over that axis of `x`) or equal
//! to the matching axis of `x`.
//!
//! Parallel signatures are enumerated per axis of `x`: everything shaped like
//! `x` is split along that axis, and `alpha` follows it when it has a full
//! extent there or is broadcast otherwise. The alpha gradient of a broadcast
//! `alpha` is a partial sum across ranks. A final signature broadcasts every
//! blob, so a rank-0 `x` still has one.

use crate::blob::BlobDesc;
use crate::dtype::DataType;
use crate::error::{OpError, Result};
use crate::operator::{ArgDef, BatchAxisCtx, InferBlobDescCtx, Operator, SbpCtx};
use crate::sbp::{SbpSignature, SbpSignatureList};
use crate::shape::Shape;

/// Forward type name.
pub const PRELU: &str = "prelu";
/// Input-gradient type name.
pub const PRELU_X_GRAD: &str = "prelu_x_grad";
/// Alpha-gradient type name.
pub const PRELU_ALPHA_GRAD: &str = "prelu_alpha_grad";

/// `alpha`'s shape left-extended to `x`'s rank, after checking it
/// broadcasts against `x`.
///
/// # Errors
///
/// [`OpError::ShapeMismatch`] if `alpha` has more axes than `x` or an axis
/// is neither 1 nor equal to `x`'s.
pub fn extended_alpha_shape(op: &str, x: &Shape, alpha: &Shape) -> Result<Shape> {
    let ext = alpha
        .left_extended(x.num_axes())
        .map_err(|_| OpError::shape_mismatch(op, format!("alpha of at most {} axes", x.num_axes()), alpha))?;
    for (axis, (&a, &d)) in ext.dims().iter().zip(x.dims()).enumerate() {
        if a != 1 && a != d {
            return Err(OpError::shape_mismatch(
                op,
                format!("alpha axis {axis} of 1 or {d} for x {x}"),
                alpha,
            ));
        }
    }
    Ok(ext)
}

fn check_float(op: &str, x: &BlobDesc) -> Result<()> {
    if x.data_type.is_float() {
        Ok(())
    } else {
        Err(OpError::DataTypeMismatch {
            op: op.to_owned(),
            expected: DataType::Float32,
            actual: x.data_type,
        })
    }
}

fn check_same_type(op: &str, expected: &BlobDesc, actual: &BlobDesc) -> Result<()> {
    if expected.data_type == actual.data_type {
        Ok(())
    } else {
        Err(OpError::DataTypeMismatch {
            op: op.to_owned(),
            expected: expected.data_type,
            actual: actual.data_type,
        })
    }
}

/// Checks `x` against `alpha` and returns `x`.
fn check_x_alpha<'a>(ctx: &InferBlobDescCtx<'a>) -> Result<&'a BlobDesc> {
    let op = ctx.conf().name();
    let x = ctx.input("x", 0)?;
    let alpha = ctx.input("alpha", 0)?;
    check_float(op, x)?;
    check_same_type(op, x, alpha)?;
    extended_alpha_shape(op, &x.shape, &alpha.shape)?;
    Ok(x)
}

/// Per-axis signatures. `like_x` are split along the axis; `alpha_like`
/// follow `alpha`; `reduced` are partial sums whenever `alpha` is broadcast.
fn per_axis_signatures(
    ctx: &SbpCtx<'_>,
    like_x: &[&str],
    alpha_like: &[&str],
    reduced: &[&str],
) -> Result<SbpSignatureList> {
    let op = ctx.conf().name();
    let x = &ctx.desc("x", 0)?.shape;
    let alpha = &ctx.desc("alpha", 0)?.shape;
    let ext = extended_alpha_shape(op, x, alpha)?;
    let offset = x.num_axes() - alpha.num_axes();

    let mut list = SbpSignatureList::new();
    for axis in 0..x.num_axes() {
        let builder = SbpSignature::builder(op).split(like_x.iter().copied(), axis);
        let sig = if ext.at(axis) == 1 {
            builder
                .broadcast(alpha_like.iter().copied())
                .partial_sum(reduced.iter().copied())
        } else {
            builder
                .split(alpha_like.iter().copied(), axis - offset)
                .split(reduced.iter().copied(), axis - offset)
        };
        list.push(sig.build()?);
    }
    let all = like_x.iter().chain(alpha_like).chain(reduced).copied();
    list.push(SbpSignature::builder(op).broadcast(all).build()?);
    Ok(list)
}

const FORWARD_INPUTS: &[ArgDef] = &[ArgDef::required("x"), ArgDef::required("alpha")];
const GRAD_INPUTS: &[ArgDef] = &[ArgDef::required("dy"), ArgDef::required("x"), ArgDef::required("alpha")];

/// `y = x > 0 ? x : x * alpha`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PRelu;

impl Operator for PRelu {
    fn input_arg_defs(&self) -> &'static [ArgDef] {
        FORWARD_INPUTS
    }

    fn output_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("y")];
        DEFS
    }

    fn infer_blob_descs(&self, ctx: &mut InferBlobDescCtx<'_>) -> Result<()> {
        let x = check_x_alpha(ctx)?;
        ctx.set_output("y", 0, x.clone())
    }

    fn get_sbp_signatures(&self, ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        per_axis_signatures(ctx, &["x_0", "y_0"], &["alpha_0"], &[])
    }
}

/// `dx = x > 0 ? dy : dy * alpha`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PReluXGrad;

impl Operator for PReluXGrad {
    fn input_arg_defs(&self) -> &'static [ArgDef] {
        GRAD_INPUTS
    }

    fn output_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("dx")];
        DEFS
    }

    fn infer_blob_descs(&self, ctx: &mut InferBlobDescCtx<'_>) -> Result<()> {
        let x = check_x_alpha(ctx)?;
        let dy = ctx.input("dy", 0)?;
        check_same_type(ctx.conf().name(), x, dy)?;
        if dy.shape != x.shape {
            return Err(OpError::shape_mismatch(ctx.conf().name(), &x.shape, &dy.shape));
        }
        ctx.set_output("dx", 0, x.clone())
    }

    fn get_sbp_signatures(&self, ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        per_axis_signatures(ctx, &["dy_0", "x_0", "dx_0"], &["alpha_0"], &[])
    }
}

/// `alpha_diff = reduce_sum(x > 0 ? 0 : dy * x)` over the broadcast axes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PReluAlphaGrad;

impl Operator for PReluAlphaGrad {
    fn input_arg_defs(&self) -> &'static [ArgDef] {
        GRAD_INPUTS
    }

    fn output_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("alpha_diff")];
        DEFS
    }

    fn infer_blob_descs(&self, ctx: &mut InferBlobDescCtx<'_>) -> Result<()> {
        let x = check_x_alpha(ctx)?;
        let dy = ctx.input("dy", 0)?;
        check_same_type(ctx.conf().name(), x, dy)?;
        if dy.shape != x.shape {
            return Err(OpError::shape_mismatch(ctx.conf().name(), &x.shape, &dy.shape));
        }
        let alpha_diff = ctx.input("alpha", 0)?.clone();
        ctx.set_output("alpha_diff", 0, alpha_diff)
    }

    fn infer_batch_axis(&self, ctx: &mut BatchAxisCtx<'_>) -> Result<()> {
        ctx.set_output("alpha_diff", 0, None)
    }

    fn get_sbp_signatures(&self, ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        per_axis_signatures(ctx, &["dy_0", "x_0"], &["alpha_0"], &["alpha_diff_0"])
    }
}
