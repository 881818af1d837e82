//! CPU numeric primitives shared by kernels.
//!
//! Every primitive takes the [`DeviceCtx`] it was handed by the dispatch
//! layer and uses it only to pick between a sequential loop and a `rayon`
//! parallel one. Shapes passed in must have equal rank; callers left-extend
//! lower-rank operands first.

use rayon::prelude::*;

use crate::device::DeviceCtx;
use crate::dtype::FloatElement;
use crate::error::{OpError, Result};
use crate::shape::Shape;

/// Calls `f(i, &mut out[i])` for every element.
pub fn for_each_indexed<T, F>(ctx: &DeviceCtx, out: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize, &mut T) + Send + Sync,
{
    if ctx.should_parallelize(out.len()) {
        out.par_iter_mut().enumerate().for_each(|(i, v)| f(i, v));
    } else {
        out.iter_mut().enumerate().for_each(|(i, v)| f(i, v));
    }
}

/// Row-major strides of `dims`, with stride 0 on axes of extent 1 that are
/// broadcast against `target`.
fn broadcast_strides(dims: &[usize], target: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1;
    for axis in (0..dims.len()).rev() {
        strides[axis] = if dims[axis] == 1 && target[axis] != 1 { 0 } else { acc };
        acc *= dims[axis];
    }
    strides
}

fn offset_in(mut index: usize, dims: &[usize], strides: &[usize]) -> usize {
    let mut offset = 0;
    for axis in (0..dims.len()).rev() {
        let extent = dims[axis];
        offset += (index % extent) * strides[axis];
        index /= extent;
    }
    offset
}

fn check_broadcastable(op: &str, small: &Shape, big: &Shape) -> Result<()> {
    let compatible = small.num_axes() == big.num_axes()
        && small
            .dims()
            .iter()
            .zip(big.dims())
            .all(|(&s, &b)| s == 1 || s == b);
    if compatible {
        Ok(())
    } else {
        Err(OpError::shape_mismatch(
            op,
            format!("each axis of {small} to be 1 or match {big}"),
            small,
        ))
    }
}

fn check_len(op: &str, what: &str, len: usize, expected: usize) -> Result<()> {
    if len < expected {
        return Err(OpError::shape_mismatch(
            op,
            format!("{what} of at least {expected} elements"),
            len,
        ));
    }
    Ok(())
}

/// Materializes `src` broadcast to `dst_shape` into `dst`.
///
/// # Errors
///
/// [`OpError::ShapeMismatch`] if ranks differ, an axis of `src_shape` is
/// neither 1 nor equal to `dst_shape`'s, or a slice is too short.
pub fn broadcast_to<T>(ctx: &DeviceCtx, dst_shape: &Shape, dst: &mut [T], src_shape: &Shape, src: &[T]) -> Result<()>
where
    T: Copy + Send + Sync,
{
    check_broadcastable("broadcast_to", src_shape, dst_shape)?;
    check_len("broadcast_to", "src", src.len(), src_shape.elem_cnt())?;
    check_len("broadcast_to", "dst", dst.len(), dst_shape.elem_cnt())?;
    let dims = dst_shape.dims();
    let strides = broadcast_strides(src_shape.dims(), dims);
    for_each_indexed(ctx, &mut dst[..dst_shape.elem_cnt()], |i, v| {
        *v = src[offset_in(i, dims, &strides)];
    });
    Ok(())
}

/// Sums `src` down to `dst_shape`, one reduced axis at a time.
///
/// `src` is consumed as scratch; `work` must be at least as long. The
/// reduction ping-pongs between the two and copies the result into `dst`.
///
/// # Errors
///
/// [`OpError::ShapeMismatch`] if ranks differ, an axis of `dst_shape` is
/// neither 1 nor equal to `src_shape`'s, or a slice is too short.
pub fn reduce_sum<T: FloatElement>(
    ctx: &DeviceCtx,
    dst_shape: &Shape,
    dst: &mut [T],
    src_shape: &Shape,
    src: &mut [T],
    work: &mut [T],
) -> Result<()> {
    check_broadcastable("reduce_sum", dst_shape, src_shape)?;
    let n = src_shape.elem_cnt();
    let out_len = dst_shape.elem_cnt();
    check_len("reduce_sum", "src", src.len(), n)?;
    check_len("reduce_sum", "work", work.len(), n)?;
    check_len("reduce_sum", "dst", dst.len(), out_len)?;

    let dst = &mut dst[..out_len];
    if n == 0 {
        dst.fill(T::zero());
        return Ok(());
    }

    let mut dims = src_shape.dims().to_vec();
    let mut cur: &mut [T] = &mut src[..n];
    let mut next: &mut [T] = &mut work[..n];
    for axis in 0..dims.len() {
        if dims[axis] == dst_shape.at(axis) {
            continue;
        }
        let mid = dims[axis];
        let inner: usize = dims[axis + 1..].iter().product();
        let reduced_len = cur.len() / mid;
        {
            let from: &[T] = cur;
            for_each_indexed(ctx, &mut next[..reduced_len], |i, v| {
                let (o, j) = (i / inner, i % inner);
                let base = o * mid * inner + j;
                *v = (0..mid).map(|m| from[base + m * inner]).sum();
            });
        }
        dims[axis] = 1;
        core::mem::swap(&mut cur, &mut next);
        cur = &mut core::mem::take(&mut cur)[..reduced_len];
    }
    dst.copy_from_slice(cur);
    Ok(())
}
