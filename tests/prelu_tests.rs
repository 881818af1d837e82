use std::collections::BTreeMap;

use opkernel::OpError;
use opkernel::approx::approx_eq;
use opkernel::blob::{Blob, BlobDesc};
use opkernel::compiler::{InferredOp, OpCompiler};
use opkernel::conf::OpConf;
use opkernel::device::DeviceCtx;
use opkernel::dtype::DataType;
use opkernel::launch::{BoundKernel, LaunchOutcome, TensorBindings};
use opkernel::ops::prelu::{PRELU, PRELU_ALPHA_GRAD, PRELU_X_GRAD};
use opkernel::ops::{builtin_kernel_registry, builtin_op_registry};
use opkernel::sbp::{ParallelContext, SbpParallel};
use opkernel::shape;

fn compile(op_type: &str, output: &str, inputs: &[(&str, &Blob)]) -> opkernel::Result<(InferredOp, BoundKernel)> {
    let ops = builtin_op_registry();
    let kernels = builtin_kernel_registry();
    let mut conf = OpConf::builder(op_type, format!("{op_type}_test"));
    let mut descs = BTreeMap::new();
    let mut axes = BTreeMap::new();
    for (arg, blob) in inputs {
        conf = conf.input(*arg, format!("{arg}/out_0"));
        descs.insert(format!("{arg}_0"), blob.desc().clone());
        axes.insert(format!("{arg}_0"), if *arg == "alpha" { None } else { Some(0) });
    }
    OpCompiler::new(&ops, &kernels).compile(
        conf.output(output, 1).build(),
        &descs,
        &axes,
        &ParallelContext::single(),
    )
}

fn run(kernel: &BoundKernel, ctx: &DeviceCtx, inputs: &[(&str, &Blob)], output: (&str, &mut Blob)) -> LaunchOutcome {
    let mut tmp = kernel.alloc_tmp_buffer();
    let mut bindings = TensorBindings::new();
    for (arg, blob) in inputs {
        bindings = bindings.input(*arg, 0, blob.view());
    }
    let (arg, blob) = output;
    kernel
        .launch(ctx, bindings.output(arg, 0, blob.view_mut()).tmp_buffer(&mut tmp))
        .unwrap()
}

fn output_like(op: &InferredOp, bn: &str) -> Blob {
    Blob::zeros(op.desc(bn).unwrap().clone())
}

#[test]
fn test_prelu_forward_scalar_alpha() {
    let x = Blob::from_slice(shape![4], &[-2.0f32, 3.0, -1.0, 5.0]).unwrap();
    let alpha = Blob::from_slice(shape![1], &[0.1f32]).unwrap();
    let inputs = [("x", &x), ("alpha", &alpha)];
    let (op, kernel) = compile(PRELU, "y", &inputs).unwrap();

    let mut y = output_like(&op, "y_0");
    assert_eq!(run(&kernel, &DeviceCtx::cpu(), &inputs, ("y", &mut y)), LaunchOutcome::Computed);
    assert!(approx_eq(y.as_slice::<f32>().unwrap(), &[-0.2f32, 3.0, -0.1, 5.0][..]));
}

#[test]
fn test_prelu_gradients_scalar_alpha() {
    let x = Blob::from_slice(shape![4], &[-2.0f32, 3.0, -1.0, 5.0]).unwrap();
    let alpha = Blob::from_slice(shape![1], &[0.1f32]).unwrap();
    let dy = Blob::from_slice(shape![4], &[1.0f32; 4]).unwrap();
    let inputs = [("dy", &dy), ("x", &x), ("alpha", &alpha)];

    let (op, kernel) = compile(PRELU_X_GRAD, "dx", &inputs).unwrap();
    let mut dx = output_like(&op, "dx_0");
    run(&kernel, &DeviceCtx::cpu(), &inputs, ("dx", &mut dx));
    assert!(approx_eq(dx.as_slice::<f32>().unwrap(), &[0.1f32, 1.0, 0.1, 1.0][..]));

    let (op, kernel) = compile(PRELU_ALPHA_GRAD, "alpha_diff", &inputs).unwrap();
    assert_eq!(op.desc("alpha_diff_0"), Some(alpha.desc()));
    let mut alpha_diff = output_like(&op, "alpha_diff_0");
    run(&kernel, &DeviceCtx::cpu(), &inputs, ("alpha_diff", &mut alpha_diff));
    assert!(approx_eq(alpha_diff.as_slice::<f32>().unwrap(), &[-3.0f32][..]));
}

#[test]
fn test_prelu_channel_alpha_f64() {
    let x = Blob::from_slice(shape![2, 3], &[1.0f64, -1.0, -2.0, -3.0, 4.0, -5.0]).unwrap();
    let alpha = Blob::from_slice(shape![3], &[0.5f64, 0.25, 2.0]).unwrap();
    let dy = Blob::from_slice(shape![2, 3], &[1.0f64; 6]).unwrap();
    // Sequential and parallel loops must agree.
    for ctx in [DeviceCtx::cpu(), DeviceCtx::cpu().with_parallel_threshold(0)] {
        let fwd = [("x", &x), ("alpha", &alpha)];
        let (op, kernel) = compile(PRELU, "y", &fwd).unwrap();
        let mut y = output_like(&op, "y_0");
        run(&kernel, &ctx, &fwd, ("y", &mut y));
        assert!(approx_eq(
            y.as_slice::<f64>().unwrap(),
            &[1.0f64, -0.25, -4.0, -1.5, 4.0, -10.0][..]
        ));

        let grad = [("dy", &dy), ("x", &x), ("alpha", &alpha)];
        let (op, kernel) = compile(PRELU_X_GRAD, "dx", &grad).unwrap();
        let mut dx = output_like(&op, "dx_0");
        run(&kernel, &ctx, &grad, ("dx", &mut dx));
        assert!(approx_eq(
            dx.as_slice::<f64>().unwrap(),
            &[1.0f64, 0.25, 2.0, 0.5, 1.0, 2.0][..]
        ));

        let (op, kernel) = compile(PRELU_ALPHA_GRAD, "alpha_diff", &grad).unwrap();
        let mut alpha_diff = output_like(&op, "alpha_diff_0");
        run(&kernel, &ctx, &grad, ("alpha_diff", &mut alpha_diff));
        assert!(approx_eq(alpha_diff.as_slice::<f64>().unwrap(), &[-3.0f64, -1.0, -7.0][..]));
    }
}

#[test]
fn test_prelu_temp_buffer_sizes() {
    let x = Blob::from_slice(shape![3], &[1.0f32, -1.0, 2.0]).unwrap();
    let alpha = Blob::from_slice(shape![1], &[0.5f32]).unwrap();
    let dy = Blob::from_slice(shape![3], &[1.0f32; 3]).unwrap();

    let (_, fwd) = compile(PRELU, "y", &[("x", &x), ("alpha", &alpha)]).unwrap();
    assert_eq!(fwd.tmp_size(), 16);

    let (_, alpha_grad) = compile(PRELU_ALPHA_GRAD, "alpha_diff", &[("dy", &dy), ("x", &x), ("alpha", &alpha)]).unwrap();
    assert_eq!(alpha_grad.tmp_size(), 32);
}

#[test]
fn test_prelu_sbp_signatures_per_axis() {
    let x = Blob::zeros(BlobDesc::new(shape![2, 3], DataType::Float32));
    let alpha = Blob::zeros(BlobDesc::new(shape![3], DataType::Float32));
    let dy = x.clone();

    let (op, _) = compile(PRELU, "y", &[("x", &x), ("alpha", &alpha)]).unwrap();
    let sigs = op.sbp_signatures().signatures();
    assert_eq!(sigs.len(), 3);
    assert!(sigs[2].iter().all(|(_, sbp)| sbp == SbpParallel::Broadcast));
    assert_eq!(sigs[0].get("x_0"), Some(SbpParallel::Split(0)));
    assert_eq!(sigs[0].get("y_0"), Some(SbpParallel::Split(0)));
    assert_eq!(sigs[0].get("alpha_0"), Some(SbpParallel::Broadcast));
    assert_eq!(sigs[1].get("x_0"), Some(SbpParallel::Split(1)));
    assert_eq!(sigs[1].get("alpha_0"), Some(SbpParallel::Split(0)));

    let (op, _) = compile(PRELU_ALPHA_GRAD, "alpha_diff", &[("dy", &dy), ("x", &x), ("alpha", &alpha)]).unwrap();
    let sigs = op.sbp_signatures().signatures();
    assert_eq!(sigs[0].get("alpha_diff_0"), Some(SbpParallel::PartialSum));
    assert_eq!(sigs[1].get("alpha_diff_0"), Some(SbpParallel::Split(0)));
    assert_eq!(op.batch_axes()["alpha_diff_0"], None);
}

#[test]
fn test_scalar_prelu_keeps_a_broadcast_signature() {
    let x = Blob::from_slice(shape![], &[-2.0f32]).unwrap();
    let alpha = Blob::from_slice(shape![], &[0.5f32]).unwrap();
    let inputs = [("x", &x), ("alpha", &alpha)];
    let (op, kernel) = compile(PRELU, "y", &inputs).unwrap();

    let mut y = output_like(&op, "y_0");
    assert_eq!(run(&kernel, &DeviceCtx::cpu(), &inputs, ("y", &mut y)), LaunchOutcome::Computed);
    assert_eq!(y.as_slice::<f32>().unwrap(), &[-1.0]);

    let sigs = op.sbp_signatures().signatures();
    assert_eq!(sigs.len(), 1);
    assert_eq!(sigs[0].get("x_0"), Some(SbpParallel::Broadcast));
    assert_eq!(sigs[0].get("y_0"), Some(SbpParallel::Broadcast));
    assert_eq!(sigs[0].get("alpha_0"), Some(SbpParallel::Broadcast));
    assert_eq!(OpCompiler::partition_search_space(std::slice::from_ref(&op)).len(), 1);

    let dy = x.clone();
    let (op, _) = compile(PRELU_ALPHA_GRAD, "alpha_diff", &[("dy", &dy), ("x", &x), ("alpha", &alpha)]).unwrap();
    let sigs = op.sbp_signatures().signatures();
    assert_eq!(sigs.len(), 1);
    assert_eq!(sigs[0].get("alpha_diff_0"), Some(SbpParallel::Broadcast));
}

#[test]
fn test_prelu_rejects_bad_alpha() {
    let x = Blob::zeros(BlobDesc::new(shape![2, 3], DataType::Float32));
    let alpha = Blob::zeros(BlobDesc::new(shape![2], DataType::Float32));
    assert!(matches!(
        compile(PRELU, "y", &[("x", &x), ("alpha", &alpha)]),
        Err(OpError::ShapeMismatch { .. })
    ));

    let alpha = Blob::zeros(BlobDesc::new(shape![3], DataType::Float64));
    assert!(matches!(
        compile(PRELU, "y", &[("x", &x), ("alpha", &alpha)]),
        Err(OpError::DataTypeMismatch { .. })
    ));
}
