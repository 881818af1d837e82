use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use opkernel::blob::{Blob, BlobDesc};
use opkernel::compiler::OpCompiler;
use opkernel::conf::OpConf;
use opkernel::device::{DeviceCtx, DeviceType};
use opkernel::dtype::DataType;
use opkernel::kernel::{KernelComputeContext, OpKernel};
use opkernel::launch::{BoundKernel, LaunchOutcome, TensorBindings};
use opkernel::operator::{ArgDef, InferBlobDescCtx, OpRegistry, Operator, SbpCtx};
use opkernel::ops::model_save::MODEL_SAVE_V2;
use opkernel::ops::prelu::PRELU;
use opkernel::ops::{builtin_kernel_registry, builtin_op_registry, register_builtin_ops};
use opkernel::registry::{Hob, KernelRegistration, KernelRegistry};
use opkernel::sbp::{ParallelContext, SbpSignature, SbpSignatureList};
use opkernel::tmp_buffer::TmpBuffer;
use opkernel::{OpError, Result, shape};

/// `out = in`, with a kernel that only counts its calls.
struct Passthrough;

impl Operator for Passthrough {
    fn input_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("in")];
        DEFS
    }

    fn output_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::required("out")];
        DEFS
    }

    fn infer_blob_descs(&self, ctx: &mut InferBlobDescCtx<'_>) -> Result<()> {
        let desc = ctx.input("in", 0)?.clone();
        ctx.set_output("out", 0, desc)
    }

    fn get_sbp_signatures(&self, ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        let sig = SbpSignature::builder(ctx.conf().name())
            .broadcast(["in_0", "out_0"])
            .build()?;
        Ok([sig].into_iter().collect())
    }
}

struct Counting {
    calls: Arc<AtomicUsize>,
    always: bool,
}

impl OpKernel for Counting {
    fn compute(&self, _ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        self.always
    }
}

/// Reads an argument nobody declared.
struct Snooping;

impl OpKernel for Snooping {
    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        ctx.tensor("bias", 0).map(drop)
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        true
    }
}

fn counting_registry(op_type: &str, calls: &Arc<AtomicUsize>, always: bool) -> KernelRegistry {
    let calls = Arc::clone(calls);
    let mut builder = KernelRegistry::builder();
    builder.register(KernelRegistration::new(op_type, Hob::device_type_is(DeviceType::Cpu), move || {
        Box::new(Counting {
            calls: Arc::clone(&calls),
            always,
        })
    }));
    builder.build()
}

fn ops() -> OpRegistry {
    let mut builder = OpRegistry::builder();
    register_builtin_ops(&mut builder);
    builder.register("copy", |_: &OpConf| Ok(Box::new(Passthrough) as Box<dyn Operator>));
    builder.build()
}

fn compile_copy(kernels: &KernelRegistry, desc: &BlobDesc) -> BoundKernel {
    let conf = OpConf::builder("copy", "copy").input("in", "a/out_0").output("out", 1).build();
    let (_, kernel) = OpCompiler::new(&ops(), kernels)
        .compile(
            conf,
            &BTreeMap::from([("in_0".to_owned(), desc.clone())]),
            &BTreeMap::from([("in_0".to_owned(), Some(0))]),
            &ParallelContext::single(),
        )
        .unwrap();
    kernel
}

fn launch_copy(kernel: &BoundKernel, desc: &BlobDesc) -> Result<LaunchOutcome> {
    let input = Blob::zeros(desc.clone());
    let mut output = Blob::zeros(desc.clone());
    kernel.launch(
        &DeviceCtx::cpu(),
        TensorBindings::new()
            .input("in", 0, input.view())
            .output("out", 0, output.view_mut()),
    )
}

#[test]
fn test_empty_outputs_skip_compute() {
    let empty = BlobDesc::new(shape![0, 4], DataType::Float32);
    let full = BlobDesc::new(shape![2, 4], DataType::Float32);

    let calls = Arc::new(AtomicUsize::new(0));
    let kernel = compile_copy(&counting_registry("copy", &calls, false), &empty);
    assert_eq!(launch_copy(&kernel, &empty).unwrap(), LaunchOutcome::Skipped);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let kernel = compile_copy(&counting_registry("copy", &calls, false), &full);
    assert_eq!(launch_copy(&kernel, &full).unwrap(), LaunchOutcome::Computed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let kernel = compile_copy(&counting_registry("copy", &calls, true), &empty);
    assert_eq!(launch_copy(&kernel, &empty).unwrap(), LaunchOutcome::Computed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_operator_without_outputs_is_skipped_unless_forced() {
    let desc = BlobDesc::new(shape![3], DataType::Float32);
    let conf = || {
        OpConf::builder(MODEL_SAVE_V2, "save")
            .input("in", "w/out_0")
            .input("in", "b/out_0")
            .attr("path", "/tmp/snapshot")
            .build()
    };
    let inputs = BTreeMap::from([("in_0".to_owned(), desc.clone()), ("in_1".to_owned(), desc.clone())]);
    let axes = BTreeMap::from([("in_0".to_owned(), None), ("in_1".to_owned(), None)]);
    let w = Blob::zeros(desc.clone());
    let b = Blob::zeros(desc);

    for (always, outcome, expected_calls) in [(false, LaunchOutcome::Skipped, 0), (true, LaunchOutcome::Computed, 1)] {
        let calls = Arc::new(AtomicUsize::new(0));
        let kernels = counting_registry(MODEL_SAVE_V2, &calls, always);
        let (_, kernel) = OpCompiler::new(&ops(), &kernels)
            .compile(conf(), &inputs, &axes, &ParallelContext::single())
            .unwrap();
        let bindings = TensorBindings::new().input("in", 0, w.view()).input("in", 1, b.view());
        assert_eq!(kernel.launch(&DeviceCtx::cpu(), bindings).unwrap(), outcome);
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
    }
}

#[test]
fn test_launch_rejects_bad_bindings() {
    let desc = BlobDesc::new(shape![2, 4], DataType::Float32);
    let calls = Arc::new(AtomicUsize::new(0));
    let kernel = compile_copy(&counting_registry("copy", &calls, false), &desc);

    let input = Blob::zeros(desc.clone());
    let mut output = Blob::zeros(desc.clone());
    let err = kernel
        .launch(&DeviceCtx::cpu(), TensorBindings::new().output("out", 0, output.view_mut()))
        .unwrap_err();
    assert!(matches!(err, OpError::MissingArg { .. }), "{err}");

    let extra = Blob::zeros(desc.clone());
    let err = kernel
        .launch(
            &DeviceCtx::cpu(),
            TensorBindings::new()
                .input("in", 0, input.view())
                .input("bias", 0, extra.view())
                .output("out", 0, output.view_mut()),
        )
        .unwrap_err();
    assert!(matches!(err, OpError::UnknownArg { .. }), "{err}");

    let wrong_shape = Blob::zeros(BlobDesc::new(shape![4, 2], DataType::Float32));
    let err = kernel
        .launch(
            &DeviceCtx::cpu(),
            TensorBindings::new()
                .input("in", 0, wrong_shape.view())
                .output("out", 0, output.view_mut()),
        )
        .unwrap_err();
    assert!(matches!(err, OpError::ShapeMismatch { .. }), "{err}");

    let wrong_type = Blob::zeros(BlobDesc::new(shape![2, 4], DataType::Float64));
    let err = kernel
        .launch(
            &DeviceCtx::cpu(),
            TensorBindings::new()
                .input("in", 0, wrong_type.view())
                .output("out", 0, output.view_mut()),
        )
        .unwrap_err();
    assert!(matches!(err, OpError::DataTypeMismatch { .. }), "{err}");

    let err = kernel
        .launch(
            &DeviceCtx::new(DeviceType::Gpu),
            TensorBindings::new()
                .input("in", 0, input.view())
                .output("out", 0, output.view_mut()),
        )
        .unwrap_err();
    assert!(matches!(err, OpError::DeviceMismatch { .. }), "{err}");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_undeclared_argument_fails_the_launch() {
    let desc = BlobDesc::new(shape![2], DataType::Float32);
    let mut builder = KernelRegistry::builder();
    builder.register(KernelRegistration::new("copy", Hob::always(), || Box::new(Snooping)));
    let kernel = compile_copy(&builder.build(), &desc);
    assert_eq!(
        launch_copy(&kernel, &desc).unwrap_err(),
        OpError::UnknownArg {
            op: "copy".into(),
            arg: "bias".into(),
            index: 0,
        }
    );
}

#[test]
fn test_temp_buffer_must_fit() {
    let ops = builtin_op_registry();
    let kernels = builtin_kernel_registry();
    let conf = OpConf::builder(PRELU, "act")
        .input("x", "in/out_0")
        .input("alpha", "alpha/out_0")
        .output("y", 1)
        .build();
    let inputs = BTreeMap::from([
        ("x_0".to_owned(), BlobDesc::new(shape![8], DataType::Float32)),
        ("alpha_0".to_owned(), BlobDesc::new(shape![1], DataType::Float32)),
    ]);
    let axes = BTreeMap::from([("x_0".to_owned(), Some(0)), ("alpha_0".to_owned(), None)]);
    let (_, kernel) = OpCompiler::new(&ops, &kernels)
        .compile(conf, &inputs, &axes, &ParallelContext::single())
        .unwrap();
    assert_eq!(kernel.tmp_size(), 32);

    let x = Blob::from_slice(shape![8], &[1.0f32; 8]).unwrap();
    let alpha = Blob::from_slice(shape![1], &[0.5f32]).unwrap();
    let mut y = Blob::zeros(BlobDesc::new(shape![8], DataType::Float32));

    let mut small = TmpBuffer::with_size(16);
    let err = kernel
        .launch(
            &DeviceCtx::cpu(),
            TensorBindings::new()
                .input("x", 0, x.view())
                .input("alpha", 0, alpha.view())
                .output("y", 0, y.view_mut())
                .tmp_buffer(&mut small),
        )
        .unwrap_err();
    assert_eq!(
        err,
        OpError::TmpBufferTooSmall {
            requested: 32,
            available: 16,
        }
    );

    let err = kernel
        .launch(
            &DeviceCtx::cpu(),
            TensorBindings::new()
                .input("x", 0, x.view())
                .input("alpha", 0, alpha.view())
                .output("y", 0, y.view_mut()),
        )
        .unwrap_err();
    assert!(matches!(err, OpError::TmpBufferTooSmall { available: 0, .. }));
}

#[test]
fn test_concurrent_launches_share_one_kernel() {
    let ops = builtin_op_registry();
    let kernels = builtin_kernel_registry();
    let n = 257;
    let conf = OpConf::builder(PRELU, "act")
        .input("x", "in/out_0")
        .input("alpha", "alpha/out_0")
        .output("y", 1)
        .build();
    let inputs = BTreeMap::from([
        ("x_0".to_owned(), BlobDesc::new(shape![n], DataType::Float64)),
        ("alpha_0".to_owned(), BlobDesc::new(shape![1], DataType::Float64)),
    ]);
    let axes = BTreeMap::from([("x_0".to_owned(), Some(0)), ("alpha_0".to_owned(), None)]);
    let (_, kernel) = OpCompiler::new(&ops, &kernels)
        .compile(conf, &inputs, &axes, &ParallelContext::single())
        .unwrap();
    let kernel = &kernel;

    std::thread::scope(|s| {
        for worker in 0..4u32 {
            s.spawn(move || {
                let offset = f64::from(worker);
                let data: Vec<f64> = (0..n).map(|i| f64::from(i as u32) - 128.0 + offset).collect();
                let x = Blob::from_slice(shape![n], &data).unwrap();
                let alpha = Blob::from_slice(shape![1], &[0.5f64]).unwrap();
                let mut y = Blob::zeros(BlobDesc::new(shape![n], DataType::Float64));
                let mut tmp = kernel.alloc_tmp_buffer();
                let outcome = kernel
                    .launch(
                        &DeviceCtx::cpu().with_parallel_threshold(64),
                        TensorBindings::new()
                            .input("x", 0, x.view())
                            .input("alpha", 0, alpha.view())
                            .output("y", 0, y.view_mut())
                            .tmp_buffer(&mut tmp),
                    )
                    .unwrap();
                assert_eq!(outcome, LaunchOutcome::Computed);
                let expected: Vec<f64> = data.iter().map(|&v| if v > 0.0 { v } else { v * 0.5 }).collect();
                assert_eq!(y.to_vec::<f64>().unwrap(), expected);
            });
        }
    });
}
