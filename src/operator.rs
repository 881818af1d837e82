//! The operator descriptor contract.
//!
//! An [`Operator`] is the per-type capability set: which arguments it takes,
//! how output descriptors follow from input descriptors, how the batch axis
//! propagates, which parallel signatures are legal and what it hands down
//! to its kernel. [`OperatorDescriptor`] pairs one such implementation with
//! the [`OpConf`] it was created from and is immutable once built.
//!
//! Operator types are looked up by name in an [`OpRegistry`], which is
//! assembled once at startup through [`OpRegistryBuilder`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::blob::BlobDesc;
use crate::conf::{KernelConf, OpConf, gen_repeated_bn};
use crate::error::{OpError, Result};
use crate::sbp::{ParallelContext, SbpSignatureList};

/// How many blobs an argument accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgNum {
    /// Exactly this many.
    Exact(usize),
    /// This many or more.
    AtLeast(usize),
}

impl ArgNum {
    const fn accepts(self, n: usize) -> bool {
        match self {
            Self::Exact(k) => n == k,
            Self::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for ArgNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(k) => write!(f, "exactly {k}"),
            Self::AtLeast(k) => write!(f, "at least {k}"),
        }
    }
}

/// Declaration of one input or output argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgDef {
    /// Argument name.
    pub name: &'static str,
    /// Whether the argument may be left out entirely.
    pub optional: bool,
    /// Accepted blob count when present.
    pub num: ArgNum,
}

impl ArgDef {
    /// A required argument holding exactly one blob.
    #[must_use]
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            optional: false,
            num: ArgNum::Exact(1),
        }
    }

    /// An optional argument holding exactly one blob when present.
    #[must_use]
    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            optional: true,
            num: ArgNum::Exact(1),
        }
    }

    /// A required argument holding `min` or more blobs.
    #[must_use]
    pub const fn repeated(name: &'static str, min: usize) -> Self {
        Self {
            name,
            optional: false,
            num: ArgNum::AtLeast(min),
        }
    }
}

/// Which axis, if any, holds independent examples.
pub type BatchAxis = Option<usize>;

/// Inputs and outputs of [`Operator::infer_blob_descs`].
#[derive(Debug)]
pub struct InferBlobDescCtx<'a> {
    conf: &'a OpConf,
    parallel_ctx: &'a ParallelContext,
    inputs: &'a BTreeMap<String, BlobDesc>,
    outputs: BTreeMap<String, BlobDesc>,
}

impl<'a> InferBlobDescCtx<'a> {
    /// Operator configuration.
    #[must_use]
    pub fn conf(&self) -> &'a OpConf {
        self.conf
    }

    /// Parallel placement of this instance.
    #[must_use]
    pub fn parallel_ctx(&self) -> &'a ParallelContext {
        self.parallel_ctx
    }

    /// Descriptor of input `arg` at `index`.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownArg`] if no such input was bound.
    pub fn input(&self, arg: &str, index: usize) -> Result<&'a BlobDesc> {
        lookup(self.inputs, self.conf.name(), arg, index)
    }

    /// Sets the descriptor of output `arg` at `index`.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownArg`] if the configuration does not produce it.
    pub fn set_output(&mut self, arg: &str, index: usize, desc: BlobDesc) -> Result<()> {
        if index >= self.conf.output_size(arg) {
            return Err(unknown_arg(self.conf.name(), arg, index));
        }
        self.outputs.insert(gen_repeated_bn(arg, index), desc);
        Ok(())
    }
}

/// Inputs and outputs of [`Operator::infer_batch_axis`].
#[derive(Debug)]
pub struct BatchAxisCtx<'a> {
    conf: &'a OpConf,
    input_defs: &'static [ArgDef],
    input_axes: &'a BTreeMap<String, BatchAxis>,
    output_axes: BTreeMap<String, BatchAxis>,
}

impl<'a> BatchAxisCtx<'a> {
    /// Operator configuration.
    #[must_use]
    pub fn conf(&self) -> &'a OpConf {
        self.conf
    }

    /// Batch axis of input `arg` at `index`.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownArg`] if no such input was bound.
    pub fn input(&self, arg: &str, index: usize) -> Result<BatchAxis> {
        lookup(self.input_axes, self.conf.name(), arg, index).copied()
    }

    /// Sets the batch axis of output `arg` at `index`.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownArg`] if the configuration does not produce it.
    pub fn set_output(&mut self, arg: &str, index: usize, axis: BatchAxis) -> Result<()> {
        if index >= self.conf.output_size(arg) {
            return Err(unknown_arg(self.conf.name(), arg, index));
        }
        self.output_axes.insert(gen_repeated_bn(arg, index), axis);
        Ok(())
    }
}

/// Logical blob descriptors visible to [`Operator::get_sbp_signatures`].
#[derive(Debug)]
pub struct SbpCtx<'a> {
    conf: &'a OpConf,
    descs: &'a BTreeMap<String, BlobDesc>,
}

impl<'a> SbpCtx<'a> {
    /// Operator configuration.
    #[must_use]
    pub fn conf(&self) -> &'a OpConf {
        self.conf
    }

    /// Logical descriptor of `arg` at `index`, input or output.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownArg`] if the operator has no such blob.
    pub fn desc(&self, arg: &str, index: usize) -> Result<&'a BlobDesc> {
        lookup(self.descs, self.conf.name(), arg, index)
    }
}

/// Physical blob descriptors visible to [`Operator::gen_kernel_conf`].
#[derive(Debug)]
pub struct KernelConfCtx<'a> {
    conf: &'a OpConf,
    parallel_ctx: &'a ParallelContext,
    descs: &'a BTreeMap<String, BlobDesc>,
}

impl<'a> KernelConfCtx<'a> {
    /// Operator configuration.
    #[must_use]
    pub fn conf(&self) -> &'a OpConf {
        self.conf
    }

    /// Parallel placement of this instance.
    #[must_use]
    pub fn parallel_ctx(&self) -> &'a ParallelContext {
        self.parallel_ctx
    }

    /// Physical descriptor of `arg` at `index`, input or output.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownArg`] if the operator has no such blob.
    pub fn desc(&self, arg: &str, index: usize) -> Result<&'a BlobDesc> {
        lookup(self.descs, self.conf.name(), arg, index)
    }
}

fn lookup<'a, V>(map: &'a BTreeMap<String, V>, op: &str, arg: &str, index: usize) -> Result<&'a V> {
    map.get(&gen_repeated_bn(arg, index))
        .ok_or_else(|| unknown_arg(op, arg, index))
}

fn unknown_arg(op: &str, arg: &str, index: usize) -> OpError {
    OpError::UnknownArg {
        op: op.to_owned(),
        arg: arg.to_owned(),
        index,
    }
}

/// Capabilities of one operator type.
///
/// Implementations are created from an [`OpConf`] by the factory registered
/// for their type name and hold whatever attributes they read from it.
pub trait Operator: Send + Sync {
    /// Declared input arguments.
    fn input_arg_defs(&self) -> &'static [ArgDef];

    /// Declared output arguments.
    fn output_arg_defs(&self) -> &'static [ArgDef];

    /// Infers every output descriptor from the input descriptors.
    ///
    /// Must be side-effect free: identical inputs give identical outputs.
    ///
    /// # Errors
    ///
    /// Any [`OpError`] describing why the inputs are malformed.
    fn infer_blob_descs(&self, ctx: &mut InferBlobDescCtx<'_>) -> Result<()>;

    /// Propagates the batch axis. Defaults to [`naive_infer_batch_axis`].
    ///
    /// # Errors
    ///
    /// Any [`OpError`] describing why the inputs are malformed.
    fn infer_batch_axis(&self, ctx: &mut BatchAxisCtx<'_>) -> Result<()> {
        naive_infer_batch_axis(ctx)
    }

    /// Enumerates legal parallel signatures. An empty list excludes the
    /// operator from placement.
    ///
    /// # Errors
    ///
    /// [`OpError::Unimplemented`] unless overridden.
    fn get_sbp_signatures(&self, ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        Err(OpError::Unimplemented {
            op: ctx.conf().op_type_name().to_owned(),
            what: "get_sbp_signatures",
        })
    }

    /// Records compile-time values the kernel needs. Nothing by default.
    ///
    /// # Errors
    ///
    /// Any [`OpError`] raised while reading the descriptors.
    fn gen_kernel_conf(&self, _ctx: &KernelConfCtx<'_>, _kernel_conf: &mut KernelConf) -> Result<()> {
        Ok(())
    }
}

/// Copies the batch axis of the first declared input to every output.
///
/// Operators without outputs have nothing to do. Operators with outputs
/// but no inputs have nothing to copy from and fail.
///
/// # Errors
///
/// [`OpError::MissingArg`] when there are outputs but no inputs.
pub fn naive_infer_batch_axis(ctx: &mut BatchAxisCtx<'_>) -> Result<()> {
    let conf = ctx.conf;
    let obns: Vec<(String, usize)> = conf
        .outputs()
        .iter()
        .flat_map(|(arg, &n)| (0..n).map(move |i| (arg.clone(), i)))
        .collect();
    if obns.is_empty() {
        return Ok(());
    }
    let first = ctx
        .input_defs
        .iter()
        .map(|def| def.name)
        .find(|name| conf.input_size(name) > 0)
        .ok_or_else(|| OpError::MissingArg {
            op: conf.name().to_owned(),
            arg: "<input>".to_owned(),
            reason: "batch axis of outputs cannot be inferred without inputs".to_owned(),
        })?;
    let axis = ctx.input(first, 0)?;
    for (arg, i) in obns {
        ctx.set_output(&arg, i, axis)?;
    }
    Ok(())
}

/// Creates an operator implementation from its configuration.
pub type OpFactory = Arc<dyn Fn(&OpConf) -> Result<Box<dyn Operator>> + Send + Sync>;

/// Immutable table from operator type name to factory.
#[derive(Clone, Default)]
pub struct OpRegistry {
    factories: BTreeMap<String, OpFactory>,
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("op_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OpRegistry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> OpRegistryBuilder {
        OpRegistryBuilder::default()
    }

    /// Whether `op_type` is registered.
    #[must_use]
    pub fn contains(&self, op_type: &str) -> bool {
        self.factories.contains_key(op_type)
    }

    /// Registered type names in order.
    pub fn op_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    fn create(&self, conf: &OpConf) -> Result<Box<dyn Operator>> {
        let factory = self
            .factories
            .get(conf.op_type_name())
            .ok_or_else(|| OpError::UnknownOpType(conf.op_type_name().to_owned()))?;
        factory(conf)
    }
}

/// Collects operator factories during startup.
#[derive(Default)]
pub struct OpRegistryBuilder {
    factories: BTreeMap<String, OpFactory>,
}

impl OpRegistryBuilder {
    /// Registers `factory` for `op_type`, replacing any earlier one.
    pub fn register<F>(&mut self, op_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&OpConf) -> Result<Box<dyn Operator>> + Send + Sync + 'static,
    {
        self.factories.insert(op_type.into(), Arc::new(factory));
        self
    }

    /// Freezes the table.
    #[must_use]
    pub fn build(self) -> OpRegistry {
        debug!(op_types = self.factories.len(), "operator registry built");
        OpRegistry {
            factories: self.factories,
        }
    }
}

/// One configured operator instance.
pub struct OperatorDescriptor {
    conf: OpConf,
    op: Box<dyn Operator>,
}

impl fmt::Debug for OperatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("conf", &self.conf)
            .finish_non_exhaustive()
    }
}

impl OperatorDescriptor {
    /// Instantiates the operator for `conf` and checks the configured
    /// arguments against its declaration.
    ///
    /// # Errors
    ///
    /// [`OpError::UnknownOpType`] for an unregistered type,
    /// [`OpError::MissingArg`] for an absent or miscounted argument,
    /// [`OpError::UnknownArg`] for an undeclared one, or whatever the
    /// factory reports.
    pub fn new(conf: OpConf, registry: &OpRegistry) -> Result<Self> {
        let op = registry.create(&conf)?;
        check_args(&conf, op.input_arg_defs(), conf.inputs().iter().map(|(a, v)| (a, v.len())))?;
        check_args(&conf, op.output_arg_defs(), conf.outputs().iter().map(|(a, n)| (a, *n)))?;
        Ok(Self { conf, op })
    }

    /// The configuration this instance was built from.
    #[must_use]
    pub fn conf(&self) -> &OpConf {
        &self.conf
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.conf.name()
    }

    /// Operator type name.
    #[must_use]
    pub fn op_type_name(&self) -> &str {
        self.conf.op_type_name()
    }

    /// Input blob names, `<arg>_<index>`.
    #[must_use]
    pub fn input_bns(&self) -> Vec<String> {
        repeated_bns(self.conf.inputs().iter().map(|(a, v)| (a, v.len())))
    }

    /// Output blob names, `<arg>_<index>`.
    #[must_use]
    pub fn output_bns(&self) -> Vec<String> {
        repeated_bns(self.conf.outputs().iter().map(|(a, n)| (a, *n)))
    }

    /// Runs output descriptor inference.
    ///
    /// # Errors
    ///
    /// [`OpError::MissingArg`] if an input is unbound or the operator left
    /// an output uninferred, plus anything the operator reports.
    pub fn infer_blob_descs(
        &self,
        inputs: &BTreeMap<String, BlobDesc>,
        parallel_ctx: &ParallelContext,
    ) -> Result<BTreeMap<String, BlobDesc>> {
        for ibn in self.input_bns() {
            if !inputs.contains_key(&ibn) {
                return Err(self.missing(&ibn, "input descriptor not supplied"));
            }
        }
        let mut ctx = InferBlobDescCtx {
            conf: &self.conf,
            parallel_ctx,
            inputs,
            outputs: BTreeMap::new(),
        };
        self.op.infer_blob_descs(&mut ctx)?;
        for obn in self.output_bns() {
            if !ctx.outputs.contains_key(&obn) {
                return Err(self.missing(&obn, "output descriptor not inferred"));
            }
        }
        Ok(ctx.outputs)
    }

    /// Runs batch-axis inference.
    ///
    /// # Errors
    ///
    /// [`OpError::MissingArg`] if an input axis is unbound or an output axis
    /// was left uninferred, plus anything the operator reports.
    pub fn infer_batch_axis(
        &self,
        input_axes: &BTreeMap<String, BatchAxis>,
    ) -> Result<BTreeMap<String, BatchAxis>> {
        for ibn in self.input_bns() {
            if !input_axes.contains_key(&ibn) {
                return Err(self.missing(&ibn, "input batch axis not supplied"));
            }
        }
        let mut ctx = BatchAxisCtx {
            conf: &self.conf,
            input_defs: self.op.input_arg_defs(),
            input_axes,
            output_axes: BTreeMap::new(),
        };
        self.op.infer_batch_axis(&mut ctx)?;
        for obn in self.output_bns() {
            if !ctx.output_axes.contains_key(&obn) {
                return Err(self.missing(&obn, "output batch axis not inferred"));
            }
        }
        Ok(ctx.output_axes)
    }

    /// Enumerates and validates the operator's parallel signatures over its
    /// logical input and output descriptors.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidSbpSignature`] for a signature that does not fit
    /// the blobs, plus anything the operator reports.
    pub fn get_sbp_signatures(&self, descs: &BTreeMap<String, BlobDesc>) -> Result<SbpSignatureList> {
        let ctx = SbpCtx {
            conf: &self.conf,
            descs,
        };
        let list = self.op.get_sbp_signatures(&ctx)?;
        list.check(self.name(), descs)?;
        Ok(list)
    }

    /// Generates the kernel configuration from physical descriptors.
    ///
    /// # Errors
    ///
    /// Anything the operator reports.
    pub fn gen_kernel_conf(
        &self,
        descs: &BTreeMap<String, BlobDesc>,
        parallel_ctx: &ParallelContext,
    ) -> Result<KernelConf> {
        let ctx = KernelConfCtx {
            conf: &self.conf,
            parallel_ctx,
            descs,
        };
        let mut kernel_conf = KernelConf::default();
        self.op.gen_kernel_conf(&ctx, &mut kernel_conf)?;
        Ok(kernel_conf)
    }

    fn missing(&self, bn: &str, reason: &str) -> OpError {
        OpError::MissingArg {
            op: self.name().to_owned(),
            arg: bn.to_owned(),
            reason: reason.to_owned(),
        }
    }
}

fn repeated_bns<'a>(args: impl Iterator<Item = (&'a String, usize)>) -> Vec<String> {
    args.flat_map(|(arg, n)| (0..n).map(move |i| gen_repeated_bn(arg, i)))
        .collect()
}

fn check_args<'a>(
    conf: &OpConf,
    defs: &[ArgDef],
    configured: impl Iterator<Item = (&'a String, usize)>,
) -> Result<()> {
    let configured: BTreeMap<&str, usize> = configured.map(|(a, n)| (a.as_str(), n)).collect();
    for def in defs {
        let n = configured.get(def.name).copied().unwrap_or(0);
        if n == 0 && def.optional {
            continue;
        }
        if !def.num.accepts(n) {
            return Err(OpError::MissingArg {
                op: conf.name().to_owned(),
                arg: def.name.to_owned(),
                reason: format!("expected {} blobs, got {n}", def.num),
            });
        }
    }
    if let Some(arg) = configured.keys().find(|a| !defs.iter().any(|d| d.name == **a)) {
        return Err(unknown_arg(conf.name(), arg, 0));
    }
    debug!(op = conf.name(), op_type = conf.op_type_name(), "operator arguments checked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::shape;

    struct Identity;

    impl Operator for Identity {
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
    }

    fn registry() -> OpRegistry {
        let mut b = OpRegistry::builder();
        b.register("identity", |_: &OpConf| Ok(Box::new(Identity) as Box<dyn Operator>));
        b.build()
    }

    fn conf() -> OpConf {
        OpConf::builder("identity", "id")
            .input("in", "a/out_0")
            .output("out", 1)
            .build()
    }

    #[test]
    fn rejects_unknown_type_and_bad_args() {
        let reg = registry();
        let unknown = OpConf::builder("nope", "n").build();
        assert!(matches!(
            OperatorDescriptor::new(unknown, &reg).unwrap_err(),
            OpError::UnknownOpType(_)
        ));

        let missing = OpConf::builder("identity", "id").output("out", 1).build();
        assert!(matches!(
            OperatorDescriptor::new(missing, &reg).unwrap_err(),
            OpError::MissingArg { .. }
        ));

        let extra = OpConf::builder("identity", "id")
            .input("in", "a")
            .input("bias", "b")
            .output("out", 1)
            .build();
        assert!(matches!(
            OperatorDescriptor::new(extra, &reg).unwrap_err(),
            OpError::UnknownArg { .. }
        ));
    }

    #[test]
    fn infers_and_names_blobs() {
        let op = OperatorDescriptor::new(conf(), &registry()).unwrap();
        assert_eq!(op.input_bns(), vec!["in_0"]);
        assert_eq!(op.output_bns(), vec!["out_0"]);

        let inputs = BTreeMap::from([("in_0".to_owned(), BlobDesc::new(shape![2, 3], DataType::Float32))]);
        let outputs = op.infer_blob_descs(&inputs, &ParallelContext::single()).unwrap();
        assert_eq!(outputs["out_0"], inputs["in_0"]);

        assert!(matches!(
            op.infer_blob_descs(&BTreeMap::new(), &ParallelContext::single()),
            Err(OpError::MissingArg { .. })
        ));
    }

    #[test]
    fn naive_batch_axis_copies_first_input() {
        let op = OperatorDescriptor::new(conf(), &registry()).unwrap();
        let axes = op
            .infer_batch_axis(&BTreeMap::from([("in_0".to_owned(), Some(0))]))
            .unwrap();
        assert_eq!(axes["out_0"], Some(0));
    }

    #[test]
    fn sbp_defaults_to_unimplemented() {
        let op = OperatorDescriptor::new(conf(), &registry()).unwrap();
        assert_eq!(
            op.get_sbp_signatures(&BTreeMap::new()).unwrap_err(),
            OpError::Unimplemented {
                op: "identity".into(),
                what: "get_sbp_signatures",
            }
        );
        assert!(op
            .gen_kernel_conf(&BTreeMap::new(), &ParallelContext::single())
            .unwrap()
            .is_empty());
    }
}
