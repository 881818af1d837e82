//! Kernel registration and resolution.
//!
//! A [`KernelRegistry`] maps an operator type name to any number of
//! candidate [`KernelRegistration`]s. Each candidate carries a [`Hob`]
//! matcher, a boolean expression over the device type and the data types
//! of specific arguments. Resolution evaluates every candidate of the
//! operator type and accepts exactly one match; zero or several matches
//! are configuration errors.
//!
//! The registry is assembled once through [`KernelRegistryBuilder`] and is
//! read-only afterwards, so it can be shared across threads without locks.
//!
//! # Example
//! ```
//! use opkernel::registry::{Hob, KernelRegistration, KernelRegistry};
//! use opkernel::device::DeviceType;
//! use opkernel::dtype::DataType;
//!
//! let matcher = Hob::device_type_is(DeviceType::Cpu) & Hob::data_type_is("y", 0, DataType::Float32);
//! assert_eq!(matcher.description(), "(device_type == cpu) & (data_type(y_0) == float32)");
//! let registry = KernelRegistry::builder().build();
//! assert!(registry.candidates("relu").is_empty());
//! ```

use core::fmt;
use core::ops::{BitAnd, BitOr, Not};
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::blob::BlobDesc;
use crate::conf::{OpConf, gen_repeated_bn};
use crate::device::DeviceType;
use crate::dtype::DataType;
use crate::error::{OpError, Result};
use crate::kernel::OpKernel;
use crate::shape::Shape;
use crate::tmp_buffer::aligned_size;

/// What a matcher or temp-size function can look at.
#[derive(Debug, Clone, Copy)]
pub struct KernelRegContext<'a> {
    conf: &'a OpConf,
    device_type: DeviceType,
    descs: &'a BTreeMap<String, BlobDesc>,
}

impl<'a> KernelRegContext<'a> {
    /// Context for `conf` placed on `device_type`, with the compiled
    /// descriptors of all its input and output blobs.
    #[must_use]
    pub const fn new(conf: &'a OpConf, device_type: DeviceType, descs: &'a BTreeMap<String, BlobDesc>) -> Self {
        Self {
            conf,
            device_type,
            descs,
        }
    }

    /// Operator type being resolved.
    #[must_use]
    pub fn op_type_name(&self) -> &'a str {
        self.conf.op_type_name()
    }

    /// Operator configuration.
    #[must_use]
    pub const fn conf(&self) -> &'a OpConf {
        self.conf
    }

    /// Device being resolved for.
    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Descriptor of `arg` at `index`.
    #[must_use]
    pub fn desc4arg(&self, arg: &str, index: usize) -> Option<&'a BlobDesc> {
        self.descs.get(&gen_repeated_bn(arg, index))
    }

    /// Data type of `arg` at `index`.
    #[must_use]
    pub fn data_type4arg(&self, arg: &str, index: usize) -> Option<DataType> {
        self.desc4arg(arg, index).map(|d| d.data_type)
    }

    /// Shape of `arg` at `index`.
    #[must_use]
    pub fn shape4arg(&self, arg: &str, index: usize) -> Option<&'a Shape> {
        self.desc4arg(arg, index).map(|d| &d.shape)
    }
}

impl fmt::Display for KernelRegContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device_type={}", self.device_type)?;
        for (bn, desc) in self.descs {
            write!(f, ", {bn}:{}", desc.data_type)?;
        }
        Ok(())
    }
}

type HobFn = dyn Fn(&KernelRegContext<'_>) -> bool + Send + Sync;

fn hob_fn<F>(f: F) -> Arc<HobFn>
where
    F: Fn(&KernelRegContext<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Boolean matcher over a [`KernelRegContext`], combinable with `&`, `|`
/// and `!`.
#[derive(Clone)]
pub struct Hob {
    description: String,
    eval: Arc<HobFn>,
}

impl fmt::Debug for Hob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hob").field(&self.description).finish()
    }
}

impl Hob {
    /// A matcher from an arbitrary predicate.
    pub fn new<F>(description: impl Into<String>, eval: F) -> Self
    where
        F: Fn(&KernelRegContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            eval: hob_fn(eval),
        }
    }

    /// Matches when the device type equals `device_type`.
    #[must_use]
    pub fn device_type_is(device_type: DeviceType) -> Self {
        Self::new(format!("device_type == {device_type}"), move |ctx| {
            ctx.device_type() == device_type
        })
    }

    /// Matches when argument `arg` at `index` exists and has `data_type`.
    #[must_use]
    pub fn data_type_is(arg: &'static str, index: usize, data_type: DataType) -> Self {
        Self::new(
            format!("data_type({}) == {data_type}", gen_repeated_bn(arg, index)),
            move |ctx| ctx.data_type4arg(arg, index) == Some(data_type),
        )
    }

    /// Matches everything.
    #[must_use]
    pub fn always() -> Self {
        Self::new("true", |_| true)
    }

    /// Human readable form, used in diagnostics.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Evaluates the matcher.
    #[must_use]
    pub fn eval(&self, ctx: &KernelRegContext<'_>) -> bool {
        (self.eval)(ctx)
    }
}

impl BitAnd for Hob {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        let (l, r) = (self.eval, rhs.eval);
        Self {
            description: format!("({}) & ({})", self.description, rhs.description),
            eval: hob_fn(move |ctx| l(ctx) && r(ctx)),
        }
    }
}

impl BitOr for Hob {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        let (l, r) = (self.eval, rhs.eval);
        Self {
            description: format!("({}) | ({})", self.description, rhs.description),
            eval: hob_fn(move |ctx| l(ctx) || r(ctx)),
        }
    }
}

impl Not for Hob {
    type Output = Self;

    fn not(self) -> Self {
        let inner = self.eval;
        Self {
            description: format!("!({})", self.description),
            eval: hob_fn(move |ctx| !inner(ctx)),
        }
    }
}

type CreateFn = dyn Fn() -> Box<dyn OpKernel> + Send + Sync;
type InferTmpSizeFn = dyn Fn(&KernelRegContext<'_>) -> usize + Send + Sync;

/// One candidate kernel for an operator type.
#[derive(Clone)]
pub struct KernelRegistration {
    op_type: String,
    matcher: Hob,
    create_fn: Arc<CreateFn>,
    infer_tmp_size_fn: Option<Arc<InferTmpSizeFn>>,
}

impl fmt::Debug for KernelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistration")
            .field("op_type", &self.op_type)
            .field("matcher", &self.matcher)
            .field("has_infer_tmp_size_fn", &self.infer_tmp_size_fn.is_some())
            .finish_non_exhaustive()
    }
}

impl KernelRegistration {
    /// A candidate for `op_type` selected by `matcher`.
    pub fn new<F>(op_type: impl Into<String>, matcher: Hob, create_fn: F) -> Self
    where
        F: Fn() -> Box<dyn OpKernel> + Send + Sync + 'static,
    {
        Self {
            op_type: op_type.into(),
            matcher,
            create_fn: Arc::new(create_fn),
            infer_tmp_size_fn: None,
        }
    }

    /// Attaches a temp-buffer size function, in bytes.
    #[must_use]
    pub fn with_infer_tmp_size_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&KernelRegContext<'_>) -> usize + Send + Sync + 'static,
    {
        self.infer_tmp_size_fn = Some(Arc::new(f));
        self
    }

    /// Operator type this candidate serves.
    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// The matcher.
    #[must_use]
    pub fn matcher(&self) -> &Hob {
        &self.matcher
    }

    /// Creates a fresh kernel instance.
    #[must_use]
    pub fn create(&self) -> Box<dyn OpKernel> {
        (self.create_fn)()
    }

    /// Temp-buffer bytes for `ctx`, rounded up to the buffer alignment;
    /// zero without a size function.
    #[must_use]
    pub fn infer_tmp_size(&self, ctx: &KernelRegContext<'_>) -> usize {
        self.infer_tmp_size_fn
            .as_ref()
            .map_or(0, |f| aligned_size(f(ctx)))
    }
}

/// Collects registrations during startup.
#[derive(Debug, Default)]
pub struct KernelRegistryBuilder {
    registrations: BTreeMap<String, Vec<KernelRegistration>>,
}

impl KernelRegistryBuilder {
    /// Adds one candidate. Several candidates per operator type are
    /// expected, so no uniqueness check happens here.
    pub fn register(&mut self, registration: KernelRegistration) -> &mut Self {
        self.registrations
            .entry(registration.op_type.clone())
            .or_default()
            .push(registration);
        self
    }

    /// Freezes the table.
    #[must_use]
    pub fn build(self) -> KernelRegistry {
        for (op_type, regs) in &self.registrations {
            debug!(op_type = %op_type, candidates = regs.len(), "kernel registrations");
        }
        KernelRegistry {
            registrations: self.registrations,
        }
    }
}

/// Read-only table of kernel candidates per operator type.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    registrations: BTreeMap<String, Vec<KernelRegistration>>,
}

impl KernelRegistry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> KernelRegistryBuilder {
        KernelRegistryBuilder::default()
    }

    /// All candidates registered for `op_type`.
    #[must_use]
    pub fn candidates(&self, op_type: &str) -> &[KernelRegistration] {
        self.registrations
            .get(op_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Candidates of `ctx`'s operator type whose matcher accepts `ctx`.
    #[must_use]
    pub fn matching_candidates(&self, ctx: &KernelRegContext<'_>) -> Vec<&KernelRegistration> {
        self.candidates(ctx.op_type_name())
            .iter()
            .filter(|r| r.matcher.eval(ctx))
            .collect()
    }

    /// The single candidate accepting `ctx`.
    ///
    /// # Errors
    ///
    /// [`OpError::MissingKernel`] when nothing matches,
    /// [`OpError::AmbiguousKernel`] when several candidates do.
    pub fn resolve(&self, ctx: &KernelRegContext<'_>) -> Result<&KernelRegistration> {
        let op_type = ctx.op_type_name();
        let matched = self.matching_candidates(ctx);
        match matched.as_slice() {
            [only] => {
                debug!(op_type, matcher = only.matcher.description(), "kernel resolved");
                Ok(only)
            }
            [] => {
                error!(op_type, %ctx, "no kernel registration matches");
                Err(OpError::MissingKernel {
                    op_type: op_type.to_owned(),
                    context: ctx.to_string(),
                })
            }
            many => {
                let candidates = many
                    .iter()
                    .map(|r| r.matcher.description())
                    .collect::<Vec<_>>()
                    .join("; ");
                error!(op_type, %ctx, count = many.len(), "ambiguous kernel registrations");
                Err(OpError::AmbiguousKernel {
                    op_type: op_type.to_owned(),
                    context: ctx.to_string(),
                    count: many.len(),
                    candidates,
                })
            }
        }
    }

    /// Temp-buffer bytes of the kernel resolved for `ctx`.
    ///
    /// # Errors
    ///
    /// Whatever [`KernelRegistry::resolve`] reports.
    pub fn infer_tmp_size(&self, ctx: &KernelRegContext<'_>) -> Result<usize> {
        self.resolve(ctx).map(|r| r.infer_tmp_size(ctx))
    }
}
