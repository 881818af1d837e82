//! Operator configuration.
//!
//! [`OpConf`] is the immutable record an operator is instantiated from: its
//! name, its type, the device it is placed on, which logical blobs feed
//! each input argument, how many blobs each output argument produces, and
//! typed attributes. This layer never interprets attributes itself; each
//! operator reads the ones it knows about.
//!
//! [`KernelConf`] carries values an operator derives once at compile time
//! for its kernel (e.g. the class-range offset of a model-split loss).

use std::collections::BTreeMap;

use crate::device::DeviceType;
use crate::dtype::DataType;
use crate::error::{OpError, Result};
use crate::shape::Shape;

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Boolean flag.
    Bool(bool),
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit integer.
    Int64(i64),
    /// Single precision float.
    Float(f32),
    /// Double precision float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// A shape.
    Shape(Shape),
    /// An element type.
    DataType(DataType),
    /// List of 64-bit integers.
    ListInt64(Vec<i64>),
}

impl AttrValue {
    /// Name of the stored variant, used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Shape(_) => "shape",
            Self::DataType(_) => "data_type",
            Self::ListInt64(_) => "list_int64",
        }
    }
}

/// Rust types readable from an [`AttrValue`].
pub trait AttrType: Sized {
    /// Name used in error messages.
    const TYPE_NAME: &'static str;

    /// Extracts the value when the variant matches.
    fn from_attr(value: &AttrValue) -> Option<Self>;
}

macro_rules! impl_attr_type {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl AttrType for $ty {
            const TYPE_NAME: &'static str = $name;

            fn from_attr(value: &AttrValue) -> Option<Self> {
                match value {
                    AttrValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for AttrValue {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        }
    };
}

impl_attr_type!(bool, Bool, "bool");
impl_attr_type!(i32, Int32, "int32");
impl_attr_type!(i64, Int64, "int64");
impl_attr_type!(f32, Float, "float");
impl_attr_type!(f64, Double, "double");
impl_attr_type!(String, String, "string");
impl_attr_type!(Shape, Shape, "shape");
impl_attr_type!(DataType, DataType, "data_type");
impl_attr_type!(Vec<i64>, ListInt64, "list_int64");

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

fn read_attr<T: AttrType>(attrs: &BTreeMap<String, AttrValue>, op: &str, name: &str) -> Result<T> {
    let value = attrs.get(name).ok_or_else(|| OpError::MissingAttr {
        op: op.to_owned(),
        attr: name.to_owned(),
    })?;
    T::from_attr(value).ok_or_else(|| OpError::AttrTypeMismatch {
        op: op.to_owned(),
        attr: name.to_owned(),
        expected: T::TYPE_NAME,
        actual: value.type_name(),
    })
}

/// Immutable configuration of one operator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct OpConf {
    name: String,
    op_type_name: String,
    device_type: DeviceType,
    inputs: BTreeMap<String, Vec<String>>,
    outputs: BTreeMap<String, usize>,
    attrs: BTreeMap<String, AttrValue>,
}

impl OpConf {
    /// Starts a configuration for an operator of `op_type_name` called `name`.
    pub fn builder(op_type_name: impl Into<String>, name: impl Into<String>) -> OpConfBuilder {
        OpConfBuilder {
            conf: Self {
                name: name.into(),
                op_type_name: op_type_name.into(),
                device_type: DeviceType::Cpu,
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
                attrs: BTreeMap::new(),
            },
        }
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operator type name, the key into the operator and kernel registries.
    #[must_use]
    pub fn op_type_name(&self) -> &str {
        &self.op_type_name
    }

    /// Device this instance is placed on.
    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Logical blob names feeding each input argument.
    #[must_use]
    pub fn inputs(&self) -> &BTreeMap<String, Vec<String>> {
        &self.inputs
    }

    /// Number of blobs produced by each output argument.
    #[must_use]
    pub fn outputs(&self) -> &BTreeMap<String, usize> {
        &self.outputs
    }

    /// Number of blobs bound to input argument `arg`.
    #[must_use]
    pub fn input_size(&self, arg: &str) -> usize {
        self.inputs.get(arg).map_or(0, Vec::len)
    }

    /// Number of blobs produced by output argument `arg`.
    #[must_use]
    pub fn output_size(&self, arg: &str) -> usize {
        self.outputs.get(arg).copied().unwrap_or(0)
    }

    /// Logical blob name of an output, `<op name>/<arg>_<index>`.
    #[must_use]
    pub fn output_lbn(&self, arg: &str, index: usize) -> String {
        format!("{}/{}", self.name, gen_repeated_bn(arg, index))
    }

    /// Reads attribute `name` as `T`.
    ///
    /// # Errors
    ///
    /// [`OpError::MissingAttr`] or [`OpError::AttrTypeMismatch`].
    pub fn attr<T: AttrType>(&self, name: &str) -> Result<T> {
        read_attr(&self.attrs, &self.name, name)
    }
}

/// Builder for [`OpConf`].
#[derive(Debug, Clone)]
pub struct OpConfBuilder {
    conf: OpConf,
}

impl OpConfBuilder {
    /// Places the operator on `device_type`.
    #[must_use]
    pub fn device(mut self, device_type: DeviceType) -> Self {
        self.conf.device_type = device_type;
        self
    }

    /// Appends one logical blob to input argument `arg`.
    #[must_use]
    pub fn input(mut self, arg: impl Into<String>, lbn: impl Into<String>) -> Self {
        self.conf
            .inputs
            .entry(arg.into())
            .or_default()
            .push(lbn.into());
        self
    }

    /// Declares that output argument `arg` produces `num` blobs.
    #[must_use]
    pub fn output(mut self, arg: impl Into<String>, num: usize) -> Self {
        self.conf.outputs.insert(arg.into(), num);
        self
    }

    /// Sets attribute `name`.
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.conf.attrs.insert(name.into(), value.into());
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> OpConf {
        self.conf
    }
}

/// Blob name of the `index`-th blob of argument `arg`: `<arg>_<index>`.
#[must_use]
pub fn gen_repeated_bn(arg: &str, index: usize) -> String {
    format!("{arg}_{index}")
}

/// Values computed at compile time for one kernel instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelConf {
    attrs: BTreeMap<String, AttrValue>,
}

impl KernelConf {
    /// Records `name`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Reads `name` as `T`.
    ///
    /// # Errors
    ///
    /// [`OpError::MissingAttr`] or [`OpError::AttrTypeMismatch`].
    pub fn get<T: AttrType>(&self, name: &str) -> Result<T> {
        read_attr(&self.attrs, "kernel_conf", name)
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn reads_typed_attributes() {
        let conf = OpConf::builder("sparse_cross_entropy_ms1", "loss")
            .input("prediction", "fc/out_0")
            .input("label", "data/label_0")
            .output("out", 1)
            .attr("depth", 1000i64)
            .attr("shape", shape![2, 3])
            .build();
        assert_eq!(conf.attr::<i64>("depth").unwrap(), 1000);
        assert_eq!(conf.attr::<Shape>("shape").unwrap(), shape![2, 3]);
        assert_eq!(conf.input_size("prediction"), 1);
        assert_eq!(conf.output_size("out"), 1);
        assert_eq!(conf.output_lbn("out", 0), "loss/out_0");
    }

    #[test]
    fn reports_missing_and_mistyped_attributes() {
        let conf = OpConf::builder("prelu", "p").attr("depth", 3i32).build();
        assert_eq!(
            conf.attr::<i64>("depth").unwrap_err(),
            OpError::AttrTypeMismatch {
                op: "p".into(),
                attr: "depth".into(),
                expected: "int64",
                actual: "int32",
            }
        );
        assert!(matches!(
            conf.attr::<bool>("nope").unwrap_err(),
            OpError::MissingAttr { .. }
        ));
    }

    #[test]
    fn kernel_conf_round_trip() {
        let mut kc = KernelConf::default();
        assert!(kc.is_empty());
        kc.set("lower_bound", 40i64);
        assert_eq!(kc.get::<i64>("lower_bound").unwrap(), 40);
    }
}
