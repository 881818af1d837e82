//! `model_save_v2`: snapshots a variadic list of blobs to `path`.
//!
//! It is an infrastructure operator. It produces no outputs, has nothing to
//! infer and offers no parallel signature, which keeps it out of placement.
//! Writing the snapshot belongs to the execution layer, so no compute
//! kernel is registered for it here.

use crate::conf::OpConf;
use crate::error::Result;
use crate::operator::{ArgDef, BatchAxisCtx, InferBlobDescCtx, Operator, SbpCtx};
use crate::sbp::SbpSignatureList;

/// Type name.
pub const MODEL_SAVE_V2: &str = "model_save_v2";

/// Saves every `in` blob under `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSaveV2 {
    path: String,
}

impl ModelSaveV2 {
    /// Reads the `path` attribute.
    ///
    /// # Errors
    ///
    /// [`crate::OpError::MissingAttr`] or [`crate::OpError::AttrTypeMismatch`].
    pub fn from_conf(conf: &OpConf) -> Result<Self> {
        Ok(Self {
            path: conf.attr("path")?,
        })
    }

    /// Snapshot destination.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Operator for ModelSaveV2 {
    fn input_arg_defs(&self) -> &'static [ArgDef] {
        const DEFS: &[ArgDef] = &[ArgDef::repeated("in", 1)];
        DEFS
    }

    fn output_arg_defs(&self) -> &'static [ArgDef] {
        &[]
    }

    fn infer_blob_descs(&self, _ctx: &mut InferBlobDescCtx<'_>) -> Result<()> {
        Ok(())
    }

    fn infer_batch_axis(&self, _ctx: &mut BatchAxisCtx<'_>) -> Result<()> {
        Ok(())
    }

    fn get_sbp_signatures(&self, _ctx: &SbpCtx<'_>) -> Result<SbpSignatureList> {
        Ok(SbpSignatureList::new())
    }
}
