//! Split / broadcast / partial-sum parallel signatures.
//!
//! Every operator that takes part in distributed placement enumerates the
//! ways its blobs may be partitioned across the ranks of a parallel group.
//! A signature assigns exactly one [`SbpParallel`] to each input and output
//! blob name. The graph compiler later picks one signature per operator.

use core::fmt;
use core::num::NonZeroUsize;
use core::ops::Range;
use std::collections::BTreeMap;

use crate::blob::BlobDesc;
use crate::error::{OpError, Result};

/// Position of one rank inside its parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParallelContext {
    parallel_id: usize,
    parallel_num: NonZeroUsize,
}

impl ParallelContext {
    /// Rank `parallel_id` of a group of `parallel_num`.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidSbpSignature`] if the group is empty or the id is
    /// out of range.
    pub fn new(parallel_id: usize, parallel_num: usize) -> Result<Self> {
        let num = NonZeroUsize::new(parallel_num)
            .ok_or_else(|| OpError::invalid_sbp("parallel_context", "empty parallel group"))?;
        if parallel_id >= parallel_num {
            return Err(OpError::invalid_sbp(
                "parallel_context",
                format!("parallel id {parallel_id} out of range for {parallel_num} ranks"),
            ));
        }
        Ok(Self {
            parallel_id,
            parallel_num: num,
        })
    }

    /// A group of one.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            parallel_id: 0,
            parallel_num: NonZeroUsize::MIN,
        }
    }

    /// This rank's id.
    #[must_use]
    pub const fn parallel_id(&self) -> usize {
        self.parallel_id
    }

    /// Size of the group.
    #[must_use]
    pub const fn parallel_num(&self) -> usize {
        self.parallel_num.get()
    }

    /// This rank's share of `total` contiguous items.
    #[must_use]
    pub fn balanced_range(&self, total: usize) -> Range<usize> {
        BalancedSplitter::new(total, self.parallel_num).range(self.parallel_id)
    }
}

impl Default for ParallelContext {
    fn default() -> Self {
        Self::single()
    }
}

/// Splits `total` items into `parts` contiguous ranges whose sizes differ
/// by at most one; the first `total % parts` ranges get the extra item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancedSplitter {
    base: usize,
    remainder: usize,
    parts: NonZeroUsize,
}

impl BalancedSplitter {
    /// Creates the split of `total` over `parts`.
    #[must_use]
    pub const fn new(total: usize, parts: NonZeroUsize) -> Self {
        Self {
            base: total / parts.get(),
            remainder: total % parts.get(),
            parts,
        }
    }

    /// Range owned by part `id`. Ids past the last part get an empty range
    /// at the end.
    #[must_use]
    pub fn range(&self, id: usize) -> Range<usize> {
        let id = id.min(self.parts.get());
        let start = id * self.base + id.min(self.remainder);
        let len = if id < self.parts.get() {
            self.base + usize::from(id < self.remainder)
        } else {
            0
        };
        start..start + len
    }
}

/// Partitioning policy of one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SbpParallel {
    /// Each rank holds a contiguous slice along this axis.
    Split(usize),
    /// Each rank holds a full copy.
    Broadcast,
    /// Each rank holds a partial value; the logical blob is their sum.
    PartialSum,
}

impl fmt::Display for SbpParallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split(axis) => write!(f, "S({axis})"),
            Self::Broadcast => f.write_str("B"),
            Self::PartialSum => f.write_str("P"),
        }
    }
}

/// One policy per blob name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SbpSignature {
    bn2sbp: BTreeMap<String, SbpParallel>,
}

impl SbpSignature {
    /// Starts an empty signature for operator `op`.
    pub fn builder(op: impl Into<String>) -> SbpSignatureBuilder {
        SbpSignatureBuilder {
            op: op.into(),
            sig: Self::default(),
            conflict: None,
        }
    }

    /// Policy of blob `bn`.
    #[must_use]
    pub fn get(&self, bn: &str) -> Option<SbpParallel> {
        self.bn2sbp.get(bn).copied()
    }

    /// All assignments, ordered by blob name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, SbpParallel)> {
        self.bn2sbp.iter().map(|(bn, sbp)| (bn.as_str(), *sbp))
    }

    /// Number of assigned blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bn2sbp.len()
    }

    /// Whether no blob is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bn2sbp.is_empty()
    }
}

impl fmt::Display for SbpSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (bn, sbp)) in self.bn2sbp.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{bn}: {sbp}")?;
        }
        f.write_str("}")
    }
}

/// Builder for [`SbpSignature`]. Assigning two different policies to the
/// same blob is reported by [`SbpSignatureBuilder::build`].
#[derive(Debug, Clone)]
pub struct SbpSignatureBuilder {
    op: String,
    sig: SbpSignature,
    conflict: Option<String>,
}

impl SbpSignatureBuilder {
    /// Splits every blob in `bns` along `axis`.
    #[must_use]
    pub fn split<I, S>(self, bns: I, axis: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assign(bns, SbpParallel::Split(axis))
    }

    /// Broadcasts every blob in `bns`.
    #[must_use]
    pub fn broadcast<I, S>(self, bns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assign(bns, SbpParallel::Broadcast)
    }

    /// Marks every blob in `bns` as partial-sum.
    #[must_use]
    pub fn partial_sum<I, S>(self, bns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assign(bns, SbpParallel::PartialSum)
    }

    fn assign<I, S>(mut self, bns: I, sbp: SbpParallel) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for bn in bns {
            let bn = bn.into();
            match self.sig.bn2sbp.get(&bn) {
                Some(prev) if *prev != sbp && self.conflict.is_none() => {
                    self.conflict = Some(format!("`{bn}` is both {prev} and {sbp}"));
                }
                Some(_) => {}
                None => {
                    self.sig.bn2sbp.insert(bn, sbp);
                }
            }
        }
        self
    }

    /// Finishes the signature.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidSbpSignature`] if a blob received two policies.
    pub fn build(self) -> Result<SbpSignature> {
        match self.conflict {
            Some(reason) => Err(OpError::invalid_sbp(self.op, reason)),
            None => Ok(self.sig),
        }
    }
}

/// Every legal signature of one operator instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SbpSignatureList {
    signatures: Vec<SbpSignature>,
}

impl SbpSignatureList {
    /// An empty list: the operator does not take part in placement.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// Appends a signature.
    pub fn push(&mut self, sig: SbpSignature) {
        self.signatures.push(sig);
    }

    /// The signatures in enumeration order.
    #[must_use]
    pub fn signatures(&self) -> &[SbpSignature] {
        &self.signatures
    }

    /// Number of signatures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Whether the operator declared no signature.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Checks every signature against the operator's logical blobs: each
    /// blob gets exactly one policy, no unknown blob is named, and split
    /// axes exist.
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidSbpSignature`] describing the first violation.
    pub fn check(&self, op: &str, bn2desc: &BTreeMap<String, BlobDesc>) -> Result<()> {
        for sig in &self.signatures {
            for (bn, sbp) in sig.iter() {
                let desc = bn2desc
                    .get(bn)
                    .ok_or_else(|| OpError::invalid_sbp(op, format!("{sig} names unknown blob `{bn}`")))?;
                if let SbpParallel::Split(axis) = sbp
                    && axis >= desc.shape.num_axes()
                {
                    return Err(OpError::invalid_sbp(
                        op,
                        format!("{sig} splits `{bn}` of shape {} on axis {axis}", desc.shape),
                    ));
                }
            }
            if let Some(bn) = bn2desc.keys().find(|bn| sig.get(bn).is_none()) {
                return Err(OpError::invalid_sbp(op, format!("{sig} leaves `{bn}` unassigned")));
            }
        }
        Ok(())
    }
}

impl FromIterator<SbpSignature> for SbpSignatureList {
    fn from_iter<I: IntoIterator<Item = SbpSignature>>(iter: I) -> Self {
        Self {
            signatures: iter.into_iter().collect(),
        }
    }
}
