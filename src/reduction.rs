//! Per-worker accumulators combined at the end of a run.

use crate::error::{EbError, EbResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Associative, commutative combining operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Product,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
}

impl ReduceOp {
    /// Neutral element.
    #[must_use]
    pub fn identity(self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Product => 1.0,
            ReduceOp::Min => f64::INFINITY,
            ReduceOp::Max => f64::NEG_INFINITY,
        }
    }

    /// Combine two values.
    #[must_use]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Product => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

impl FromStr for ReduceOp {
    type Err = EbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(ReduceOp::Sum),
            "product" | "prod" => Ok(ReduceOp::Product),
            "min" => Ok(ReduceOp::Min),
            "max" => Ok(ReduceOp::Max),
            other => Err(EbError::Configuration(format!(
                "Invalid reduction '{other}'. Must be one of: sum, product, min, max"
            ))),
        }
    }
}

/// Fixed-length accumulator region.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    op: ReduceOp,
    values: Vec<f64>,
}

impl Reduction {
    /// Region of `len` elements set to the identity of `op`.
    #[must_use]
    pub fn new(op: ReduceOp, len: usize) -> Self {
        Self {
            op,
            values: vec![op.identity(); len],
        }
    }

    /// Operator.
    #[must_use]
    pub fn op(&self) -> ReduceOp {
        self.op
    }

    /// Current values.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Fold `value` into element `index`. Out-of-range indices are ignored.
    pub fn accumulate(&mut self, index: usize, value: f64) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = self.op.apply(*slot, value);
        }
    }

    /// Fold another region into this one element-wise.
    pub fn combine(&mut self, other: &Reduction) -> EbResult<()> {
        if other.op != self.op || other.values.len() != self.values.len() {
            return Err(EbError::Configuration(format!(
                "cannot combine {:?}[{}] into {:?}[{}]",
                other.op,
                other.values.len(),
                self.op,
                self.values.len()
            )));
        }
        for (a, b) in self.values.iter_mut().zip(&other.values) {
            *a = self.op.apply(*a, *b);
        }
        Ok(())
    }

    /// Combine every region; `None` for an empty input.
    pub fn combine_all<I>(regions: I) -> EbResult<Option<Reduction>>
    where
        I: IntoIterator<Item = Reduction>,
    {
        let mut iter = regions.into_iter();
        let Some(mut acc) = iter.next() else {
            return Ok(None);
        };
        for region in iter {
            acc.combine(&region)?;
        }
        Ok(Some(acc))
    }
}
