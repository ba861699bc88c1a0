// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluation orchestrators.
//!
//! [`faithfulness`] runs the perturb → measure → aggregate pipeline for a
//! single concept; [`consistency`] estimates how reliable any scalar
//! evaluator is across two halves of a corpus.

use candle_core::Tensor;

use crate::error::Result;

pub mod consistency;
pub mod faithfulness;

/// An evaluator that reduces a token corpus to a single scalar score.
///
/// The consistency evaluator treats every metric through this interface;
/// [`faithfulness::FaithfulnessEvaluator`] implements it by reporting its
/// configured summary statistic.
pub trait ScalarMetric {
    /// Reduce a `[corpus, seq]` token tensor to one scalar.
    ///
    /// # Errors
    ///
    /// Propagates whatever the underlying evaluation can fail with.
    fn scalar_metric(&self, tokens: &Tensor) -> Result<f32>;
}
