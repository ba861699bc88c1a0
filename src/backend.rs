// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait: the model interface the evaluators consume.
//!
//! [`ConceptBackend`] is the only thing a model has to implement to be
//! evaluated: a hook-aware forward pass and (for the gradient probe) the
//! gradient of a scalar objective with respect to the activation at a
//! named site.  Model loading, device placement, and tokenisation live
//! with the implementor.

use std::fmt;

use candle_core::Tensor;

use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

// ---------------------------------------------------------------------------
// GradientTarget
// ---------------------------------------------------------------------------

/// Scalar objective the gradient probe differentiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientTarget {
    /// Mean next-token negative log-likelihood over the minibatch.
    MeanLoss,
    /// Logit of a fixed vocabulary class, summed over batch and positions.
    ClassLogit(u32),
}

impl fmt::Display for GradientTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeanLoss => write!(f, "mean_loss"),
            Self::ClassLogit(idx) => write!(f, "class_logit[{idx}]"),
        }
    }
}

// ---------------------------------------------------------------------------
// ConceptBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for model backends with hook-aware forward passes.
///
/// The model's parameters are read-only from this crate's perspective:
/// [`site_gradient`](Self::site_gradient) differentiates through the
/// forward pass but never applies the resulting gradient to weights, and
/// [`clear_gradients`](Self::clear_gradients) resets any accumulated
/// gradient state between minibatches.
pub trait ConceptBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of layers.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    // --- Core forward pass -----------------------------------------------

    /// Forward pass with optional hook capture and concept interventions.
    ///
    /// The returned [`HookCache`] always contains the output logits and any
    /// activations requested via [`HookSpec::capture`].  Hooked passes are
    /// inference-only: no gradient graph is retained.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Model`](crate::ConceptError::Model) on tensor
    /// operation failures and
    /// [`ConceptError::Hook`](crate::ConceptError::Hook) if a hook point is
    /// invalid for this model.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    // --- Gradient probe --------------------------------------------------

    /// Gradient of a scalar objective with respect to the activation at
    /// `site`.
    ///
    /// No forward perturbation is involved: the backend runs one ordinary
    /// forward pass with gradient tracking on the site activation, one
    /// backward pass, and returns the raw gradient tensor aligned with the
    /// activation's shape.  Projection onto a concept direction is the
    /// orchestrator's job.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Hook`](crate::ConceptError::Hook) if the
    /// backend cannot differentiate with respect to `site`, or
    /// [`ConceptError::Model`](crate::ConceptError::Model) on tensor
    /// failures.
    fn site_gradient(
        &self,
        input_ids: &Tensor,
        site: &HookPoint,
        target: &GradientTarget,
    ) -> Result<Tensor>;

    /// Clear any accumulated gradient state on the probed activation.
    ///
    /// Called by the faithfulness evaluator after every gradient probe so
    /// repeated minibatches cannot leak accumulation.  Backends whose
    /// autodiff produces a fresh gradient store per backward pass (candle's
    /// default) can keep the no-op default.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Model`](crate::ConceptError::Model) if the
    /// reset itself fails.
    fn clear_gradients(&self) -> Result<()> {
        Ok(())
    }
}
