// SPDX-License-Identifier: MIT OR Apache-2.0

//! Measurement strategies: quantify the effect of a concept intervention.
//!
//! Each strategy runs the backend twice on the same minibatch -- once
//! unperturbed, once with the intervention installed at the site -- and
//! returns a per-position effect tensor:
//!
//! - [`loss_diff`]: next-token NLL difference, `[batch, seq-1]`
//! - [`class_logit_diff`]: fixed-class logit difference, `[batch, seq]`
//! - [`logit_distribution_corr`]: full-distribution correlation,
//!   `[batch, seq]`
//!
//! Distribution comparisons are computed on host `f32` slices (see
//! [`crate::stats`]); the optional top-k restriction keeps only the k
//! entries with the highest unperturbed probability.

use std::fmt;

use candle_core::{DType, Tensor, D};

use crate::backend::ConceptBackend;
use crate::error::{ConceptError, Result};
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::stats;

// ---------------------------------------------------------------------------
// Strategy enums
// ---------------------------------------------------------------------------

/// What to measure about the model's output.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureTarget {
    /// Per-position next-token negative log-likelihood.
    Loss,
    /// Logit of a fixed target class at every position.
    ClassLogit,
    /// Full output-logit distribution at every position.
    Logits,
}

impl fmt::Display for MeasureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loss => write!(f, "loss"),
            Self::ClassLogit => write!(f, "class_logit"),
            Self::Logits => write!(f, "logits"),
        }
    }
}

/// How to compare two output distributions at one position.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationKind {
    /// Cosine similarity of the probability vectors.
    Cosine,
    /// `KL(unperturbed || perturbed)`.
    KlDivergence,
    /// Fraction-of-variance-explained deficit
    /// (see [`stats::explained_variance`]).
    OpenAiVariant,
}

impl fmt::Display for CorrelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::KlDivergence => write!(f, "KL_div"),
            Self::OpenAiVariant => write!(f, "openai_var"),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared forward-pass helper
// ---------------------------------------------------------------------------

/// Run the unperturbed and perturbed forward passes for one minibatch.
///
/// Returns `(baseline_logits, perturbed_logits)`, both detached.
///
/// # Errors
///
/// Propagates backend errors.
fn paired_forward(
    backend: &dyn ConceptBackend,
    tokens: &Tensor,
    site: &HookPoint,
    intervention: &Intervention,
) -> Result<(Tensor, Tensor)> {
    let baseline = backend.forward(tokens, &HookSpec::new())?.into_output();

    let mut hooks = HookSpec::new();
    hooks.intervene(site.clone(), intervention.clone());
    let perturbed = backend.forward(tokens, &hooks)?.into_output();

    Ok((baseline.detach(), perturbed.detach()))
}

/// Per-position next-token negative log-likelihood.
///
/// The last position has no next-token target, so the result has one
/// fewer position than the input.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - `tokens`: `[batch, seq]` -- token IDs (u32)
/// - returns: `[batch, seq-1]`
///
/// # Errors
///
/// Returns [`ConceptError::Model`] on tensor-op failure.
pub fn next_token_nll(logits: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (_batch, seq, _vocab) = logits.dims3()?;
    let predict = logits.narrow(1, 0, seq - 1)?.to_dtype(DType::F32)?;
    let logp = candle_nn::ops::log_softmax(&predict, D::Minus1)?;
    let targets = tokens.narrow(1, 1, seq - 1)?.contiguous()?;
    let picked = logp.gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?;
    Ok(picked.squeeze(D::Minus1)?.neg()?)
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Perturbed-minus-unperturbed next-token loss at every position.
///
/// # Shapes
/// - `tokens`: `[batch, seq]`
/// - returns: `[batch, seq-1]`
///
/// # Errors
///
/// Propagates backend and tensor-op errors.
pub fn loss_diff(
    backend: &dyn ConceptBackend,
    tokens: &Tensor,
    site: &HookPoint,
    intervention: &Intervention,
) -> Result<Tensor> {
    let (baseline, perturbed) = paired_forward(backend, tokens, site, intervention)?;
    let nll_base = next_token_nll(&baseline, tokens)?;
    let nll_pert = next_token_nll(&perturbed, tokens)?;
    Ok(nll_pert.sub(&nll_base)?)
}

/// Perturbed-minus-unperturbed logit of a fixed class at every position.
///
/// # Shapes
/// - `tokens`: `[batch, seq]`
/// - returns: `[batch, seq]`
///
/// # Errors
///
/// Returns [`ConceptError::Shape`] if `class_idx` is outside the
/// vocabulary; propagates backend errors.
pub fn class_logit_diff(
    backend: &dyn ConceptBackend,
    tokens: &Tensor,
    site: &HookPoint,
    intervention: &Intervention,
    class_idx: u32,
) -> Result<Tensor> {
    let (baseline, perturbed) = paired_forward(backend, tokens, site, intervention)?;
    let (_batch, _seq, vocab) = baseline.dims3()?;
    let idx = usize::try_from(class_idx)
        .map_err(|_| ConceptError::Shape(format!("class index {class_idx} out of range")))?;
    if idx >= vocab {
        return Err(ConceptError::Shape(format!(
            "class index {class_idx} out of range (vocab size is {vocab})"
        )));
    }

    let base_class = baseline.narrow(2, idx, 1)?.squeeze(2)?.to_dtype(DType::F32)?;
    let pert_class = perturbed.narrow(2, idx, 1)?.squeeze(2)?.to_dtype(DType::F32)?;
    Ok(pert_class.sub(&base_class)?)
}

/// Correlation between perturbed and unperturbed output distributions at
/// every position.
///
/// When `topk` is set, both distributions are restricted to the `k`
/// entries with the highest unperturbed probability before comparison
/// (no renormalisation).
///
/// # Shapes
/// - `tokens`: `[batch, seq]`
/// - returns: `[batch, seq]`
///
/// # Errors
///
/// Propagates backend and tensor-op errors.
pub fn logit_distribution_corr(
    backend: &dyn ConceptBackend,
    tokens: &Tensor,
    site: &HookPoint,
    intervention: &Intervention,
    corr: CorrelationKind,
    topk: Option<usize>,
) -> Result<Tensor> {
    let (baseline, perturbed) = paired_forward(backend, tokens, site, intervention)?;
    let (batch, seq, _vocab) = baseline.dims3()?;

    let base_probs = candle_nn::ops::softmax_last_dim(&baseline.to_dtype(DType::F32)?)?;
    let pert_probs = candle_nn::ops::softmax_last_dim(&perturbed.to_dtype(DType::F32)?)?;

    let base_host: Vec<Vec<Vec<f32>>> = base_probs.to_vec3()?;
    let pert_host: Vec<Vec<Vec<f32>>> = pert_probs.to_vec3()?;

    let mut out = Vec::with_capacity(batch * seq);
    for (base_example, pert_example) in base_host.iter().zip(pert_host.iter()) {
        for (p, q) in base_example.iter().zip(pert_example.iter()) {
            out.push(position_corr(p, q, corr, topk));
        }
    }

    Ok(Tensor::from_vec(out, (batch, seq), tokens.device())?)
}

/// Compare one position's distributions, with optional top-k restriction.
fn position_corr(p: &[f32], q: &[f32], corr: CorrelationKind, topk: Option<usize>) -> f32 {
    let (p_sel, q_sel): (Vec<f32>, Vec<f32>) = match topk {
        Some(k) => {
            let keep = stats::top_k_indices(p, k);
            // Indices come from top_k_indices over p, always in range.
            #[allow(clippy::indexing_slicing)]
            let p_sel = keep.iter().map(|&i| p[i]).collect();
            #[allow(clippy::indexing_slicing)]
            let q_sel = keep.iter().map(|&i| q[i]).collect();
            (p_sel, q_sel)
        }
        None => (p.to_vec(), q.to_vec()),
    };

    match corr {
        CorrelationKind::Cosine => stats::cosine_similarity(&p_sel, &q_sel),
        CorrelationKind::KlDivergence => stats::kl_divergence(&p_sel, &q_sel),
        CorrelationKind::OpenAiVariant => stats::explained_variance(&p_sel, &q_sel),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
