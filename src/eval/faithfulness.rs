// SPDX-License-Identifier: MIT OR Apache-2.0

//! Faithfulness evaluation: does perturbing a concept's activation change
//! the model's output in proportion to how active the concept was?
//!
//! [`FaithfulnessEvaluator`] traverses an evaluation corpus in minibatches.
//! For each minibatch it obtains per-token concept activations from the
//! injected probe, measures a per-position effect size (intervention
//! difference or projected gradient), concatenates everything on the host,
//! and reduces to the six activation-weighted summary statistics of
//! [`SummaryStats`].

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Tensor};

use crate::backend::{ConceptBackend, GradientTarget};
use crate::concept::Concept;
use crate::config::EvalConfig;
use crate::error::{ConceptError, Result};
use crate::eval::ScalarMetric;
use crate::hooks::{HookPoint, Intervention};
use crate::measure::{self, CorrelationKind, MeasureTarget};
use crate::probe::ActivationProbe;
use crate::stats;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How to perturb (or probe) the activation at the site.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perturbation {
    /// Remove the concept component during the forward pass.
    Ablation,
    /// Project the gradient of the objective onto the concept direction
    /// (no forward perturbation).
    Gradient,
    /// Substitute the concept component with a fixed replacement value.
    Replace,
}

impl fmt::Display for Perturbation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ablation => write!(f, "ablation"),
            Self::Gradient => write!(f, "gradient"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

/// Which of the six summary statistics to report as the single scalar for
/// consistency evaluation.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryKind {
    /// Mean metric where activation > 0.
    MeanWhereActive,
    /// Mean metric where activation > 0.8 × corpus max.
    MeanAbove08Max,
    /// Mean metric where activation > 0.9 × corpus max.
    MeanAbove09Max,
    /// Mean of metric × activation over all positions.
    #[default]
    WeightedMean,
    /// Sum of metric × L1-normalised activation.
    L1WeightedSum,
    /// Sum of metric × softmax(activation) over the positive subset.
    SoftmaxWeightedSum,
}

/// Fixed evaluator configuration, validated once at construction.
///
/// The measurement target, perturbation type, and correlation function are
/// closed enums dispatched at construction time -- there is no per-minibatch
/// re-validation and no runtime fallback for an illegal combination.
#[derive(Debug, Clone)]
#[must_use]
pub struct FaithfulnessConfig {
    /// Forward-pass site to perturb / differentiate at.
    pub site: HookPoint,
    /// Minibatch size for corpus traversal (`concept_eval_batchsize`).
    pub minibatch: usize,
    /// What to measure about the output.
    pub measure: MeasureTarget,
    /// How to perturb the activation.
    pub perturbation: Perturbation,
    /// Distribution comparison for [`MeasureTarget::Logits`].
    pub correlation: CorrelationKind,
    /// Target class for [`MeasureTarget::ClassLogit`].
    pub class_idx: u32,
    /// Optional top-k restriction for the logits comparison.
    pub logits_corr_topk: Option<usize>,
    /// Replacement value along the direction for [`Perturbation::Replace`].
    pub replacement_value: f32,
    /// Which summary statistic [`ScalarMetric`] reports.
    pub scalar_stat: SummaryKind,
}

impl FaithfulnessConfig {
    /// Defaults: loss × ablation, cosine correlation, class 0, no top-k.
    pub fn new(site: HookPoint, minibatch: usize) -> Self {
        Self {
            site,
            minibatch,
            measure: MeasureTarget::Loss,
            perturbation: Perturbation::Ablation,
            correlation: CorrelationKind::Cosine,
            class_idx: 0,
            logits_corr_topk: None,
            replacement_value: 0.0,
            scalar_stat: SummaryKind::default(),
        }
    }

    /// Defaults as in [`new`](Self::new), with the minibatch size taken
    /// from the shared [`EvalConfig`] (`concept_eval_batchsize`).
    pub fn from_config(config: &EvalConfig, site: HookPoint) -> Self {
        Self::new(site, config.concept_eval_batchsize)
    }

    /// Set the measurement target.
    pub const fn measure(mut self, measure: MeasureTarget) -> Self {
        self.measure = measure;
        self
    }

    /// Set the perturbation type.
    pub const fn perturbation(mut self, perturbation: Perturbation) -> Self {
        self.perturbation = perturbation;
        self
    }

    /// Set the distribution correlation function.
    pub const fn correlation(mut self, correlation: CorrelationKind) -> Self {
        self.correlation = correlation;
        self
    }

    /// Set the target class index.
    pub const fn class_idx(mut self, class_idx: u32) -> Self {
        self.class_idx = class_idx;
        self
    }

    /// Restrict the logits comparison to the top-k baseline entries.
    pub const fn logits_corr_topk(mut self, topk: usize) -> Self {
        self.logits_corr_topk = Some(topk);
        self
    }

    /// Set the replacement value for [`Perturbation::Replace`].
    pub const fn replacement_value(mut self, value: f32) -> Self {
        self.replacement_value = value;
        self
    }

    /// Set the summary statistic reported by [`ScalarMetric`].
    pub const fn scalar_stat(mut self, kind: SummaryKind) -> Self {
        self.scalar_stat = kind;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Config`] on a zero minibatch size, a zero
    /// top-k (an empty distribution restriction measures nothing), or on
    /// the gradient × logits combination (a gradient probe has no
    /// perturbed forward pass to compare distributions against).
    pub fn validate(&self) -> Result<()> {
        if self.minibatch == 0 {
            return Err(ConceptError::Config(
                "concept_eval_batchsize must be a positive integer".into(),
            ));
        }
        if self.logits_corr_topk == Some(0) {
            return Err(ConceptError::Config(
                "logits_corr_topk must be a positive integer".into(),
            ));
        }
        if self.perturbation == Perturbation::Gradient && self.measure == MeasureTarget::Logits {
            return Err(ConceptError::Config(
                "when the perturbation type is `gradient`, the measurement target \
                 must be one of `loss`, `class_logit`"
                    .into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Length alignment
// ---------------------------------------------------------------------------

/// Number of metric positions per example for a given configuration.
///
/// Loss-based interventions and the gradient probe both lose the final
/// sequence position (no next-token target / no gradient-comparable target
/// past the last predicted token); class-logit and full-logits
/// measurements keep the full length.  The activation array is trimmed to
/// this length before any elementwise combination.
#[must_use]
pub const fn metric_positions(
    measure: MeasureTarget,
    perturbation: Perturbation,
    seq_len: usize,
) -> usize {
    match (perturbation, measure) {
        (Perturbation::Gradient, _)
        | (Perturbation::Ablation | Perturbation::Replace, MeasureTarget::Loss) => {
            seq_len.saturating_sub(1)
        }
        (Perturbation::Ablation | Perturbation::Replace, _) => seq_len,
    }
}

// ---------------------------------------------------------------------------
// Summary statistics
// ---------------------------------------------------------------------------

/// The six activation-weighted summary statistics of one evaluation run.
///
/// Derived once per run from the aligned corpus-wide metric and activation
/// arrays; reported via `tracing` and returned, never persisted.  With no
/// positive-activation position, the masked statistics are NaN.
#[derive(Debug, Clone, Copy)]
pub struct SummaryStats {
    /// Mean metric where activation > 0.
    pub mean_where_active: f32,
    /// Mean metric where activation > 0.8 × corpus max activation.
    pub mean_above_08_max: f32,
    /// Mean metric where activation > 0.9 × corpus max activation.
    pub mean_above_09_max: f32,
    /// Mean of metric × activation over all positions.
    pub weighted_mean: f32,
    /// Sum of metric × (activation / ‖activation‖₁).
    pub l1_weighted_sum: f32,
    /// Sum of metric × softmax(activation) over positions with
    /// activation > 0 (softmax over the positive subset only).
    pub softmax_weighted_sum: f32,
}

impl SummaryStats {
    /// Compute all six statistics from aligned metric/activation slices.
    ///
    /// Both slices must have equal length; a non-positive corpus maximum
    /// makes the 0.8×/0.9× thresholds degenerate to "> 0" or stricter,
    /// which is accepted behaviour.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn compute(metrics: &[f32], activations: &[f32]) -> Self {
        let max = activations
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);

        let active: Vec<bool> = activations.iter().map(|&a| a > 0.0).collect();
        let above_08: Vec<bool> = activations.iter().map(|&a| a > 0.8 * max).collect();
        let above_09: Vec<bool> = activations.iter().map(|&a| a > 0.9 * max).collect();

        let weighted_mean = if metrics.is_empty() {
            f32::NAN
        } else {
            let sum: f64 = metrics
                .iter()
                .zip(activations.iter())
                .map(|(&m, &a)| f64::from(m) * f64::from(a))
                .sum();
            #[allow(clippy::cast_possible_truncation)]
            let mean = (sum / metrics.len() as f64) as f32;
            mean
        };

        let normed = stats::l1_normalize(activations);
        let l1_weighted_sum: f32 = metrics
            .iter()
            .zip(normed.iter())
            .map(|(&m, &a)| m * a)
            .sum();

        let active_metrics: Vec<f32> = metrics
            .iter()
            .zip(active.iter())
            .filter(|(_, &m)| m)
            .map(|(&v, _)| v)
            .collect();
        let active_acts: Vec<f32> = activations
            .iter()
            .zip(active.iter())
            .filter(|(_, &m)| m)
            .map(|(&v, _)| v)
            .collect();
        let softmax_weighted_sum = if active_metrics.is_empty() {
            f32::NAN
        } else {
            let weights = stats::softmax(&active_acts);
            active_metrics
                .iter()
                .zip(weights.iter())
                .map(|(&m, &w)| m * w)
                .sum()
        };

        Self {
            mean_where_active: stats::masked_mean(metrics, &active),
            mean_above_08_max: stats::masked_mean(metrics, &above_08),
            mean_above_09_max: stats::masked_mean(metrics, &above_09),
            weighted_mean,
            l1_weighted_sum,
            softmax_weighted_sum,
        }
    }

    /// Select one statistic by kind.
    #[must_use]
    pub const fn scalar(&self, kind: SummaryKind) -> f32 {
        match kind {
            SummaryKind::MeanWhereActive => self.mean_where_active,
            SummaryKind::MeanAbove08Max => self.mean_above_08_max,
            SummaryKind::MeanAbove09Max => self.mean_above_09_max,
            SummaryKind::WeightedMean => self.weighted_mean,
            SummaryKind::L1WeightedSum => self.l1_weighted_sum,
            SummaryKind::SoftmaxWeightedSum => self.softmax_weighted_sum,
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Full result of one faithfulness evaluation run.
///
/// Carries the corpus-wide per-position metric array, the activation array
/// trimmed to the same alignment, and the summary statistics.  Both arrays
/// are row-major `[examples × positions_per_example]`.
#[derive(Debug, Clone)]
pub struct FaithfulnessReport {
    /// Per-position effect sizes for the whole corpus.
    pub metrics: Vec<f32>,
    /// Per-position concept activations, aligned with `metrics`.
    pub activations: Vec<f32>,
    /// The six activation-weighted summary statistics.
    pub summary: SummaryStats,
    /// Number of corpus examples evaluated.
    pub examples: usize,
    /// Metric positions per example after alignment trimming.
    pub positions_per_example: usize,
}

// ---------------------------------------------------------------------------
// FaithfulnessEvaluator
// ---------------------------------------------------------------------------

/// Orchestrates the perturb → measure → aggregate pipeline over a corpus.
///
/// Construction validates the configuration eagerly; an illegal combination
/// never reaches a forward pass.  Evaluation is single-threaded and
/// processes minibatches strictly in order; per-minibatch tensors are moved
/// to host memory as soon as their values are extracted.
pub struct FaithfulnessEvaluator {
    backend: Arc<dyn ConceptBackend>,
    concept: Concept,
    probe: ActivationProbe,
    config: FaithfulnessConfig,
}

impl FaithfulnessEvaluator {
    /// Create an evaluator, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Config`] on an invalid configuration (see
    /// [`FaithfulnessConfig::validate`]) or a class index outside the
    /// backend's vocabulary.
    pub fn new(
        backend: Arc<dyn ConceptBackend>,
        concept: Concept,
        probe: ActivationProbe,
        config: FaithfulnessConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.measure == MeasureTarget::ClassLogit {
            let vocab = backend.vocab_size();
            let idx = usize::try_from(config.class_idx).unwrap_or(usize::MAX);
            if idx >= vocab {
                return Err(ConceptError::Config(format!(
                    "class index {} out of range (vocab size is {vocab})",
                    config.class_idx
                )));
            }
        }
        Ok(Self {
            backend,
            concept,
            probe,
            config,
        })
    }

    /// The evaluator's configuration.
    #[must_use]
    pub const fn config(&self) -> &FaithfulnessConfig {
        &self.config
    }

    /// The concept under evaluation.
    #[must_use]
    pub const fn concept(&self) -> &Concept {
        &self.concept
    }

    /// Evaluate the concept over a token corpus.
    ///
    /// # Shapes
    /// - `tokens`: `[corpus, seq]` -- token IDs; `corpus` must be divisible
    ///   by the configured minibatch size
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Shape`] on indivisible corpus size or a
    /// probe/metric shape mismatch; propagates backend errors.
    pub fn evaluate(&self, tokens: &Tensor) -> Result<FaithfulnessReport> {
        let (corpus, seq) = tokens.dims2()?;
        let mb = self.config.minibatch;
        if corpus % mb != 0 {
            return Err(ConceptError::Shape(format!(
                "corpus size {corpus} is not divisible by concept_eval_batchsize {mb}"
            )));
        }

        let positions = metric_positions(self.config.measure, self.config.perturbation, seq);
        let mut metrics: Vec<f32> = Vec::with_capacity(corpus * positions);
        let mut activations: Vec<f32> = Vec::with_capacity(corpus * positions);

        for (iter, start) in (0..corpus).step_by(mb).enumerate() {
            let chunk = tokens.narrow(0, start, mb)?;
            tracing::debug!(iter, start, "evaluating minibatch");

            let act = (self.probe)(&chunk, self.backend.as_ref(), &self.concept)?;
            let act = act.reshape((mb, seq)).map_err(|_| {
                ConceptError::Shape(format!(
                    "probe output for minibatch {iter} cannot be reshaped to [{mb}, {seq}]"
                ))
            })?;

            let metric = self.minibatch_metric(&chunk, seq)?;
            let dims = metric.dims2()?;
            if dims != (mb, positions) {
                return Err(ConceptError::Shape(format!(
                    "metric shape {dims:?} does not match expected [{mb}, {positions}]"
                )));
            }

            // Move both arrays to host; the device tensors are dropped here.
            let metric_host: Vec<f32> = metric
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1()?;
            let act_host: Vec<f32> = act
                .narrow(1, 0, positions)?
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1()?;
            metrics.extend(metric_host);
            activations.extend(act_host);
        }

        let summary = SummaryStats::compute(&metrics, &activations);
        self.log_summary(&summary);

        Ok(FaithfulnessReport {
            metrics,
            activations,
            summary,
            examples: corpus,
            positions_per_example: positions,
        })
    }

    /// Per-position effect sizes for one minibatch.
    fn minibatch_metric(&self, chunk: &Tensor, seq: usize) -> Result<Tensor> {
        match self.config.perturbation {
            Perturbation::Gradient => {
                let target = match self.config.measure {
                    MeasureTarget::Loss => GradientTarget::MeanLoss,
                    MeasureTarget::ClassLogit => GradientTarget::ClassLogit(self.config.class_idx),
                    // Rejected in FaithfulnessConfig::validate.
                    MeasureTarget::Logits => {
                        return Err(ConceptError::Config(
                            "gradient perturbation cannot measure full logits".into(),
                        ))
                    }
                };
                let grads = self
                    .backend
                    .site_gradient(chunk, &self.config.site, &target)?;
                let projected = self.concept.projection(&grads)?;
                // Reset accumulated state; no weight update ever happens.
                self.backend.clear_gradients()?;
                // The final position has no gradient-comparable target.
                Ok(projected.narrow(1, 0, seq.saturating_sub(1))?)
            }
            Perturbation::Ablation | Perturbation::Replace => {
                let intervention = match self.config.perturbation {
                    Perturbation::Ablation => Intervention::Ablate(self.concept.clone()),
                    _ => Intervention::Replace(
                        self.concept.clone(),
                        self.config.replacement_value,
                    ),
                };
                match self.config.measure {
                    MeasureTarget::Loss => measure::loss_diff(
                        self.backend.as_ref(),
                        chunk,
                        &self.config.site,
                        &intervention,
                    ),
                    MeasureTarget::ClassLogit => measure::class_logit_diff(
                        self.backend.as_ref(),
                        chunk,
                        &self.config.site,
                        &intervention,
                        self.config.class_idx,
                    ),
                    MeasureTarget::Logits => measure::logit_distribution_corr(
                        self.backend.as_ref(),
                        chunk,
                        &self.config.site,
                        &intervention,
                        self.config.correlation,
                        self.config.logits_corr_topk,
                    ),
                }
            }
        }
    }

    /// Report the six statistics and the configuration they were computed
    /// under.
    fn log_summary(&self, summary: &SummaryStats) {
        let cfg = &self.config;
        tracing::info!(
            "faithfulness metrics ({} {} {} logits_corr_topk={:?})",
            cfg.perturbation,
            cfg.measure,
            cfg.correlation,
            cfg.logits_corr_topk
        );
        tracing::info!(
            "avg where concept activation > 0: {:.4e}",
            summary.mean_where_active
        );
        tracing::info!(
            "avg where concept activation > 0.8 max: {:.4e}",
            summary.mean_above_08_max
        );
        tracing::info!(
            "avg where concept activation > 0.9 max: {:.4e}",
            summary.mean_above_09_max
        );
        tracing::info!(
            "weighted avg by concept activation: {:.4e}",
            summary.weighted_mean
        );
        tracing::info!(
            "weighted sum by 1-normed concept activation: {:.4e}",
            summary.l1_weighted_sum
        );
        tracing::info!(
            "weighted sum by softmaxed concept activation: {:.4e}",
            summary.softmax_weighted_sum
        );
    }
}

impl ScalarMetric for FaithfulnessEvaluator {
    fn scalar_metric(&self, tokens: &Tensor) -> Result<f32> {
        let report = self.evaluate(tokens)?;
        Ok(report.summary.scalar(self.config.scalar_stat))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
