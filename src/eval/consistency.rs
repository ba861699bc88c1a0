// SPDX-License-Identifier: MIT OR Apache-2.0

//! Consistency evaluation: split-half reliability of scalar metrics.
//!
//! A metric that cannot reproduce itself on a second sample from the same
//! distribution is measuring noise.  [`ConsistencyEvaluator`] splits a
//! corpus into two contiguous halves, scores each half minibatch by
//! minibatch with every registered evaluator, and reports the Pearson
//! correlation between the two resulting score sequences per evaluator.

use candle_core::Tensor;

use crate::config::EvalConfig;
use crate::error::{ConceptError, Result};
use crate::eval::ScalarMetric;
use crate::stats;

/// Split-half reliability scorer for [`ScalarMetric`] evaluators.
///
/// Evaluators are passed to [`evaluate`](Self::evaluate) as an explicitly
/// ordered slice of `(name, evaluator)` pairs; results come back in the
/// same order.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyEvaluator {
    minibatch: usize,
}

impl ConsistencyEvaluator {
    /// Create from an [`EvalConfig`], using its `metric_eval_batchsize`.
    #[must_use]
    pub const fn new(config: &EvalConfig) -> Self {
        Self {
            minibatch: config.metric_eval_batchsize,
        }
    }

    /// Create directly from a minibatch size.
    #[must_use]
    pub const fn from_minibatch(minibatch: usize) -> Self {
        Self { minibatch }
    }

    /// Split-half reliability of each evaluator over `tokens`.
    ///
    /// The corpus is split into two contiguous halves; each half is scored
    /// in minibatches of `metric_eval_batchsize`, giving one score sequence
    /// per half per evaluator.  Per-evaluator Pearson correlation between
    /// the two sequences is the reliability.  With a single minibatch per
    /// half the correlation is NaN (zero variance).
    ///
    /// # Shapes
    /// - `tokens`: `[corpus, seq]` -- `corpus` must be divisible by
    ///   2 × `metric_eval_batchsize`
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Shape`] on an indivisible corpus size and
    /// [`ConceptError::Config`] on a zero minibatch size; propagates
    /// evaluator failures.
    pub fn evaluate(
        &self,
        tokens: &Tensor,
        evaluators: &[(&str, &dyn ScalarMetric)],
    ) -> Result<Vec<(String, f32)>> {
        if self.minibatch == 0 {
            return Err(ConceptError::Config(
                "metric_eval_batchsize must be a positive integer".into(),
            ));
        }
        let (corpus, _seq) = tokens.dims2()?;
        if corpus == 0 || corpus % (2 * self.minibatch) != 0 {
            return Err(ConceptError::Shape(format!(
                "corpus size {corpus} is not divisible by 2 x metric_eval_batchsize {}",
                self.minibatch
            )));
        }
        let half = corpus / 2;
        let batches_per_half = half / self.minibatch;

        // scores[half][evaluator] is the per-minibatch score sequence.
        let mut scores: [Vec<Vec<f32>>; 2] = [
            vec![Vec::with_capacity(batches_per_half); evaluators.len()],
            vec![Vec::with_capacity(batches_per_half); evaluators.len()],
        ];
        for (h, half_scores) in scores.iter_mut().enumerate() {
            let half_tokens = tokens.narrow(0, h * half, half)?;
            for b in 0..batches_per_half {
                let chunk = half_tokens.narrow(0, b * self.minibatch, self.minibatch)?;
                for ((_, evaluator), seq) in evaluators.iter().zip(half_scores.iter_mut()) {
                    seq.push(evaluator.scalar_metric(&chunk)?);
                }
            }
        }

        let mut results = Vec::with_capacity(evaluators.len());
        for (i, (name, _)) in evaluators.iter().enumerate() {
            let rho = stats::pearson(&scores[0][i], &scores[1][i]);
            tracing::info!("split-half reliability of {name}: {rho:.4}");
            results.push(((*name).to_owned(), rho));
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::*;

    /// Scores a minibatch by the mean of its token IDs.
    struct MeanTokenMetric;

    impl ScalarMetric for MeanTokenMetric {
        fn scalar_metric(&self, tokens: &Tensor) -> Result<f32> {
            let mean = tokens.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?;
            Ok(mean)
        }
    }

    fn corpus(rows: &[[u32; 2]]) -> Tensor {
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn identical_halves_are_perfectly_reliable() {
        // Two halves with the same per-minibatch mean progression.
        let tokens = corpus(&[[1, 1], [2, 2], [3, 3], [1, 1], [2, 2], [3, 3]]);
        let eval = ConsistencyEvaluator::from_minibatch(1);
        let metric = MeanTokenMetric;
        let results = eval
            .evaluate(&tokens, &[("mean_token", &metric)])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "mean_token");
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn anticorrelated_halves() {
        let tokens = corpus(&[[1, 1], [2, 2], [3, 3], [3, 3], [2, 2], [1, 1]]);
        let eval = ConsistencyEvaluator::from_minibatch(1);
        let metric = MeanTokenMetric;
        let results = eval.evaluate(&tokens, &[("mean_token", &metric)]).unwrap();
        assert!((results[0].1 + 1.0).abs() < 1e-6);
    }

    #[test]
    fn indivisible_corpus_is_rejected() {
        let tokens = corpus(&[[1, 1], [2, 2], [3, 3]]);
        let eval = ConsistencyEvaluator::from_minibatch(1);
        let metric = MeanTokenMetric;
        let err = eval.evaluate(&tokens, &[("mean_token", &metric)]);
        assert!(matches!(err, Err(ConceptError::Shape(_))));
    }

    #[test]
    fn single_minibatch_per_half_is_nan() {
        let tokens = corpus(&[[1, 1], [2, 2]]);
        let eval = ConsistencyEvaluator::from_minibatch(1);
        let metric = MeanTokenMetric;
        let results = eval.evaluate(&tokens, &[("mean_token", &metric)]).unwrap();
        assert!(results[0].1.is_nan());
    }

    #[test]
    fn result_order_matches_input_order() {
        let tokens = corpus(&[[1, 1], [2, 2], [1, 1], [2, 2]]);
        let eval = ConsistencyEvaluator::from_minibatch(1);
        let a = MeanTokenMetric;
        let b = MeanTokenMetric;
        let results = eval
            .evaluate(&tokens, &[("first", &a), ("second", &b)])
            .unwrap();
        assert_eq!(results[0].0, "first");
        assert_eq!(results[1].0, "second");
    }
}
