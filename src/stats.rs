// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-side numeric helpers for the aggregation statistics.
//!
//! All evaluation arithmetic happens on extracted `f32` slices: per-token
//! metrics and activations are moved off the compute device once per
//! minibatch and combined here.  Degenerate inputs (empty masks, zero
//! norms, zero variance) produce NaN, never a panic.

/// Mean of `values[i]` where `mask[i]` is true; NaN if the mask is empty.
#[must_use]
pub fn masked_mean(values: &[f32], mask: &[bool]) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for (&v, &m) in values.iter().zip(mask.iter()) {
        if m {
            sum += f64::from(v);
            count += 1;
        }
    }
    if count == 0 {
        f32::NAN
    } else {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let mean = sum / count as f64;
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let mean_f32 = mean as f32;
        mean_f32
    }
}

/// Divide by the L1 norm.  A zero norm yields all-NaN (matching the
/// division-by-zero semantics of the aggregation it feeds).
#[must_use]
pub fn l1_normalize(values: &[f32]) -> Vec<f32> {
    let norm: f32 = values.iter().map(|v| v.abs()).sum();
    values.iter().map(|v| v / norm).collect()
}

/// Numerically stable softmax over a slice.
///
/// Empty input returns an empty vector.
#[must_use]
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|e| e / sum).collect()
}

/// Pearson correlation coefficient between two equal-length sequences.
///
/// NaN when either sequence has zero variance or the sequences are empty.
/// Callers are expected to have checked length equality; unequal lengths
/// are a configuration error upstream.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn pearson(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return f32::NAN;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| f64::from(v)).sum::<f64>() / n;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = f64::from(x) - mean_a;
        let dy = f64::from(y) - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    #[allow(clippy::cast_possible_truncation)]
    let r = (cov / denom) as f32;
    r
}

/// Cosine similarity between two equal-length vectors.
///
/// NaN when either vector has zero norm.
#[must_use]
pub fn cosine_similarity(p: &[f32], q: &[f32]) -> f32 {
    let dot: f32 = p.iter().zip(q.iter()).map(|(&a, &b)| a * b).sum();
    let norm_p: f32 = p.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_q: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
    dot / (norm_p * norm_q)
}

/// KL divergence `KL(P || Q)` between two probability vectors.
///
/// Entries where either probability is below `1e-10` are skipped.
#[must_use]
pub fn kl_divergence(p: &[f32], q: &[f32]) -> f32 {
    p.iter()
        .zip(q.iter())
        .filter(|&(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum()
}

/// Fraction-of-variance-explained deficit: `1 - Var(p - q) / Var(p)`.
///
/// The "openai variant" distribution comparison: 1.0 when the perturbed
/// distribution matches the baseline exactly, smaller as the residual
/// variance grows.  NaN when the baseline has zero variance.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn explained_variance(p: &[f32], q: &[f32]) -> f32 {
    if p.is_empty() || p.len() != q.len() {
        return f32::NAN;
    }
    let n = p.len() as f64;
    let resid: Vec<f64> = p
        .iter()
        .zip(q.iter())
        .map(|(&a, &b)| f64::from(a) - f64::from(b))
        .collect();
    let mean_p = p.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let mean_r = resid.iter().sum::<f64>() / n;

    let var_p = p
        .iter()
        .map(|&v| (f64::from(v) - mean_p).powi(2))
        .sum::<f64>()
        / n;
    let var_r = resid.iter().map(|&v| (v - mean_r).powi(2)).sum::<f64>() / n;

    #[allow(clippy::cast_possible_truncation)]
    let ev = (1.0 - var_r / var_p) as f32;
    ev
}

/// Indices of the `k` largest entries, in descending order of value.
///
/// Returns all indices when `k >= values.len()`.
#[must_use]
pub fn top_k_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut indexed: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.into_iter().take(k).map(|(i, _)| i).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn masked_mean_basic() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let mask = [true, false, true, false];
        assert!((masked_mean(&values, &mask) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn masked_mean_empty_mask_is_nan() {
        let values = [1.0, 2.0];
        let mask = [false, false];
        assert!(masked_mean(&values, &mask).is_nan());
    }

    #[test]
    fn l1_normalize_sums_to_one() {
        let normed = l1_normalize(&[1.0, -3.0, 4.0]);
        let l1: f32 = normed.iter().map(|v| v.abs()).sum();
        assert!((l1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l1_normalize_zero_norm_is_nan() {
        let normed = l1_normalize(&[0.0, 0.0]);
        assert!(normed.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn softmax_is_stable_for_large_inputs() {
        let probs = softmax(&[1000.0, 1001.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pearson_perfect_correlation() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pearson_perfect_anticorrelation() {
        let a = [1.0, 2.0, 3.0];
        let b = [3.0, 2.0, 1.0];
        assert!((pearson(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn pearson_zero_variance_is_nan() {
        let a = [1.0, 1.0, 1.0];
        let b = [1.0, 2.0, 3.0];
        assert!(pearson(&a, &b).is_nan());
    }

    #[test]
    fn cosine_identical_vectors() {
        let p = [0.2, 0.3, 0.5];
        assert!((cosine_similarity(&p, &p) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn kl_divergence_identical_is_zero() {
        let p = [0.25, 0.25, 0.5];
        assert!(kl_divergence(&p, &p).abs() < 1e-6);
    }

    #[test]
    fn kl_divergence_positive_for_different() {
        let p = [0.9, 0.1];
        let q = [0.5, 0.5];
        assert!(kl_divergence(&p, &q) > 0.0);
    }

    #[test]
    fn explained_variance_identical_is_one() {
        let p = [0.1, 0.5, 0.4];
        assert!((explained_variance(&p, &p) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn top_k_indices_descending() {
        let values = [0.1, 0.9, 0.3, 0.7];
        assert_eq!(top_k_indices(&values, 2), vec![1, 3]);
        assert_eq!(top_k_indices(&values, 10).len(), 4);
    }
}
