// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluation settings parsed from a flat JSON mapping.
//!
//! [`EvalConfig`] carries the two batching knobs shared by every evaluator:
//! the faithfulness minibatch size and the reliability/consistency minibatch
//! size.  Both must evenly divide the corpora they are applied to; the
//! divisibility itself is checked at evaluation time, the positivity here.
//!
//! # Usage
//!
//! ```
//! use candle_concept::EvalConfig;
//!
//! let cfg = EvalConfig::from_json_str(
//!     r#"{"concept_eval_batchsize": 8, "metric_eval_batchsize": 4}"#,
//! ).unwrap();
//! assert_eq!(cfg.concept_eval_batchsize, 8);
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConceptError, Result};

/// Batching configuration consumed by the evaluators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EvalConfig {
    /// Minibatch size for the faithfulness evaluator's corpus traversal.
    pub concept_eval_batchsize: usize,
    /// Minibatch size for the consistency evaluator's per-half traversal.
    pub metric_eval_batchsize: usize,
}

impl EvalConfig {
    /// Parse from a JSON object string.
    ///
    /// Unknown keys are ignored so a larger experiment config can be passed
    /// through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Config`] if the JSON is malformed, a key is
    /// missing, or [`validate`](Self::validate) fails.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)
            .map_err(|e| ConceptError::Config(format!("parse eval config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse from a JSON file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Io`] if the file cannot be read, otherwise
    /// as [`from_json_str`](Self::from_json_str).
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check that both minibatch sizes are positive.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Config`] on a zero batch size.
    pub fn validate(&self) -> Result<()> {
        if self.concept_eval_batchsize == 0 {
            return Err(ConceptError::Config(
                "concept_eval_batchsize must be a positive integer".into(),
            ));
        }
        if self.metric_eval_batchsize == 0 {
            return Err(ConceptError::Config(
                "metric_eval_batchsize must be a positive integer".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_config() {
        let cfg = EvalConfig::from_json_str(
            r#"{"concept_eval_batchsize": 16, "metric_eval_batchsize": 2}"#,
        )
        .unwrap();
        assert_eq!(cfg.concept_eval_batchsize, 16);
        assert_eq!(cfg.metric_eval_batchsize, 2);
    }

    #[test]
    fn ignores_unknown_keys() {
        let cfg = EvalConfig::from_json_str(
            r#"{"concept_eval_batchsize": 4, "metric_eval_batchsize": 4,
                "seq_len": 128, "site": "blocks.3.hook_resid_post"}"#,
        )
        .unwrap();
        assert_eq!(cfg.concept_eval_batchsize, 4);
    }

    #[test]
    fn rejects_zero_batchsize() {
        let err = EvalConfig::from_json_str(
            r#"{"concept_eval_batchsize": 0, "metric_eval_batchsize": 4}"#,
        );
        assert!(matches!(err, Err(ConceptError::Config(_))));
    }

    #[test]
    fn rejects_missing_key() {
        let err = EvalConfig::from_json_str(r#"{"concept_eval_batchsize": 4}"#);
        assert!(matches!(err, Err(ConceptError::Config(_))));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join("candle_concept_eval_config.json");
        fs::write(
            &path,
            r#"{"concept_eval_batchsize": 2, "metric_eval_batchsize": 1}"#,
        )
        .unwrap();
        let cfg = EvalConfig::from_json_file(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(cfg.concept_eval_batchsize, 2);
        assert_eq!(cfg.metric_eval_batchsize, 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EvalConfig::from_json_file("/nonexistent/eval_config.json");
        assert!(matches!(err, Err(ConceptError::Io(_))));
    }
}
