// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-concept.

/// Errors that can occur during concept evaluation.
///
/// Numeric degeneracy (an empty activation mask, a non-positive corpus
/// maximum) is deliberately **not** an error: sparse concepts legitimately
/// never fire on some corpora, and the affected statistics come back as NaN.
#[derive(Debug, thiserror::Error)]
pub enum ConceptError {
    /// Model forward/backward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Invalid evaluator configuration (illegal enum value or combination).
    ///
    /// Always surfaced at construction time, before any forward pass.
    #[error("config error: {0}")]
    Config(String),

    /// Batch/sequence bookkeeping error (corpus not divisible by the
    /// minibatch size, metric/activation arrays that cannot be aligned).
    #[error("shape error: {0}")]
    Shape(String),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Activation probe error.
    #[error("probe error: {0}")]
    Probe(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-concept operations.
pub type Result<T> = std::result::Result<T, ConceptError>;
