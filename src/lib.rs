// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-concept
//!
//! Concept faithfulness and metric reliability evaluation for language
//! models in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A concept is a direction in a model's activation space.  This crate
//! answers two questions about one:
//!
//! - **Faithfulness** — when the concept's component is perturbed at a
//!   hook site (ablated, replaced, or probed via gradients), does the
//!   model's output change in proportion to how strongly the concept was
//!   active?  See [`FaithfulnessEvaluator`].
//! - **Consistency** — does a scalar evaluation metric reproduce itself
//!   across two halves of the same corpus?  See [`ConsistencyEvaluator`].
//!
//! Models plug in through the [`ConceptBackend`] trait: a hook-aware
//! forward pass plus a site-gradient probe.  Model loading, devices, and
//! tokenisation stay with the implementor.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backend;
pub mod concept;
pub mod config;
pub mod error;
pub mod eval;
pub mod hooks;
pub mod measure;
pub mod probe;
pub mod stats;

pub use backend::{ConceptBackend, GradientTarget};
pub use concept::Concept;
pub use config::EvalConfig;
pub use error::{ConceptError, Result};
pub use eval::consistency::ConsistencyEvaluator;
pub use eval::faithfulness::{
    FaithfulnessConfig, FaithfulnessEvaluator, FaithfulnessReport, Perturbation, SummaryKind,
    SummaryStats,
};
pub use eval::ScalarMetric;
pub use hooks::{apply_intervention, HookCache, HookPoint, HookSpec, Intervention};
pub use measure::{CorrelationKind, MeasureTarget};
pub use probe::{projection_probe, ActivationProbe};
