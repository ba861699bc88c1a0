// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and concept interventions.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what to capture and where to intervene), and
//! [`HookCache`] (captured tensors from a forward pass).
//!
//! The faithfulness evaluator installs exactly one [`Intervention`] at one
//! site per perturbed pass; probes use the capture side to read the same
//! site without modifying it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::{Tensor, D};

use crate::concept::Concept;
use crate::error::{ConceptError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or concept interventions applied.
///
/// Follows the `TransformerLens` hook point naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// # String conversion
///
/// ```
/// use candle_concept::HookPoint;
///
/// let site = HookPoint::ResidPost(5);
/// assert_eq!(site.to_string(), "blocks.5.hook_resid_post");
///
/// let parsed: HookPoint = "blocks.5.hook_resid_post".parse().unwrap();
/// assert_eq!(parsed, site);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`], providing an escape
/// hatch for backend-specific sites.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token embedding (`hook_embed`).
    Embed,
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Residual stream between attention and MLP in layer `i`
    /// (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP post-activation in layer `i` (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// After final layer norm (`hook_final_norm`).
    FinalNorm,
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

/// Allow `spec.capture("blocks.5.hook_resid_post")` via `Into<HookPoint>`.
impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`].
fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_final_norm" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some(rest) = s.strip_prefix("blocks.") {
        if let Some((layer_str, suffix)) = rest.split_once('.') {
            if let Ok(layer) = layer_str.parse::<usize>() {
                return match suffix {
                    "hook_resid_pre" => HookPoint::ResidPre(layer),
                    "hook_resid_mid" => HookPoint::ResidMid(layer),
                    "mlp.hook_post" => HookPoint::MlpPost(layer),
                    "hook_resid_post" => HookPoint::ResidPost(layer),
                    _ => HookPoint::Custom(s.to_string()),
                };
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// A concept intervention to apply at a hook point during the forward pass.
///
/// Both variants are pure: they return a new tensor and never mutate the
/// activation in place.  The unperturbed forward pass of the same minibatch
/// is compared against the perturbed one, so aliasing would corrupt the
/// baseline.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Remove the concept component entirely: `x - ĉ(ĉ·x)`.
    ///
    /// The orthogonal complement is untouched.  For a zero concept the
    /// unit direction is the zero vector and this is an exact no-op.
    Ablate(Concept),

    /// Remove the concept component, then write a fixed value back along
    /// the direction: `x - ĉ(ĉ·x) + v·ĉ`.
    ///
    /// `v` is caller-supplied or corpus-derived (e.g. the corpus mean
    /// projection), isolating this example's concept value against a
    /// neutral baseline.
    Replace(Concept, f32),
}

/// Apply a single [`Intervention`] to an activation tensor.
///
/// Used by backend implementations at each hook point that supports
/// interventions.
///
/// # Shapes
/// - `tensor`: `[..., d]` -- the activation at the hook point
/// - returns: same shape as `tensor`
///
/// # Errors
///
/// Returns [`ConceptError::Model`] if the concept dimensionality does not
/// match the activation's last dimension.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Ablate(concept) => remove_component(tensor, concept),
        Intervention::Replace(concept, value) => {
            let removed = remove_component(tensor, concept)?;
            let restored = (concept.unit() * f64::from(*value))?;
            Ok(removed.broadcast_add(&restored)?)
        }
    }
}

/// Subtract the projection of `x` onto the concept's unit direction.
fn remove_component(x: &Tensor, concept: &Concept) -> Result<Tensor> {
    let coef = x.broadcast_mul(concept.unit())?.sum(D::Minus1)?;
    let component = coef.unsqueeze(D::Minus1)?.broadcast_mul(concept.unit())?;
    Ok(x.broadcast_sub(&component)?)
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply.
///
/// Passed to [`ConceptBackend::forward`](crate::ConceptBackend::forward).
/// When empty, the forward pass should have zero overhead (no clones, no
/// extra allocations).
///
/// # Example
///
/// ```
/// use candle_concept::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPost(5))
///      .capture("hook_final_norm");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Interventions to apply, stored as (`hook_point`, intervention) pairs.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification (no captures, no interventions).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at<'a>(
        &'a self,
        hook: &'a HookPoint,
    ) -> impl Iterator<Item = &'a Intervention> + 'a {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Check whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// Returned by [`ConceptBackend::forward`](crate::ConceptBackend::forward).
/// Use [`get`](Self::get) or [`require`](Self::require) to retrieve
/// activations at specific hook points.
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| ConceptError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor (e.g., after computing final logits).
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn concept(values: Vec<f32>) -> Concept {
        let n = values.len();
        Concept::new(Tensor::from_vec(values, n, &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::FinalNorm, "hook_final_norm"),
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::ResidMid(11), "blocks.11.hook_resid_mid"),
            (HookPoint::MlpPost(1), "blocks.1.mlp.hook_post"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "some.unknown.hook".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("some.unknown.hook".to_string()));
    }

    #[test]
    fn ablation_removes_concept_component() {
        // Concept along the first axis; activation [3, 4] -> [0, 4].
        let c = concept(vec![2.0, 0.0]);
        let x = Tensor::from_vec(vec![3.0f32, 4.0], (1, 1, 2), &Device::Cpu).unwrap();

        let ablated = apply_intervention(&x, &Intervention::Ablate(c)).unwrap();
        let v: Vec<f32> = ablated.flatten_all().unwrap().to_vec1().unwrap();
        assert!((v[0]).abs() < 1e-6);
        assert!((v[1] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn zero_concept_ablation_is_noop() {
        let c = concept(vec![0.0, 0.0, 0.0]);
        let x = Tensor::from_vec(vec![1.0f32, -2.0, 3.0], (1, 1, 3), &Device::Cpu).unwrap();

        let ablated = apply_intervention(&x, &Intervention::Ablate(c)).unwrap();
        let before: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        let after: Vec<f32> = ablated.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn replacement_with_own_projection_is_noop() {
        let c = concept(vec![1.0, 0.0]);
        // Activation [5, 2]: projection onto the unit direction is 5.
        let x = Tensor::from_vec(vec![5.0f32, 2.0], (1, 1, 2), &Device::Cpu).unwrap();

        let replaced = apply_intervention(&x, &Intervention::Replace(c, 5.0)).unwrap();
        let v: Vec<f32> = replaced.flatten_all().unwrap().to_vec1().unwrap();
        assert!((v[0] - 5.0).abs() < 1e-6);
        assert!((v[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn replacement_writes_value_along_direction() {
        let c = concept(vec![0.0, 3.0]);
        let x = Tensor::from_vec(vec![1.0f32, 7.0], (1, 1, 2), &Device::Cpu).unwrap();

        let replaced = apply_intervention(&x, &Intervention::Replace(c, 2.0)).unwrap();
        let v: Vec<f32> = replaced.flatten_all().unwrap().to_vec1().unwrap();
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!((v[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn intervention_does_not_mutate_input() {
        let c = concept(vec![1.0, 1.0]);
        let x = Tensor::from_vec(vec![2.0f32, 4.0], (1, 1, 2), &Device::Cpu).unwrap();
        let before: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();

        let _ablated = apply_intervention(&x, &Intervention::Ablate(c)).unwrap();
        let after: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn hook_spec_capture_and_query() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());

        spec.capture(HookPoint::ResidPost(5));
        spec.capture("blocks.3.hook_resid_post");

        assert!(!spec.is_empty());
        assert_eq!(spec.num_captures(), 2);
        assert!(spec.is_captured(&HookPoint::ResidPost(5)));
        assert!(spec.is_captured(&HookPoint::ResidPost(3)));
        assert!(!spec.is_captured(&HookPoint::Embed));
    }

    #[test]
    fn hook_spec_intervention_query() {
        let mut spec = HookSpec::new();
        let c = concept(vec![1.0, 0.0]);
        spec.intervene(HookPoint::ResidPost(5), Intervention::Ablate(c.clone()));
        spec.intervene(HookPoint::ResidPost(5), Intervention::Replace(c, 0.5));

        assert_eq!(spec.num_interventions(), 2);
        assert!(spec.has_intervention_at(&HookPoint::ResidPost(5)));
        assert!(!spec.has_intervention_at(&HookPoint::Embed));

        let at_5: Vec<_> = spec.interventions_at(&HookPoint::ResidPost(5)).collect();
        assert_eq!(at_5.len(), 2);
    }

    #[test]
    fn hook_cache_store_and_require() {
        let logits = Tensor::zeros((1, 4, 10), DType::F32, &Device::Cpu).unwrap();
        let mut cache = HookCache::new(logits);

        let act = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        cache.store(HookPoint::ResidPost(0), act);

        assert_eq!(cache.num_captures(), 1);
        assert!(cache.require(&HookPoint::ResidPost(0)).is_ok());
        assert!(matches!(
            cache.require(&HookPoint::Embed),
            Err(ConceptError::Hook(_))
        ));
    }
}
