// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation probes: per-token concept activation strength.
//!
//! A probe answers "how strongly does the concept fire at each position?"
//! for a minibatch of token sequences.  Probes are injectable so callers
//! can plug in whatever their concept family defines (an SAE encoder, a
//! linear probe, a learned dictionary); [`projection_probe`] is the stock
//! choice: capture the site activation and project onto the concept.

use candle_core::Tensor;

use crate::backend::ConceptBackend;
use crate::concept::Concept;
use crate::error::Result;
use crate::hooks::{HookPoint, HookSpec};

/// Injectable per-token concept activation function.
///
/// Given a minibatch of tokens, a backend, and a concept, returns one
/// scalar per (example, position) pair -- shape `[batch, seq]` or any
/// shape reshapeable to it.  The result must be detached from gradient
/// tracking.
pub type ActivationProbe =
    Box<dyn Fn(&Tensor, &dyn ConceptBackend, &Concept) -> Result<Tensor> + Send + Sync>;

/// Build the stock projection probe for a given site.
///
/// Runs an unperturbed forward pass capturing the activation at `site`,
/// and returns its raw projection onto the concept direction (the
/// unnormalised dot product, one scalar per token).
///
/// # Example
///
/// ```no_run
/// use candle_concept::{projection_probe, HookPoint};
///
/// let probe = projection_probe(HookPoint::ResidPost(3));
/// ```
#[must_use]
pub fn projection_probe(site: HookPoint) -> ActivationProbe {
    Box::new(move |tokens, backend, concept| {
        let mut hooks = HookSpec::new();
        hooks.capture(site.clone());
        let cache = backend.forward(tokens, &hooks)?;
        let activation = cache.require(&site)?;
        Ok(concept.projection(activation)?.detach())
    })
}
