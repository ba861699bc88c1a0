// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concept directions in activation space.
//!
//! A [`Concept`] is an immutable vector in a model's internal activation
//! space, hypothesised to correspond to a human-interpretable feature.  It
//! is supplied by the caller (discovered elsewhere); this crate only reads
//! it: hooks remove or rewrite the activation component along it, the
//! gradient probe projects onto it, and probes measure how strongly it
//! fires at each token.

use candle_core::{DType, Tensor, D};

use crate::error::{ConceptError, Result};

/// An immutable concept direction, optionally selected from a stored family.
///
/// The raw direction is kept for projections (matching the convention that
/// activation strength is the unnormalised dot product), and a unit-norm
/// copy is precomputed for component removal in the intervention hooks.
///
/// A zero direction is legal: its unit copy is the zero vector, which makes
/// every hook built on it an exact no-op.
#[derive(Debug, Clone)]
pub struct Concept {
    /// Raw direction, shape `[d]`.
    direction: Tensor,
    /// Unit-norm direction, shape `[d]` (all zeros if the raw norm is 0).
    unit: Tensor,
    /// Row index within the concept family this was selected from, if any.
    index: Option<usize>,
}

impl Concept {
    /// Wrap a single direction vector.
    ///
    /// # Shapes
    /// - `direction`: `[d]`
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Shape`] if `direction` is not 1-D, or
    /// [`ConceptError::Model`] on tensor-op failure.
    pub fn new(direction: Tensor) -> Result<Self> {
        Self::with_index(direction, None)
    }

    /// Select one row of a concept family matrix.
    ///
    /// # Shapes
    /// - `family`: `[k, d]` -- one concept direction per row
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Shape`] if `family` is not 2-D or `index`
    /// is out of range.
    pub fn from_family(family: &Tensor, index: usize) -> Result<Self> {
        let (rows, _cols) = family.dims2().map_err(|_| {
            ConceptError::Shape(format!(
                "concept family must be 2-D [k, d], got {:?}",
                family.dims()
            ))
        })?;
        if index >= rows {
            return Err(ConceptError::Shape(format!(
                "concept index {index} out of range (family has {rows} rows)"
            )));
        }
        let row = family.narrow(0, index, 1)?.squeeze(0)?;
        Self::with_index(row, Some(index))
    }

    fn with_index(direction: Tensor, index: Option<usize>) -> Result<Self> {
        if direction.dims().len() != 1 {
            return Err(ConceptError::Shape(format!(
                "concept direction must be 1-D [d], got {:?}",
                direction.dims()
            )));
        }
        let direction = direction.to_dtype(DType::F32)?;
        let norm = direction.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        let unit = if norm > 0.0 {
            (&direction / f64::from(norm))?
        } else {
            direction.zeros_like()?
        };
        Ok(Self {
            direction,
            unit,
            index,
        })
    }

    /// Dimensionality of the activation space.
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Model`] on tensor-op failure.
    pub fn hidden_size(&self) -> Result<usize> {
        Ok(self.direction.dim(0)?)
    }

    /// The raw (unnormalised) direction, shape `[d]`.
    #[must_use]
    pub const fn direction(&self) -> &Tensor {
        &self.direction
    }

    /// The unit-norm direction, shape `[d]` (zeros for a zero concept).
    #[must_use]
    pub const fn unit(&self) -> &Tensor {
        &self.unit
    }

    /// Family row index this concept was selected from, if any.
    #[must_use]
    pub const fn index(&self) -> Option<usize> {
        self.index
    }

    /// Project a tensor onto the raw direction (dot product over the last
    /// dimension).
    ///
    /// Used both for gradient projection (`grad · concept`) and for the
    /// stock activation probe.
    ///
    /// # Shapes
    /// - `x`: `[..., d]`
    /// - returns: `[...]` (last dimension reduced)
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Model`] on shape mismatch.
    pub fn projection(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?;
        Ok(x.broadcast_mul(&self.direction)?.sum(D::Minus1)?)
    }

    /// Project a tensor onto the unit direction (the component magnitude
    /// removed by the ablation hook).
    ///
    /// # Shapes
    /// - `x`: `[..., d]`
    /// - returns: `[...]`
    ///
    /// # Errors
    ///
    /// Returns [`ConceptError::Model`] on shape mismatch.
    pub fn unit_projection(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?;
        Ok(x.broadcast_mul(&self.unit)?.sum(D::Minus1)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn unit_direction_is_normalised() {
        let dir = Tensor::from_vec(vec![3.0f32, 4.0], 2, &Device::Cpu).unwrap();
        let concept = Concept::new(dir).unwrap();
        let unit: Vec<f32> = concept.unit().to_vec1().unwrap();
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert!((unit[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_direction_has_zero_unit() {
        let dir = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let concept = Concept::new(dir).unwrap();
        let unit: Vec<f32> = concept.unit().to_vec1().unwrap();
        assert!(unit.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn from_family_selects_row() {
        let family = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 2.0], (2, 2), &Device::Cpu).unwrap();
        let concept = Concept::from_family(&family, 1).unwrap();
        let dir: Vec<f32> = concept.direction().to_vec1().unwrap();
        assert_eq!(dir, vec![0.0, 2.0]);
        assert_eq!(concept.index(), Some(1));
    }

    #[test]
    fn from_family_rejects_bad_index() {
        let family = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            Concept::from_family(&family, 2),
            Err(ConceptError::Shape(_))
        ));
    }

    #[test]
    fn rejects_non_vector_direction() {
        let matrix = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            Concept::new(matrix),
            Err(ConceptError::Shape(_))
        ));
    }

    #[test]
    fn projection_is_raw_dot_product() {
        let dir = Tensor::from_vec(vec![2.0f32, 0.0], 2, &Device::Cpu).unwrap();
        let concept = Concept::new(dir).unwrap();

        let x = Tensor::from_vec(vec![1.0f32, 5.0, 3.0, 7.0], (2, 2), &Device::Cpu).unwrap();
        let proj: Vec<f32> = concept.projection(&x).unwrap().to_vec1().unwrap();
        assert_eq!(proj, vec![2.0, 6.0]);

        // Unit projection differs by the norm factor.
        let unit_proj: Vec<f32> = concept.unit_projection(&x).unwrap().to_vec1().unwrap();
        assert_eq!(unit_proj, vec![1.0, 3.0]);
    }
}
