//! Variant parameter-space expansion for hybrid search optimization.
//!
//! Enumerates the cross-product of normalization techniques, combination
//! techniques and weight steps. The weight stepping deliberately rounds each
//! step to one decimal instead of accumulating `min + i * increment` raw:
//! naive accumulation produces values like `0.30000000000000004` that break
//! downstream equality and bucketing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Weight pair used when the sweep does not vary weights.
pub const DEFAULT_WEIGHTS: (f64, f64) = (0.5, 0.5);

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid weights range: {0}")]
    InvalidRange(String),
}

/// Inclusive weight range stepped by a fixed increment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightsRange {
    pub min: f64,
    pub max: f64,
    pub increment: f64,
}

impl WeightsRange {
    pub fn new(min: f64, max: f64, increment: f64) -> Self {
        Self {
            min,
            max,
            increment,
        }
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        if !self.min.is_finite() || !self.max.is_finite() || !self.increment.is_finite() {
            return Err(SweepError::InvalidRange(format!(
                "bounds must be finite (min={}, max={}, increment={})",
                self.min, self.max, self.increment
            )));
        }
        if self.min > self.max {
            return Err(SweepError::InvalidRange(format!(
                "min must be <= max (min={}, max={})",
                self.min, self.max
            )));
        }
        if self.increment <= 0.0 {
            return Err(SweepError::InvalidRange(format!(
                "increment must be > 0 (increment={})",
                self.increment
            )));
        }
        Ok(())
    }

    /// Number of weight steps, endpoints inclusive.
    pub fn steps(&self) -> usize {
        ((self.max - self.min) / self.increment).round() as usize + 1
    }
}

/// One point in the sweep: a technique pair plus a weight pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantParams {
    pub normalization: String,
    pub combination: String,
    pub weights: (f64, f64),
}

/// Round to one decimal digit. Keeps stepped weights exactly representable
/// so `w1 + w2 == 1.0` holds without float drift.
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Expand the ordered sequence of variant parameter tuples.
///
/// With `include_weights` unset every technique pair gets the fixed
/// [`DEFAULT_WEIGHTS`] pair and the range is not consulted. Empty technique
/// slices yield an empty sequence, not an error.
pub fn expand_variant_space(
    normalizations: &[String],
    combinations: &[String],
    range: WeightsRange,
    include_weights: bool,
) -> Result<Vec<VariantParams>, SweepError> {
    if !include_weights {
        let mut out = Vec::with_capacity(normalizations.len() * combinations.len());
        for normalization in normalizations {
            for combination in combinations {
                out.push(VariantParams {
                    normalization: normalization.clone(),
                    combination: combination.clone(),
                    weights: DEFAULT_WEIGHTS,
                });
            }
        }
        return Ok(out);
    }

    range.validate()?;
    let steps = range.steps();

    let mut weight_pairs = Vec::with_capacity(steps);
    for i in 0..steps {
        // The last step snaps to max so increments that do not divide the
        // span evenly still cover the upper endpoint.
        let raw = if i == steps - 1 {
            range.max
        } else {
            range.min + i as f64 * range.increment
        };
        let first = round1(raw);
        let second = round1(1.0 - first);
        weight_pairs.push((first, second));
    }

    let mut out = Vec::with_capacity(normalizations.len() * combinations.len() * steps);
    for normalization in normalizations {
        for combination in combinations {
            for &weights in &weight_pairs {
                out.push(VariantParams {
                    normalization: normalization.clone(),
                    combination: combination.clone(),
                    weights,
                });
            }
        }
    }
    Ok(out)
}
