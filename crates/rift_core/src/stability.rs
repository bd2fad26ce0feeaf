//! # Stability Model
//!
//! Pure mapping from a dimension's pressure sources to a score in `[0, 1]`.
//!
//! ```text
//! stability = 1 - sum(rift impact)
//!               - destabilization
//!               - effect_weight * (active effects / ceiling)
//!               - load_weight   * (entities / capacity)
//! ```

use crate::config::StabilityConfig;

/// Pressure sources of one dimension.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StabilityInputs {
    /// Sum of live rift impacts.
    pub rift_impact: f32,
    /// Sum of destabilizing effect pressure.
    pub destabilization: f32,
    /// Active effect instances.
    pub active_effects: usize,
    /// Effect instance ceiling.
    pub effect_ceiling: usize,
    /// Entities present.
    pub entity_count: usize,
    /// Entity capacity.
    pub entity_capacity: usize,
}

/// Weights of the density terms.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StabilityWeights {
    /// Weight of active-effect density.
    pub effect_density: f32,
    /// Weight of entity load.
    pub entity_load: f32,
}

impl From<&StabilityConfig> for StabilityWeights {
    fn from(config: &StabilityConfig) -> Self {
        Self {
            effect_density: config.effect_density_weight,
            entity_load: config.entity_load_weight,
        }
    }
}

/// State machine thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    /// Below this: `Unstable`.
    pub warning: f32,
    /// At or below this: `Collapsing`.
    pub critical: f32,
    /// At or above this: a collapse is cancelled.
    pub recovery: f32,
}

impl From<&StabilityConfig> for Thresholds {
    fn from(config: &StabilityConfig) -> Self {
        Self {
            warning: config.warning,
            critical: config.critical,
            recovery: config.recovery,
        }
    }
}

#[inline]
fn ratio(part: usize, whole: usize) -> f32 {
    if whole == 0 {
        return 0.0;
    }
    part as f32 / whole as f32
}

/// Computes the stability score.
///
/// Always returns a value in `[0, 1]`; a non-finite intermediate yields 0.
#[must_use]
pub fn compute(inputs: &StabilityInputs, weights: &StabilityWeights) -> f32 {
    let score = 1.0
        - inputs.rift_impact
        - inputs.destabilization
        - weights.effect_density * ratio(inputs.active_effects, inputs.effect_ceiling)
        - weights.entity_load * ratio(inputs.entity_count, inputs.entity_capacity);

    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
