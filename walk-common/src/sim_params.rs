use crate::config::ConfigError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which movement rule advances particles during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Drift expressed as a skew of the left/right move probability.
    #[default]
    Probability,
    /// Drift expressed as a constant additive offset per move.
    Step,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "probability" | "prob" => Ok(PolicyKind::Probability),
            "step" => Ok(PolicyKind::Step),
            other => Err(format!(
                "unknown movement policy '{}', expected 'probability' or 'step'",
                other
            )),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Probability => f.write_str("probability"),
            PolicyKind::Step => f.write_str("step"),
        }
    }
}

/// Physical inputs of one run, as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalkInputs {
    pub delta_t: f64,
    pub total_time: f64,
    /// Diffusion constant `D`.
    pub diffusion: f64,
    /// Drift bias `b`.
    pub drift_bias: f64,
    /// Line jump rate `gamma`.
    pub jump_rate: f64,
    /// Signed so that a negative request can be reported instead of wrapping.
    pub particle_count: i64,
}

/// Simulation parameters derived from the inputs, used on every step.
/// Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimParams {
    // Inputs
    pub delta_t: f64,
    pub total_time: f64,
    pub diffusion: f64,
    pub drift_bias: f64,
    pub jump_rate: f64,
    pub particle_count: usize,
    pub policy: PolicyKind,

    // Derived behaviour
    pub increments: u64,
    pub move_distance: f64,
    pub move_probability: f64,
    pub jump_probability: f64,
    pub drift_step: f64,
    /// True when `D == 0 && b == 0` forced the neutral move probability.
    pub degenerate_bias: bool,
}

impl SimParams {
    /// Validates the inputs and computes the per-step behaviour.
    pub fn derive(inputs: &WalkInputs, policy: PolicyKind) -> Result<Self, ConfigError> {
        let WalkInputs {
            delta_t,
            total_time,
            diffusion,
            drift_bias,
            jump_rate,
            particle_count,
        } = *inputs;

        if !delta_t.is_finite() || delta_t <= 0.0 {
            return Err(ConfigError::invalid("deltaT", "must be a finite number greater than 0", delta_t));
        }
        if !total_time.is_finite() || total_time < 0.0 {
            return Err(ConfigError::invalid("totalTime", "must be a finite number >= 0", total_time));
        }
        if !diffusion.is_finite() || diffusion < 0.0 {
            return Err(ConfigError::invalid("D", "must be a finite number >= 0", diffusion));
        }
        if !drift_bias.is_finite() {
            return Err(ConfigError::invalid("b", "must be finite", drift_bias));
        }
        if !jump_rate.is_finite() || jump_rate < 0.0 {
            return Err(ConfigError::invalid("gamma", "must be a finite number >= 0", jump_rate));
        }
        if particle_count <= 0 {
            return Err(ConfigError::invalid("particleCount", "must be greater than 0", particle_count));
        }

        let increments = (total_time / delta_t).floor() as u64;
        let move_distance = (2.0 * diffusion * delta_t).sqrt();
        let (move_probability, degenerate_bias) = move_probability(diffusion, drift_bias, delta_t);
        let jump_probability = delta_t * jump_rate;
        let drift_step = delta_t * drift_bias;

        if degenerate_bias {
            warn!("D and b are 0 or too small to resolve; move probability falls back to 0.5.");
        }
        if jump_probability > 1.0 {
            warn!(
                "Jump probability {:.4} exceeds 1; every particle will jump on every step.",
                jump_probability
            );
        }

        Ok(Self {
            delta_t,
            total_time,
            diffusion,
            drift_bias,
            jump_rate,
            particle_count: particle_count as usize,
            policy,
            increments,
            move_distance,
            move_probability,
            jump_probability,
            drift_step,
            degenerate_bias,
        })
    }
}

/// Probability of a positive move on the top line.
///
/// Returns the probability and whether the neutral value was substituted: for
/// `D == 0 && b == 0`, or when `D` and `b` are so small the denominator underflows.
pub fn move_probability(diffusion: f64, drift_bias: f64, delta_t: f64) -> (f64, bool) {
    if diffusion == 0.0 && drift_bias == 0.0 {
        return (0.5, true);
    }
    let denom = ((2.0 * diffusion) / delta_t + drift_bias * drift_bias).sqrt();
    if denom == 0.0 {
        return (0.5, true);
    }
    (0.5 * (1.0 + drift_bias / denom), false)
}
