use rand::Rng;
use walk_common::{Line, Particle, SimParams};

/// Advances one particle by one time step.
///
/// Implementations read only the particle they are given plus fresh draws
/// from `rng`, so particles can be updated in any order within a step.
pub trait MovementPolicy: Sync {
    fn advance<R: Rng + ?Sized>(&self, particle: &mut Particle, rng: &mut R);
}

/// Drift as a skew of the move probability: the top line moves right with
/// `move_probability`, the bottom line with its complement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityPolicy {
    pub jump_probability: f64,
    pub move_probability: f64,
    pub move_distance: f64,
}

impl ProbabilityPolicy {
    pub fn from_params(params: &SimParams) -> Self {
        Self {
            jump_probability: params.jump_probability,
            move_probability: params.move_probability,
            move_distance: params.move_distance,
        }
    }
}

impl MovementPolicy for ProbabilityPolicy {
    #[inline(always)]
    fn advance<R: Rng + ?Sized>(&self, particle: &mut Particle, rng: &mut R) {
        // A jump consumes the whole step.
        if rng.random::<f64>() < self.jump_probability {
            particle.line = particle.line.flipped();
            return;
        }
        let p_right = match particle.line {
            Line::Top => self.move_probability,
            Line::Bottom => 1.0 - self.move_probability,
        };
        if rng.random::<f64>() < p_right {
            particle.position += self.move_distance;
        } else {
            particle.position -= self.move_distance;
        }
    }
}

/// Drift as a constant offset: even left/right odds, then `drift_step`
/// added on the top line and subtracted on the bottom line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPolicy {
    pub jump_probability: f64,
    pub move_distance: f64,
    pub drift_step: f64,
}

impl StepPolicy {
    pub fn from_params(params: &SimParams) -> Self {
        Self {
            jump_probability: params.jump_probability,
            move_distance: params.move_distance,
            drift_step: params.drift_step,
        }
    }
}

impl MovementPolicy for StepPolicy {
    #[inline(always)]
    fn advance<R: Rng + ?Sized>(&self, particle: &mut Particle, rng: &mut R) {
        if rng.random::<f64>() < self.jump_probability {
            particle.line = particle.line.flipped();
            return;
        }
        let step = if rng.random::<f64>() < 0.5 {
            self.move_distance
        } else {
            -self.move_distance
        };
        particle.position += step + particle.line.drift_sign() * self.drift_step;
    }
}
