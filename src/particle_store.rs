use walk_common::{Line, Particle};

/// Summary statistics of particle positions on one line (or both).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionStats {
    pub count: usize,
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
}

impl PositionStats {
    fn from_positions<I: Iterator<Item = f64>>(positions: I) -> Self {
        // Welford's update keeps the variance stable for large counts.
        let (mut count, mut mean, mut m2) = (0usize, 0.0f64, 0.0f64);
        for x in positions {
            count += 1;
            let delta = x - mean;
            mean += delta / count as f64;
            m2 += delta * (x - mean);
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            mean,
            variance: m2 / count as f64,
        }
    }
}

/// Holds the particle population of one run in a contiguous array.
///
/// Particles are only created here; steps move them or change their line,
/// so the count never changes after construction.
#[derive(Debug, Clone)]
pub struct ParticleStore {
    particles: Vec<Particle>,
}

impl ParticleStore {
    /// Places `count / 2` particles on the top line and the rest on the bottom
    /// line, all at the origin. An odd count puts the extra particle on the bottom.
    pub fn new(count: usize) -> Self {
        let top = count / 2;
        let particles = (0..count)
            .map(|i| Particle::at_origin(if i < top { Line::Top } else { Line::Bottom }))
            .collect();
        Self { particles }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    /// Particle counts as `(top, bottom)`.
    pub fn line_counts(&self) -> (usize, usize) {
        let top = self.particles.iter().filter(|p| p.line == Line::Top).count();
        (top, self.particles.len() - top)
    }

    pub fn stats(&self) -> PositionStats {
        PositionStats::from_positions(self.particles.iter().map(|p| p.position))
    }

    pub fn line_stats(&self, line: Line) -> PositionStats {
        PositionStats::from_positions(
            self.particles
                .iter()
                .filter(|p| p.line == line)
                .map(|p| p.position),
        )
    }
}
