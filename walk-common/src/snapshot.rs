use crate::particle::{Line, Particle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Particle counts on both lines for one position bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub top: u32,
    pub bottom: u32,
}

impl BucketCounts {
    pub fn add(&mut self, line: Line, count: u32) {
        match line {
            Line::Top => self.top += count,
            Line::Bottom => self.bottom += count,
        }
    }

    pub fn get(&self, line: Line) -> u32 {
        match line {
            Line::Top => self.top,
            Line::Bottom => self.bottom,
        }
    }

    pub fn total(&self) -> u64 {
        self.top as u64 + self.bottom as u64
    }
}

/// A point-in-time, read-only aggregation of the particle population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationSnapshot {
    /// Number of completed steps when the snapshot was taken.
    pub step: u64,
    /// Simulation time (`step * deltaT`).
    pub time: f64,
    pub total_particle_count: u64,
    pub bucket_width: f64,
    /// Bucket index (position / width, rounded) -> counts per line.
    pub buckets: BTreeMap<i64, BucketCounts>,
    /// Raw particle list, kept only when the channel streams individual particles.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub positions: Option<Vec<Particle>>,
}

impl PopulationSnapshot {
    /// Aggregates `particles` into buckets of `bucket_width`.
    pub fn from_particles(
        step: u64,
        time: f64,
        particles: &[Particle],
        bucket_width: f64,
        keep_positions: bool,
    ) -> Self {
        let mut buckets: BTreeMap<i64, BucketCounts> = BTreeMap::new();
        for particle in particles {
            buckets
                .entry(bucket_index(particle.position, bucket_width))
                .or_default()
                .add(particle.line, 1);
        }
        Self {
            step,
            time,
            total_particle_count: particles.len() as u64,
            bucket_width,
            buckets,
            positions: keep_positions.then(|| particles.to_vec()),
        }
    }

    /// Particle counts per line across all buckets.
    pub fn line_totals(&self) -> (u64, u64) {
        self.buckets.values().fold((0, 0), |(top, bottom), counts| {
            (top + counts.top as u64, bottom + counts.bottom as u64)
        })
    }

    /// The aggregation a consumer reconstructs from this snapshot's wire form.
    pub fn histogram(&self) -> Histogram {
        match &self.positions {
            Some(particles) => Histogram::from_points(
                particles.iter().map(|p| (p.position as f32, p.line, 1)),
            ),
            None => Histogram::from_points(self.buckets.iter().flat_map(|(&index, counts)| {
                let x = bucket_centre(index, self.bucket_width) as f32;
                [(x, Line::Top, counts.top), (x, Line::Bottom, counts.bottom)]
            })),
        }
    }
}

/// Bucket holding `position`. Positions on the `k * width` lattice land exactly on `k`.
#[inline(always)]
pub fn bucket_index(position: f64, width: f64) -> i64 {
    (position / width).round() as i64
}

#[inline(always)]
pub fn bucket_centre(index: i64, width: f64) -> f64 {
    index as f64 * width
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramEntry {
    pub x: f32,
    pub counts: BucketCounts,
}

/// Consumer-side aggregation keyed by wire position, sorted by `x`.
/// Zero-count entries are never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    entries: Vec<HistogramEntry>,
}

impl Histogram {
    /// Builds a histogram from `(x, line, count)` points, merging equal positions.
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = (f32, Line, u32)>,
    {
        let mut points: Vec<(f32, Line, u32)> = points.into_iter().filter(|p| p.2 > 0).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut entries: Vec<HistogramEntry> = Vec::new();
        for (x, line, count) in points {
            match entries.last_mut() {
                Some(last) if last.x == x => last.counts.add(line, count),
                _ => {
                    let mut counts = BucketCounts::default();
                    counts.add(line, count);
                    entries.push(HistogramEntry { x, counts });
                }
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[HistogramEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn totals(&self) -> BucketCounts {
        let mut totals = BucketCounts::default();
        for entry in &self.entries {
            totals.top += entry.counts.top;
            totals.bottom += entry.counts.bottom;
        }
        totals
    }

    /// Count-weighted mean position on one line, `None` when the line is empty.
    pub fn mean_position(&self, line: Line) -> Option<f64> {
        let (sum, count) = self.entries.iter().fold((0.0f64, 0u64), |(sum, count), e| {
            let c = e.counts.get(line) as u64;
            (sum + e.x as f64 * c as f64, count + c)
        });
        (count > 0).then(|| sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn particle(position: f64, line: Line) -> Particle {
        Particle { position, line }
    }

    #[test]
    fn buckets_lattice_positions_exactly() {
        let particles = [
            particle(0.0, Line::Top),
            particle(2.9999999, Line::Top),
            particle(3.0, Line::Bottom),
            particle(-1.0, Line::Bottom),
        ];
        let snap = PopulationSnapshot::from_particles(4, 2.0, &particles, 1.0, false);
        assert_eq!(snap.total_particle_count, 4);
        assert_eq!(snap.buckets[&0], BucketCounts { top: 1, bottom: 0 });
        assert_eq!(snap.buckets[&3], BucketCounts { top: 1, bottom: 1 });
        assert_eq!(snap.buckets[&-1], BucketCounts { top: 0, bottom: 1 });
        assert_eq!(snap.line_totals(), (2, 2));
        assert!(snap.positions.is_none());
    }

    #[test]
    fn histogram_merges_and_sorts() {
        let hist = Histogram::from_points([
            (2.0, Line::Top, 3),
            (-1.0, Line::Bottom, 1),
            (2.0, Line::Bottom, 4),
            (5.0, Line::Top, 0),
        ]);
        let xs: Vec<f32> = hist.entries().iter().map(|e| e.x).collect();
        assert_eq!(xs, vec![-1.0, 2.0]);
        assert_eq!(hist.entries()[1].counts, BucketCounts { top: 3, bottom: 4 });
        assert_eq!(hist.totals(), BucketCounts { top: 3, bottom: 5 });
    }

    #[test]
    fn bucket_and_particle_views_agree_on_lattice() {
        let particles: Vec<Particle> = (-3..=3)
            .flat_map(|k| [particle(k as f64 * 0.5, Line::Top), particle(k as f64 * 0.5, Line::Bottom)])
            .collect();
        let buckets = PopulationSnapshot::from_particles(1, 0.1, &particles, 0.5, false);
        let raw = PopulationSnapshot::from_particles(1, 0.1, &particles, 0.5, true);
        assert_eq!(buckets.histogram(), raw.histogram());
    }

    #[test]
    fn mean_position_per_line() {
        let hist = Histogram::from_points([(1.0, Line::Top, 1), (3.0, Line::Top, 1), (-2.0, Line::Bottom, 2)]);
        assert_eq!(hist.mean_position(Line::Top), Some(2.0));
        assert_eq!(hist.mean_position(Line::Bottom), Some(-2.0));
        assert_eq!(Histogram::default().mean_position(Line::Top), None);
    }
}
