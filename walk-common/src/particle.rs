use serde::{Deserialize, Serialize};

/// One of the two coupled 1-D walks a particle can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Top,
    Bottom,
}

impl Line {
    /// Returns the opposite line (the result of a jump).
    #[inline(always)]
    pub fn flipped(self) -> Self {
        match self {
            Line::Top => Line::Bottom,
            Line::Bottom => Line::Top,
        }
    }

    /// Numeric code used on the wire and in CSV exports: top = 1, bottom = 0.
    #[inline(always)]
    pub fn code(self) -> u8 {
        match self {
            Line::Top => 1,
            Line::Bottom => 0,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Line::Top),
            0 => Some(Line::Bottom),
            _ => None,
        }
    }

    /// Sign of the additive drift on this line. The bottom line flows opposite to the top.
    #[inline(always)]
    pub fn drift_sign(self) -> f64 {
        match self {
            Line::Top => 1.0,
            Line::Bottom => -1.0,
        }
    }
}

/// State of a single particle. Particles carry no identity beyond this.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Displacement from the origin along the walk axis.
    pub position: f64,
    pub line: Line,
}

impl Particle {
    /// Creates a particle at the origin on the given line.
    pub fn at_origin(line: Line) -> Self {
        Self { position: 0.0, line }
    }
}
