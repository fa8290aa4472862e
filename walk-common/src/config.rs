use crate::channel::layout::MAX_CAPACITY;
use crate::sim_params::{PolicyKind, SimParams};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound on the derived channel capacity, in records.
pub const MAX_DERIVED_CAPACITY: usize = 1_000_000;

/// A configuration value that failed validation. Always fatal, raised before any stepping.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid parameter `{name}` = {value}: {constraint}")]
    InvalidParameter {
        name: &'static str,
        constraint: &'static str,
        value: String,
    },
}

impl ConfigError {
    pub fn invalid(name: &'static str, constraint: &'static str, value: impl Display) -> Self {
        ConfigError::InvalidParameter {
            name,
            constraint,
            value: value.to_string(),
        }
    }
}

// Run-loop settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Base seed; each worker stream mixes its index into it.
    pub seed: u64,
    pub policy: PolicyKind,
    /// Steps between published snapshots.
    pub publish_stride: u64,
    /// Optional wall-clock cadence; a snapshot goes out when either this or the stride fires.
    pub publish_interval_ms: Option<u64>,
    /// Pause after each publication, to pace a live viewer.
    pub frame_delay_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            seed: 123_456_789,
            policy: PolicyKind::Probability,
            publish_stride: 10,
            publish_interval_ms: None,
            frame_delay_ms: 0,
        }
    }
}

/// What each record in the shared region describes.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// One record per non-empty (bucket, line) pair.
    #[default]
    Histogram,
    /// One record per particle.
    Particles,
}

// Shared-memory channel settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub name: String,
    pub directory: PathBuf,
    /// Maximum number of records the region holds. Derived from the run when absent.
    pub capacity: Option<usize>,
    pub mode: SnapshotMode,
    /// Histogram bucket width. Defaults to the move distance.
    pub bucket_width: Option<f64>,
    /// Remove a stale region of the same name instead of failing.
    pub replace_existing: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            enabled: true,
            name: "particle_shm".to_string(),
            directory: PathBuf::from("/dev/shm"),
            capacity: None,
            mode: SnapshotMode::Histogram,
            bucket_width: None,
            replace_existing: false,
        }
    }
}

impl ChannelConfig {
    /// Full path of the backing region.
    pub fn path(&self) -> PathBuf {
        self.directory.join(self.name.trim_start_matches('/'))
    }

    /// Bucket width used for aggregation: configured, else the move distance,
    /// else the drift step, else 1.
    pub fn bucket_width_for(&self, params: &SimParams) -> f64 {
        if let Some(width) = self.bucket_width {
            return width;
        }
        if params.move_distance > 0.0 {
            params.move_distance
        } else if params.drift_step != 0.0 {
            params.drift_step.abs()
        } else {
            1.0
        }
    }

    /// Record capacity of the region: configured, else large enough for every
    /// bucket a particle can reach (histogram mode) or every particle.
    pub fn capacity_for(&self, params: &SimParams) -> usize {
        if let Some(capacity) = self.capacity {
            return capacity;
        }
        match self.mode {
            SnapshotMode::Particles => params.particle_count,
            SnapshotMode::Histogram => {
                let width = self.bucket_width_for(params);
                let reach = params.increments as f64 * (params.move_distance + params.drift_step.abs());
                // One spare bucket on each side for rounding at the edges.
                let max_index = (reach / width).ceil() + 1.0;
                let buckets_per_line = 2.0 * max_index + 1.0;
                let records = 2.0 * buckets_per_line;
                if records.is_finite() && records < MAX_DERIVED_CAPACITY as f64 {
                    records as usize
                } else {
                    MAX_DERIVED_CAPACITY
                }
            }
        }
    }
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub base_filename: String,
    /// Final population as `x,y` rows.
    pub save_positions: bool,
    /// Final per-bucket frequencies.
    pub save_histogram: bool,
    /// Every published snapshot, in `format`.
    pub save_snapshots: bool,
    pub format: Option<String>, // "json", "bincode", "messagepack"
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            base_filename: "walk".to_string(),
            save_positions: false,
            save_histogram: false,
            save_snapshots: false,
            format: None,
        }
    }
}

/// Everything about a run that is not a physical parameter, loaded from TOML.
/// Every section is optional.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct SimulationConfig {
    pub run: RunConfig,
    pub channel: ChannelConfig,
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Loads the configuration from a TOML file and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        let config = Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to load config from '{}': {}", path_ref.display(), e))?;

        Ok(config)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.publish_stride == 0 {
            return Err(ConfigError::invalid("run.publish_stride", "must be greater than 0", 0));
        }
        if let Some(width) = self.channel.bucket_width {
            if !width.is_finite() || width <= 0.0 {
                return Err(ConfigError::invalid(
                    "channel.bucket_width",
                    "must be a finite number greater than 0",
                    width,
                ));
            }
        }
        if let Some(capacity) = self.channel.capacity {
            if capacity == 0 || capacity > MAX_CAPACITY {
                return Err(ConfigError::invalid(
                    "channel.capacity",
                    "must be between 1 and 2147483647",
                    capacity,
                ));
            }
        }
        if self.channel.enabled && self.channel.name.trim_start_matches('/').is_empty() {
            return Err(ConfigError::invalid("channel.name", "must not be empty", "\"\""));
        }
        if let Some(format) = self.output.format.as_deref() {
            if !matches!(format, "json" | "bincode" | "messagepack") {
                return Err(ConfigError::invalid(
                    "output.format",
                    "must be one of json, bincode, messagepack",
                    format,
                ));
            }
        }
        Ok(())
    }
}
