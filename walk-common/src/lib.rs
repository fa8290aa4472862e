pub mod channel;
pub mod config;
pub mod particle;
pub mod sim_params;
pub mod snapshot;

// Re-export key types for easier use by dependent crates
pub use channel::{ChannelError, ChannelReader, ChannelWriter, Frame, PublishReport, SnapshotSink, WireRecord};
pub use config::{ChannelConfig, ConfigError, OutputConfig, RunConfig, SimulationConfig, SnapshotMode};
pub use particle::{Line, Particle};
pub use sim_params::{move_probability, PolicyKind, SimParams, WalkInputs};
pub use snapshot::{bucket_centre, bucket_index, BucketCounts, Histogram, HistogramEntry, PopulationSnapshot};
