pub mod export;
pub mod particle_store;
pub mod policy;
pub mod rng;
pub mod simulation;

pub use particle_store::{ParticleStore, PositionStats};
pub use policy::{MovementPolicy, ProbabilityPolicy, StepPolicy};
pub use rng::RngStreams;
pub use simulation::{resolve_worker_count, EngineOptions, Simulation};
