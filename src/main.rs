use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use walk_common::{
    ChannelWriter, PolicyKind, SimParams, SimulationConfig, SnapshotSink, WalkInputs,
};
use walk_engine::export::write_outputs;
use walk_engine::{resolve_worker_count, EngineOptions, Simulation};

/// Two-line diffusion-with-drift particle simulator.
///
/// Streams population snapshots to a viewer through a shared-memory channel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, allow_negative_numbers = true)]
struct Args {
    /// Time step (deltaT)
    delta_t: f64,
    /// Total simulated time
    total_time: f64,
    /// Diffusion constant (D)
    diffusion: f64,
    /// Drift bias (b)
    drift_bias: f64,
    /// Line jump rate (gamma)
    gamma: f64,
    /// Number of particles
    particle_count: i64,
    /// Worker threads (clamped to the available cores)
    core_count: i64,

    /// Optional TOML file with run, channel and output settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Movement policy: "probability" or "step"
    #[arg(long)]
    policy: Option<PolicyKind>,

    /// Steps between published snapshots
    #[arg(long)]
    stride: Option<u64>,

    /// Run headless without creating the shared channel
    #[arg(long)]
    no_channel: bool,

    /// Name of the shared channel
    #[arg(long)]
    channel_name: Option<String>,
}

impl Args {
    fn inputs(&self) -> WalkInputs {
        WalkInputs {
            delta_t: self.delta_t,
            total_time: self.total_time,
            diffusion: self.diffusion,
            drift_bias: self.drift_bias,
            jump_rate: self.gamma,
            particle_count: self.particle_count,
        }
    }

    /// Command-line flags take precedence over the config file.
    fn apply_overrides(&self, config: &mut SimulationConfig) {
        if let Some(seed) = self.seed {
            config.run.seed = seed;
        }
        if let Some(policy) = self.policy {
            config.run.policy = policy;
        }
        if let Some(stride) = self.stride {
            config.run.publish_stride = stride;
        }
        if self.no_channel {
            config.channel.enabled = false;
        }
        if let Some(name) = &self.channel_name {
            config.channel.name = name.clone();
        }
    }
}

fn log_behaviour(params: &SimParams, workers: usize) {
    info!("--------- Behavior ---------");
    info!("Policy:              {}", params.policy);
    info!("Increments:          {}", params.increments);
    info!("Number of Particles: {}", params.particle_count);
    info!("Workers:             {}", workers);
    info!("Move Distance:       {:.4}", params.move_distance);
    info!("Move Probability:    {:.4}", params.move_probability);
    info!("Jump Probability:    {:.4}", params.jump_probability);
    info!("Drift Step:          {:.4}", params.drift_step);
    info!("----------------------------");
}

fn main() -> Result<()> {
    // Initialize the logger
    env_logger::init();

    let args = Args::parse();
    info!("Starting Two-Line Walk Engine...");

    // --- Load Configuration ---
    let mut config = match &args.config {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };
    args.apply_overrides(&mut config);
    config.validate()?;

    let workers = resolve_worker_count(args.core_count)?;
    let params = SimParams::derive(&args.inputs(), config.run.policy)?;
    log_behaviour(&params, workers);
    debug!("Simulation Parameters: {:#?}", params);

    // --- Shared channel (created before any stepping; failure aborts the run) ---
    let mut channel = if config.channel.enabled {
        let capacity = config.channel.capacity_for(&params);
        let writer = ChannelWriter::from_config(&config.channel, capacity)
            .context("Cannot start simulation without the shared channel")?;
        Some(writer)
    } else {
        info!("Shared channel disabled; running headless.");
        None
    };

    // --- Initialize Simulation ---
    let options = EngineOptions::from_config(&config, &params, workers);
    let mut sim = Simulation::new(params, options)?;
    info!("Initialized {} particles.", sim.store().len());

    // --- Simulation Loop ---
    let sink = channel.as_mut().map(|w| w as &mut dyn SnapshotSink);
    sim.run(sink);

    let (top, bottom) = sim.store().line_counts();
    let stats = sim.store().stats();
    info!(
        "Final population: top {}, bottom {}, mean {:.4}, variance {:.4}",
        top, bottom, stats.mean, stats.variance
    );

    if let Some(writer) = channel {
        if writer.overwritten() > 0 {
            warn!(
                "{} of {} frames were replaced before the viewer read them.",
                writer.overwritten(),
                writer.published()
            );
        }
        writer.unlink().context("Failed to unlink shared channel")?;
    }

    // --- Save Recorded Data ---
    info!("Saving recorded data...");
    let final_snapshot = sim.snapshot();
    write_outputs(
        &config.output,
        sim.store().particles(),
        &final_snapshot,
        sim.recorded_snapshots(),
    );

    info!("Simulation Complete.");
    Ok(())
}
