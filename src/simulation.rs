use crate::particle_store::ParticleStore;
use crate::policy::{MovementPolicy, ProbabilityPolicy, StepPolicy};
use crate::rng::RngStreams;
use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::time::{Duration, Instant};
use walk_common::{
    ConfigError, Particle, PolicyKind, PopulationSnapshot, SimParams, SimulationConfig, SnapshotMode,
    SnapshotSink,
};

/// Engine settings that are not physical parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub seed: u64,
    /// Worker threads, already clamped to the host (see [`resolve_worker_count`]).
    pub workers: usize,
    pub publish_stride: u64,
    pub publish_interval: Option<Duration>,
    /// Pause after each publication to a sink.
    pub frame_delay: Option<Duration>,
    pub bucket_width: f64,
    /// Keep the raw particle list in snapshots.
    pub keep_positions: bool,
    /// Keep every published snapshot in memory for export.
    pub record_snapshots: bool,
}

impl EngineOptions {
    pub fn from_config(config: &SimulationConfig, params: &SimParams, workers: usize) -> Self {
        Self {
            seed: config.run.seed,
            workers,
            publish_stride: config.run.publish_stride,
            publish_interval: config.run.publish_interval_ms.map(Duration::from_millis),
            frame_delay: (config.run.frame_delay_ms > 0)
                .then(|| Duration::from_millis(config.run.frame_delay_ms)),
            bucket_width: config.channel.bucket_width_for(params),
            keep_positions: config.channel.enabled && config.channel.mode == SnapshotMode::Particles,
            record_snapshots: config.output.save_snapshots,
        }
    }
}

/// Validates a requested core count and clamps it to the host's parallelism.
pub fn resolve_worker_count(requested: i64) -> Result<usize, ConfigError> {
    if requested <= 0 {
        return Err(ConfigError::invalid("coreCount", "must be greater than 0", requested));
    }
    let available = num_cpus::get().max(1);
    let requested = requested as usize;
    if requested > available {
        warn!("Not enough cores for {} workers. Using max: {}.", requested, available);
        Ok(available)
    } else {
        Ok(requested)
    }
}

/// The movement rule chosen for the run.
#[derive(Debug, Clone, Copy)]
enum Policy {
    Probability(ProbabilityPolicy),
    Step(StepPolicy),
}

/// Drives the time-step loop of one two-line walk run.
pub struct Simulation {
    params: SimParams,
    options: EngineOptions,
    policy: Policy,
    store: ParticleStore,
    streams: RngStreams,
    pool: rayon::ThreadPool,
    /// Completed steps.
    current_step: u64,
    last_publish: Option<Instant>,
    recorded_snapshots: Vec<PopulationSnapshot>,
    published: u64,
    dropped: u64,
}

impl Simulation {
    /// Validates the options and places the initial population.
    pub fn new(params: SimParams, options: EngineOptions) -> Result<Self> {
        if params.particle_count == 0 {
            return Err(ConfigError::invalid("particleCount", "must be greater than 0", 0).into());
        }
        if options.workers == 0 {
            return Err(ConfigError::invalid("coreCount", "must be greater than 0", 0).into());
        }
        if options.publish_stride == 0 {
            return Err(ConfigError::invalid("run.publish_stride", "must be greater than 0", 0).into());
        }
        if !options.bucket_width.is_finite() || options.bucket_width <= 0.0 {
            return Err(ConfigError::invalid(
                "channel.bucket_width",
                "must be a finite number greater than 0",
                options.bucket_width,
            )
            .into());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("walk-worker-{}", i))
            .build()
            .context("Failed to build worker thread pool")?;
        let streams = RngStreams::new(options.seed, options.workers);
        let store = ParticleStore::new(params.particle_count);
        let policy = match params.policy {
            PolicyKind::Probability => Policy::Probability(ProbabilityPolicy::from_params(&params)),
            PolicyKind::Step => Policy::Step(StepPolicy::from_params(&params)),
        };
        debug!(
            "Engine ready: {} workers, seed {}, policy {}.",
            options.workers, options.seed, params.policy
        );

        Ok(Self {
            params,
            options,
            policy,
            store,
            streams,
            pool,
            current_step: 0,
            last_publish: None,
            recorded_snapshots: Vec::new(),
            published: 0,
            dropped: 0,
        })
    }

    /// Advances every particle by one time step. Returns once all workers have finished.
    pub fn step(&mut self) {
        let particles = self.store.particles_mut();
        let streams = self.streams.streams_mut();
        match &self.policy {
            Policy::Probability(policy) => advance_population(&self.pool, particles, streams, policy),
            Policy::Step(policy) => advance_population(&self.pool, particles, streams, policy),
        }
        self.current_step += 1;
    }

    /// Runs the remaining steps, publishing snapshots to `sink` at the configured
    /// cadence, and returns the final population.
    pub fn run(&mut self, mut sink: Option<&mut dyn SnapshotSink>) -> &ParticleStore {
        let total_steps = self.params.increments;
        info!("Starting simulation loop for {} steps...", total_steps);
        let start_time = Instant::now();
        let mut previous_print_time = start_time;

        // Initial snapshot (t = 0)
        if self.current_step == 0 {
            self.publish(sink.as_deref_mut());
        }

        while self.current_step < total_steps {
            let step_start_time = Instant::now();
            self.step();
            let step_duration = step_start_time.elapsed();

            let step = self.current_step;
            let current_time = Instant::now();
            let print_interval_secs = 5.0;
            let should_print_status =
                current_time.duration_since(previous_print_time).as_secs_f64() >= print_interval_secs;
            let is_last_step = step == total_steps;
            let is_publish_step = is_last_step || step % self.options.publish_stride == 0 || self.interval_elapsed();

            if should_print_status || is_publish_step {
                let (top, bottom) = self.store.line_counts();
                info!(
                    "Step [{}/{}] (t = {:.3}) | Top: {} | Bottom: {} | Step Time: {:6.2} ms | Elapsed: {:.2} s",
                    step,
                    total_steps,
                    step as f64 * self.params.delta_t,
                    top,
                    bottom,
                    step_duration.as_secs_f64() * 1000.0,
                    start_time.elapsed().as_secs_f64()
                );
                previous_print_time = current_time;
            } else {
                trace!(
                    "Step [{}/{}] completed in {:.2} ms",
                    step,
                    total_steps,
                    step_duration.as_secs_f64() * 1000.0
                );
            }

            if is_publish_step {
                self.publish(sink.as_deref_mut());
            }
        }

        let total_duration = start_time.elapsed();
        info!(
            "Simulation finished in {:.3} seconds ({} snapshots published, {} dropped).",
            total_duration.as_secs_f64(),
            self.published,
            self.dropped
        );
        &self.store
    }

    /// Aggregates the current population.
    pub fn snapshot(&self) -> PopulationSnapshot {
        PopulationSnapshot::from_particles(
            self.current_step,
            self.current_step as f64 * self.params.delta_t,
            self.store.particles(),
            self.options.bucket_width,
            self.options.keep_positions,
        )
    }

    fn interval_elapsed(&self) -> bool {
        match (self.options.publish_interval, self.last_publish) {
            (Some(interval), Some(last)) => last.elapsed() >= interval,
            _ => false,
        }
    }

    /// Called only between steps, after every worker has finished.
    fn publish(&mut self, sink: Option<&mut (dyn SnapshotSink + '_)>) {
        let snapshot = self.snapshot();
        if let Some(sink) = sink {
            match sink.publish(&snapshot) {
                Ok(()) => self.published += 1,
                Err(e) => {
                    self.dropped += 1;
                    warn!("Dropped snapshot at step {}: {}", self.current_step, e);
                }
            }
            if let Some(delay) = self.options.frame_delay {
                std::thread::sleep(delay);
            }
        }
        if self.options.record_snapshots {
            self.recorded_snapshots.push(snapshot);
        }
        self.last_publish = Some(Instant::now());
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Snapshots kept for export when `record_snapshots` is set.
    pub fn recorded_snapshots(&self) -> &[PopulationSnapshot] {
        &self.recorded_snapshots
    }

    /// Snapshots accepted by the sink.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Snapshots the sink refused.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Splits the population into one contiguous chunk per stream and advances the
/// chunks in parallel. Each chunk owns its stream for the whole step.
fn advance_population<P: MovementPolicy>(
    pool: &rayon::ThreadPool,
    particles: &mut [Particle],
    streams: &mut [StdRng],
    policy: &P,
) {
    if particles.is_empty() || streams.is_empty() {
        return;
    }
    let chunk_len = particles.len().div_ceil(streams.len());
    pool.install(|| {
        particles
            .par_chunks_mut(chunk_len)
            .zip(streams.par_iter_mut())
            .for_each(|(chunk, rng)| {
                for particle in chunk {
                    policy.advance(particle, rng);
                }
            });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use walk_common::{ChannelError, Line, WalkInputs};

    fn params(policy: PolicyKind, jump_rate: f64, particle_count: i64) -> SimParams {
        SimParams::derive(
            &WalkInputs {
                delta_t: 0.5,
                total_time: 10.0,
                diffusion: 1.0,
                drift_bias: 0.2,
                jump_rate,
                particle_count,
            },
            policy,
        )
        .unwrap()
    }

    fn options(workers: usize) -> EngineOptions {
        EngineOptions {
            seed: 99,
            workers,
            publish_stride: 10,
            publish_interval: None,
            frame_delay: None,
            bucket_width: 1.0,
            keep_positions: false,
            record_snapshots: false,
        }
    }

    struct RefusingSink;

    impl SnapshotSink for RefusingSink {
        fn publish(&mut self, _: &PopulationSnapshot) -> Result<(), ChannelError> {
            Err(ChannelError::SnapshotTooLarge { records: 10, capacity: 1 })
        }
    }

    #[test]
    fn rejects_invalid_options() {
        let p = params(PolicyKind::Probability, 0.0, 10);
        let cases = [
            (EngineOptions { workers: 0, ..options(1) }, "coreCount"),
            (EngineOptions { publish_stride: 0, ..options(1) }, "run.publish_stride"),
            (EngineOptions { bucket_width: 0.0, ..options(1) }, "channel.bucket_width"),
        ];
        for (opts, expected) in cases {
            let err = Simulation::new(p.clone(), opts).err().expect("should fail");
            match err.downcast_ref::<ConfigError>() {
                Some(ConfigError::InvalidParameter { name, .. }) => assert_eq!(*name, expected),
                None => panic!("unexpected error: {}", err),
            }
        }
    }

    #[test]
    fn worker_count_is_validated_and_clamped() {
        assert!(resolve_worker_count(0).is_err());
        assert!(resolve_worker_count(-3).is_err());
        assert_eq!(resolve_worker_count(1).unwrap(), 1);
        assert_eq!(resolve_worker_count(i64::MAX).unwrap(), num_cpus::get().max(1));
    }

    #[test]
    fn zero_jump_rate_never_changes_lines() {
        for policy in [PolicyKind::Probability, PolicyKind::Step] {
            let mut sim = Simulation::new(params(policy, 0.0, 101), options(3)).unwrap();
            let before: Vec<Line> = sim.store().particles().iter().map(|p| p.line).collect();
            sim.run(None);
            let after: Vec<Line> = sim.store().particles().iter().map(|p| p.line).collect();
            assert_eq!(before, after);
            assert_eq!(sim.current_step(), 20);
        }
    }

    #[test]
    fn same_seed_and_workers_reproduce_run() {
        let run = || {
            let mut sim = Simulation::new(params(PolicyKind::Probability, 0.3, 500), options(4)).unwrap();
            sim.run(None).particles().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn publishes_initial_stride_and_final_snapshots() {
        let mut sim = Simulation::new(
            params(PolicyKind::Probability, 0.0, 20),
            EngineOptions { publish_stride: 7, ..options(2) },
        )
        .unwrap();
        let mut sink: Vec<PopulationSnapshot> = Vec::new();
        sim.run(Some(&mut sink));
        let steps: Vec<u64> = sink.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![0, 7, 14, 20]);
        assert_eq!(sim.published(), 4);
        assert!(sink.iter().all(|s| s.total_particle_count == 20));
        assert_eq!(sink[0].buckets.len(), 1);
        assert!((sink[3].time - 10.0).abs() < 1e-12);
    }

    #[test]
    fn zero_interval_publishes_every_step() {
        let mut sim = Simulation::new(
            params(PolicyKind::Step, 0.0, 8),
            EngineOptions {
                publish_interval: Some(Duration::ZERO),
                record_snapshots: true,
                ..options(1)
            },
        )
        .unwrap();
        let mut sink: Vec<PopulationSnapshot> = Vec::new();
        sim.run(Some(&mut sink));
        assert_eq!(sink.len(), 21);
        assert_eq!(sim.recorded_snapshots().len(), 21);
    }

    #[test]
    fn refused_snapshots_do_not_stop_the_run() {
        let mut sim = Simulation::new(params(PolicyKind::Probability, 0.1, 10), options(2)).unwrap();
        let mut sink = RefusingSink;
        let store = sim.run(Some(&mut sink));
        assert_eq!(store.len(), 10);
        assert_eq!(sim.current_step(), 20);
        assert_eq!(sim.published(), 0);
        assert_eq!(sim.dropped(), 3);
    }

    #[test]
    fn more_workers_than_particles() {
        let mut sim = Simulation::new(params(PolicyKind::Probability, 0.5, 3), options(8)).unwrap();
        sim.run(None);
        let (top, bottom) = sim.store().line_counts();
        assert_eq!(top + bottom, 3);
        assert_eq!(sim.current_step(), 20);
    }

    #[test]
    fn snapshots_carry_raw_positions_when_requested() {
        let sim = Simulation::new(
            params(PolicyKind::Probability, 0.0, 6),
            EngineOptions { keep_positions: true, ..options(1) },
        )
        .unwrap();
        let snap = sim.snapshot();
        assert_eq!(snap.positions.as_ref().map(Vec::len), Some(6));
        assert_eq!(snap.line_totals(), (3, 3));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn population_is_conserved(
            count in 1i64..200,
            workers in 1usize..6,
            gamma in 0.0f64..2.0,
            bias in -1.0f64..1.0,
            step_policy in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let policy = if step_policy { PolicyKind::Step } else { PolicyKind::Probability };
            let p = SimParams::derive(
                &WalkInputs {
                    delta_t: 0.25,
                    total_time: 3.0,
                    diffusion: 0.5,
                    drift_bias: bias,
                    jump_rate: gamma,
                    particle_count: count,
                },
                policy,
            ).unwrap();
            let mut sim = Simulation::new(p, EngineOptions { seed, ..options(workers) }).unwrap();
            for _ in 0..12 {
                sim.step();
                let (top, bottom) = sim.store().line_counts();
                prop_assert_eq!(top + bottom, count as usize);
                prop_assert!(sim.store().particles().iter().all(|p| p.position.is_finite()));
            }
        }
    }
}
