//! Simulator binary for the Somnus rest-cycle coordinator.
//!
//! Drives the coordinator and the built-in extensions against an in-memory
//! host whose participants rest, wake, wander off and come back at random,
//! logging every message the coordinator delivers.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `somnus-config.yaml`
//! 2. Initialize structured logging (tracing) at the configured level
//! 3. Populate the simulated partitions
//! 4. Create the coordinator and register the built-in extensions
//! 5. Load every partition
//! 6. Run the step loop
//! 7. Log the result

mod error;
mod population;
mod runner;
mod world;

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use somnus_core::config::SomnusConfig;
use somnus_core::coordinator::Coordinator;
use somnus_core::memory::InMemoryHost;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::SimError;
use crate::population::{NamePool, SimulationConfig};
use crate::runner::Bounds;
use crate::world::Simulation;

const CONFIG_PATH: &str = "somnus-config.yaml";

/// Application entry point for the simulator.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or is invalid.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load configuration. Logging is not up yet, so a missing file is
    //    reported once the subscriber exists.
    let found = Path::new(CONFIG_PATH).exists();
    let config = load_config().context("loading somnus-config.yaml")?;
    let sim_config = load_simulation_config().context("loading simulation section")?;

    // 2. Initialize structured logging, RUST_LOG first, then the config level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!("somnus-sim starting");
    if !found {
        info!("Config file not found, using defaults");
    }
    sim_config.validate()?;
    info!(
        partitions = sim_config.partitions.len(),
        participants_per_partition = sim_config.participants_per_partition,
        excluded = config.global.excluded_partitions.len(),
        default_exempt = ?config.global.default_exempt_partition,
        "Configuration loaded"
    );

    // 3. Populate the simulated partitions.
    let mut rng = sim_config
        .seed
        .map_or_else(|| StdRng::from_rng(&mut rand::rng()), StdRng::seed_from_u64);
    let mut host = InMemoryHost::new();
    let mut names = NamePool::default();
    let partitions = population::populate(&sim_config, &mut host, &mut names, &mut rng);

    // 4. Create the coordinator and register the built-in extensions.
    let now = Utc::now();
    let mut coordinator = Coordinator::new(config);
    let registrations = somnus_extensions::register_builtin(&mut coordinator, &mut host, now);
    info!(registrations = registrations.len(), "Built-in extensions registered");

    // 5. Load every partition.
    let bounds = Bounds {
        interval: Duration::from_millis(sim_config.step_interval_ms),
        max_steps: sim_config.max_steps,
        max_real_time_seconds: sim_config.max_real_time_seconds,
    };
    let mut sim = Simulation::new(host, coordinator, sim_config, partitions, names, rng);
    sim.load_all(now);

    // 6. Run the step loop.
    let result = runner::run(&mut sim, bounds).await;

    // 7. Log the result.
    runner::log_end(&result);
    info!("somnus-sim shutdown complete");
    Ok(())
}

/// Load the coordinator configuration, falling back to defaults when the
/// file does not exist.
fn load_config() -> Result<SomnusConfig, SimError> {
    let path = Path::new(CONFIG_PATH);
    if path.exists() {
        Ok(SomnusConfig::from_file(path)?)
    } else {
        Ok(SomnusConfig::default())
    }
}

/// Load the `simulation` section of the same file.
fn load_simulation_config() -> Result<SimulationConfig, SimError> {
    let path = Path::new(CONFIG_PATH);
    if !path.exists() {
        return Ok(SimulationConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| SimError::Simulation {
        message: format!("failed to read config file: {e}"),
    })?;
    let raw: serde_yml::Value =
        serde_yml::from_str(&contents).map_err(|e| SimError::Simulation {
            message: format!("failed to parse config YAML: {e}"),
        })?;
    raw.get("simulation").map_or_else(
        || Ok(SimulationConfig::default()),
        |section| {
            serde_yml::from_value(section.clone()).map_err(|e| SimError::Simulation {
                message: format!("failed to parse simulation config: {e}"),
            })
        },
    )
}
