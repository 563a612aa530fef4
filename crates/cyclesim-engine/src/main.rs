//! Engine binary for cyclesim.
//!
//! Runs a commuter route-choice simulation under the iteration controller:
//! commuters pick among alternative routes, a share re-plans every
//! iteration, a parallel congestion mobsim computes travel times, and
//! executed trips are scored.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `cyclesim-config.yaml` (or the path given as
//!    the first argument)
//! 2. Initialize structured logging (tracing)
//! 3. Load and validate the `population` section
//! 4. Build the controller (prepares the output directory)
//! 5. Wire OS termination signals to the controller's interrupt
//! 6. Run the controller on the blocking pool
//! 7. Log the result; a computational error exits non-zero

mod error;
mod listeners;
mod mobsim;
mod population;
mod signals;
mod simulation;

use std::path::{Path, PathBuf};

use cyclesim_core::{Controller, SimulationConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::population::PopulationConfig;
use crate::simulation::CommuterSimulation;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG_FILE: &str = "cyclesim-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if any initialization step fails or the run is
/// aborted by a computational error.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
    let config = load_config(&config_path)?;

    // 2. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!(
        config = %config_path.display(),
        random_seed = config.global.random_seed,
        first_iteration = config.controller.first_iteration,
        last_iteration = config.controller.last_iteration,
        output = %config.controller.output_directory.display(),
        "cyclesim-engine starting"
    );

    // 3. Load the population.
    let population_config = load_population_config(&config_path)?;
    population_config.validate()?;
    info!(
        agents = population_config.agent_count,
        routes = population_config.routes.len(),
        replanning_share = population_config.replanning_share,
        mobsim_workers = population_config.mobsim_workers,
        "Population configuration loaded"
    );

    // 4. Build the controller.
    let mut controller = Controller::builder(config)
        .hooks(CommuterSimulation::new(population_config))
        .build()
        .map_err(EngineError::from)?;
    let coordinator = controller.coordinator();

    // 5. Interrupt on OS signals.
    let signal_task = tokio::spawn(signals::interrupt_on(
        signals::wait_for_shutdown_signal(),
        coordinator,
    ));

    // 6. Run.
    let outcome = tokio::task::spawn_blocking(move || controller.run())
        .await
        .map_err(|e| EngineError::Join {
            message: format!("{e}"),
        })?;
    signal_task.abort();

    // 7. Report.
    match outcome {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                reason = ?summary.reason,
                iterations = summary.iterations_completed,
                last_iteration = ?summary.last_iteration,
                "cyclesim-engine shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "cyclesim-engine run failed");
            Err(EngineError::from(e).into())
        }
    }
}

/// Load the main configuration.
///
/// A missing file yields the defaults; `CYCLESIM_OUTPUT_DIR` applies either
/// way.
fn load_config(path: &Path) -> Result<SimulationConfig, EngineError> {
    if path.exists() {
        Ok(SimulationConfig::from_file(path)?)
    } else {
        let mut config = SimulationConfig::default();
        config.apply_overrides_from(|key| std::env::var(key).ok());
        Ok(config)
    }
}

/// Load the population configuration.
///
/// Reads the `population` section from the YAML config file. If the file
/// does not exist or lacks the `population` key, defaults are used.
fn load_population_config(path: &Path) -> Result<PopulationConfig, EngineError> {
    if !path.exists() {
        return Ok(PopulationConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| EngineError::Population {
        message: format!("failed to read config file: {e}"),
    })?;

    // Parse the full YAML and extract just the "population" section.
    let raw: serde_yml::Value =
        serde_yml::from_str(&contents).map_err(|e| EngineError::Population {
            message: format!("failed to parse config YAML: {e}"),
        })?;

    raw.get("population").map_or_else(
        || Ok(PopulationConfig::default()),
        |section| {
            serde_yml::from_value(section.clone()).map_err(|e| EngineError::Population {
                message: format!("failed to parse population config: {e}"),
            })
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_config(label: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "cyclesim_engine_config_{label}_{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = Path::new("/definitely/not/here/cyclesim-config.yaml");
        assert_eq!(load_population_config(path).unwrap(), PopulationConfig::default());
        assert_eq!(load_config(path).unwrap().global.random_seed, 4711);
    }

    #[test]
    fn population_section_is_extracted() {
        let path = write_config(
            "population",
            "global:\n  random_seed: 9\npopulation:\n  agent_count: 42\n  replanning_share: 0.25\n",
        );
        let population = load_population_config(&path).unwrap();
        assert_eq!(population.agent_count, 42);
        assert!((population.replanning_share - 0.25).abs() < f64::EPSILON);
        assert_eq!(load_config(&path).unwrap().global.random_seed, 9);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn file_without_population_section_uses_defaults() {
        let path = write_config("no_population", "controller:\n  last_iteration: 3\n");
        assert_eq!(load_population_config(&path).unwrap(), PopulationConfig::default());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn malformed_population_section_is_rejected() {
        let path = write_config("bad_population", "population:\n  agent_count: many\n");
        assert!(matches!(
            load_population_config(&path),
            Err(EngineError::Population { .. })
        ));
        std::fs::remove_file(&path).ok();
    }
}
