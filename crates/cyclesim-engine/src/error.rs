//! Error types for the engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps all possible
//! failure modes during engine startup and the simulation run.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: cyclesim_core::config::ConfigError,
    },

    /// The population section is missing pieces or out of range.
    #[error("population error: {message}")]
    Population {
        /// Description of the population problem.
        message: String,
    },

    /// The controller could not be assembled.
    #[error("controller error: {source}")]
    Build {
        /// The underlying build error.
        #[from]
        source: cyclesim_core::controller::BuildError,
    },

    /// The simulation run was aborted by a computational error.
    #[error("run error: {source}")]
    Run {
        /// The underlying run error.
        #[from]
        source: cyclesim_core::RunError,
    },

    /// The blocking controller task could not be joined.
    #[error("controller task failed: {message}")]
    Join {
        /// Description of the join failure.
        message: String,
    },
}
