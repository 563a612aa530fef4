//! Configuration loading and typed config structures for cyclesim.
//!
//! The canonical configuration lives in `cyclesim-config.yaml`. The core
//! only reads the sections defined here; collaborators are free to keep
//! their own sections in the same file and extract them from the raw YAML
//! document.
//!
//! The controller validates the configuration exactly once, right after
//! the `Startup` event, via [`SimulationConfig::check_consistency`], and
//! logs the full dump produced by [`SimulationConfig::to_yaml`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use cyclesim_types::IterationIndex;

/// Environment variable that overrides `controller.output_directory`.
pub const OUTPUT_DIR_ENV: &str = "CYCLESIM_OUTPUT_DIR";

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse or render YAML content.
    #[error("failed to process config YAML: {source}")]
    Yaml {
        /// The underlying YAML error.
        source: serde_yml::Error,
    },

    /// The configuration parsed but is not usable.
    #[error("inconsistent configuration: {reason}")]
    Inconsistent {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration consumed by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Process-wide settings (random seed).
    #[serde(default)]
    pub global: GlobalConfig,

    /// Iteration bounds and output settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SimulationConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `CYCLESIM_OUTPUT_DIR` overrides `controller.output_directory` when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_overrides_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        Ok(config)
    }

    /// Apply environment-style overrides looked up through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(OUTPUT_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.controller.output_directory = PathBuf::from(dir);
        }
    }

    /// Render the full configuration as YAML for the config dump.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yml::to_string(self)?)
    }

    /// Check that the configuration can drive a run.
    ///
    /// Hard errors are returned; questionable but usable settings are
    /// logged as warnings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Inconsistent`] if the iteration bounds are
    /// reversed or the output directory is empty.
    pub fn check_consistency(&self) -> Result<(), ConfigError> {
        let ctl = &self.controller;
        if ctl.last_iteration < ctl.first_iteration {
            return Err(ConfigError::Inconsistent {
                reason: format!(
                    "last_iteration ({}) is smaller than first_iteration ({})",
                    ctl.last_iteration, ctl.first_iteration
                ),
            });
        }
        if ctl.output_directory.as_os_str().is_empty() {
            return Err(ConfigError::Inconsistent {
                reason: "output_directory must not be empty".to_owned(),
            });
        }
        if let Some(run_id) = &ctl.run_id {
            if run_id.contains(['/', '\\']) {
                return Err(ConfigError::Inconsistent {
                    reason: format!("run_id must not contain path separators: {run_id}"),
                });
            }
        }
        if self.global.random_seed == 0 {
            warn!("global.random_seed is 0; runs are reproducible but share the seed of unseeded setups");
        }
        if !ctl.write_iteration_directories && ctl.create_graphs {
            warn!("create_graphs is set while iteration directories are disabled; only the run-level chart is written");
        }
        Ok(())
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Base seed; iteration `n` is seeded with `random_seed + n`.
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            random_seed: default_random_seed(),
        }
    }
}

/// What to do when the output directory already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Refuse to start if the directory exists and is not empty.
    #[default]
    FailIfDirectoryExists,
    /// Keep the directory and overwrite files as they are written.
    OverwriteExistingFiles,
    /// Remove the directory and its contents before the run.
    DeleteDirectoryIfExists,
}

/// Iteration bounds and output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Index of the first iteration.
    #[serde(default)]
    pub first_iteration: IterationIndex,

    /// Index of the last iteration (inclusive) for the default stopping
    /// criterion.
    #[serde(default = "default_last_iteration")]
    pub last_iteration: IterationIndex,

    /// Directory that receives all run output.
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// Optional prefix for output file names.
    #[serde(default)]
    pub run_id: Option<String>,

    /// Whether the stopwatch chart is written next to the text report.
    #[serde(default = "default_true")]
    pub create_graphs: bool,

    /// Behaviour when the output directory already exists.
    #[serde(default)]
    pub overwrite_files: OverwritePolicy,

    /// Whether `ITERS/it.<n>` directories are created for each iteration.
    #[serde(default = "default_true")]
    pub write_iteration_directories: bool,

    /// Whether a process-wide panic hook captures panics from any thread
    /// while the controller runs.
    #[serde(default = "default_true")]
    pub capture_panics: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            first_iteration: 0,
            last_iteration: default_last_iteration(),
            output_directory: default_output_directory(),
            run_id: None,
            create_graphs: true,
            overwrite_files: OverwritePolicy::default(),
            write_iteration_directories: true,
            capture_panics: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) used when `RUST_LOG`
    /// is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

const fn default_random_seed() -> u64 {
    4711
}

const fn default_last_iteration() -> IterationIndex {
    10
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./output")
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = SimulationConfig::default();
        assert_eq!(config.global.random_seed, 4711);
        assert_eq!(config.controller.first_iteration, 0);
        assert_eq!(config.controller.last_iteration, 10);
        assert_eq!(
            config.controller.overwrite_files,
            OverwritePolicy::FailIfDirectoryExists
        );
        assert!(config.check_consistency().is_ok());
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
global:
  random_seed: 100

controller:
  first_iteration: 5
  last_iteration: 9
  output_directory: "/tmp/cyclesim-run"
  run_id: "base"
  create_graphs: false
  overwrite_files: delete_directory_if_exists
  write_iteration_directories: false
  capture_panics: false

logging:
  level: "debug"
"#;
        let config = SimulationConfig::parse(yaml).unwrap();
        assert_eq!(config.global.random_seed, 100);
        assert_eq!(config.controller.first_iteration, 5);
        assert_eq!(config.controller.last_iteration, 9);
        assert_eq!(
            config.controller.output_directory,
            PathBuf::from("/tmp/cyclesim-run")
        );
        assert_eq!(config.controller.run_id.as_deref(), Some("base"));
        assert!(!config.controller.create_graphs);
        assert_eq!(
            config.controller.overwrite_files,
            OverwritePolicy::DeleteDirectoryIfExists
        );
        assert!(!config.controller.capture_panics);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn parse_minimal_yaml() {
        let config = SimulationConfig::parse("global:\n  random_seed: 7\n").unwrap();
        assert_eq!(config.global.random_seed, 7);
        assert_eq!(config.controller, ControllerConfig::default());
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let yaml = "population:\n  agents: 50\ncontroller:\n  last_iteration: 2\n";
        let config = SimulationConfig::parse(yaml).unwrap();
        assert_eq!(config.controller.last_iteration, 2);
    }

    #[test]
    fn reversed_bounds_are_inconsistent() {
        let mut config = SimulationConfig::default();
        config.controller.first_iteration = 4;
        config.controller.last_iteration = 3;
        let err = config.check_consistency().unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent { .. }));
        assert!(err.to_string().contains("last_iteration (3)"));
    }

    #[test]
    fn single_iteration_is_consistent() {
        let mut config = SimulationConfig::default();
        config.controller.first_iteration = 3;
        config.controller.last_iteration = 3;
        assert!(config.check_consistency().is_ok());
    }

    #[test]
    fn empty_output_directory_is_inconsistent() {
        let mut config = SimulationConfig::default();
        config.controller.output_directory = PathBuf::new();
        assert!(config.check_consistency().is_err());
    }

    #[test]
    fn run_id_with_separator_is_inconsistent() {
        let mut config = SimulationConfig::default();
        config.controller.run_id = Some("a/b".to_owned());
        assert!(config.check_consistency().is_err());
    }

    #[test]
    fn output_directory_override() {
        let mut config = SimulationConfig::default();
        config.apply_overrides_from(|key| {
            (key == OUTPUT_DIR_ENV).then(|| "/srv/runs/42".to_owned())
        });
        assert_eq!(
            config.controller.output_directory,
            PathBuf::from("/srv/runs/42")
        );
    }

    #[test]
    fn blank_override_is_ignored() {
        let mut config = SimulationConfig::default();
        config.apply_overrides_from(|_| Some("  ".to_owned()));
        assert_eq!(config.controller.output_directory, PathBuf::from("./output"));
    }

    #[test]
    fn yaml_dump_round_trips() {
        let mut config = SimulationConfig::default();
        config.controller.run_id = Some("dump".to_owned());
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("random_seed: 4711"));
        assert_eq!(SimulationConfig::parse(&yaml).unwrap(), config);
    }
}
