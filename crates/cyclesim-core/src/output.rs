//! Output directory hierarchy for one run.
//!
//! ```text
//! <output_directory>/
//!   <run_id>.output_config.yaml
//!   <run_id>.stopwatch.txt
//!   <run_id>.stopwatch.svg
//!   ITERS/
//!     it.0/<run_id>.0.<name>
//!     it.1/...
//! ```
//!
//! The `<run_id>.` prefix is omitted when no run id is configured.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use cyclesim_types::IterationIndex;

use crate::config::{ControllerConfig, OverwritePolicy};

/// Name of the directory that holds per-iteration directories.
pub const ITERATIONS_DIR: &str = "ITERS";

/// Errors that can occur while preparing or using the output directory.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// The directory exists, is not empty, and the policy forbids reuse.
    #[error("output directory {path} already exists and is not empty (overwrite policy: fail_if_directory_exists)")]
    DirectoryExists {
        /// The offending directory.
        path: String,
    },

    /// A filesystem operation failed.
    #[error("output directory operation on {path} failed: {source}")]
    Io {
        /// The path involved.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl OutputError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Paths of one run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDirectory {
    root: PathBuf,
    run_id: Option<String>,
}

impl OutputDirectory {
    /// Create (or reuse) the output directory according to the configured
    /// [`OverwritePolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::DirectoryExists`] when the policy forbids
    /// reusing a non-empty directory, or [`OutputError::Io`] when the
    /// directory cannot be created or cleared.
    pub fn prepare(config: &ControllerConfig) -> Result<Self, OutputError> {
        let root = config.output_directory.clone();
        if root.exists() {
            match config.overwrite_files {
                OverwritePolicy::FailIfDirectoryExists => {
                    let mut entries =
                        std::fs::read_dir(&root).map_err(|e| OutputError::io(&root, e))?;
                    if entries.next().is_some() {
                        return Err(OutputError::DirectoryExists {
                            path: root.display().to_string(),
                        });
                    }
                }
                OverwritePolicy::OverwriteExistingFiles => {
                    warn!(
                        path = %root.display(),
                        "output directory exists; existing files will be overwritten"
                    );
                }
                OverwritePolicy::DeleteDirectoryIfExists => {
                    info!(path = %root.display(), "deleting existing output directory");
                    std::fs::remove_dir_all(&root).map_err(|e| OutputError::io(&root, e))?;
                }
            }
        }
        std::fs::create_dir_all(&root).map_err(|e| OutputError::io(&root, e))?;
        info!(path = %root.display(), "output directory ready");
        Ok(Self {
            root,
            run_id: config.run_id.clone(),
        })
    }

    /// The run's output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The configured run id, if any.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Path of a run-level output file.
    pub fn output_filename(&self, name: &str) -> PathBuf {
        self.root.join(self.prefixed(name))
    }

    /// Directory of `iteration`.
    pub fn iteration_dir(&self, iteration: IterationIndex) -> PathBuf {
        self.root
            .join(ITERATIONS_DIR)
            .join(format!("it.{iteration}"))
    }

    /// Path of a file inside the directory of `iteration`.
    pub fn iteration_filename(&self, iteration: IterationIndex, name: &str) -> PathBuf {
        self.iteration_dir(iteration)
            .join(self.prefixed(&format!("{iteration}.{name}")))
    }

    /// Create the directory of `iteration`, clearing a stale one left by a
    /// previous run.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Io`] if the directory cannot be created.
    pub fn create_iteration_directory(
        &self,
        iteration: IterationIndex,
    ) -> Result<PathBuf, OutputError> {
        let dir = self.iteration_dir(iteration);
        if dir.exists() {
            warn!(path = %dir.display(), "iteration directory exists; removing it");
            std::fs::remove_dir_all(&dir).map_err(|e| OutputError::io(&dir, e))?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| OutputError::io(&dir, e))?;
        Ok(dir)
    }

    fn prefixed(&self, name: &str) -> String {
        match &self.run_id {
            Some(run_id) => format!("{run_id}.{name}"),
            None => name.to_owned(),
        }
    }
}
