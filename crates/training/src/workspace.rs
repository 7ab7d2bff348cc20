use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("artifact {0} already exists; pass overwrite to replace it")]
    ArtifactExists(PathBuf),
    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem layout of a single training run.
///
/// All artifacts share one directory and a run name:
/// `<name>.mpk` (model record), `<name>.json` (config),
/// `<name>_training.csv` and `<name>_samples.csv` (trajectories).
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    root: PathBuf,
    name: String,
}

impl RunWorkspace {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recorder base path; the file recorder appends its own extension.
    pub fn model_path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// The model record as it lands on disk.
    pub fn model_file(&self) -> PathBuf {
        self.root.join(format!("{}.mpk", self.name))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(format!("{}.json", self.name))
    }

    pub fn training_trajectory_path(&self) -> PathBuf {
        self.root.join(format!("{}_training.csv", self.name))
    }

    /// Fixed-latent decode at each logging epoch, one conformation per row.
    pub fn decode_trajectory_path(&self) -> PathBuf {
        self.root.join(format!("{}_decode_traj.csv", self.name))
    }

    pub fn sample_trajectory_path(&self) -> PathBuf {
        self.root.join(format!("{}_samples.csv", self.name))
    }

    /// Create the run directory and guard against clobbering a finished run.
    /// With `overwrite` set, stale artifacts from a previous run are removed
    /// up front so a failed run never leaves a mixed generation behind.
    pub fn prepare(&self, overwrite: bool) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.root)?;
        let model = self.model_file();
        if model.exists() && !overwrite {
            return Err(WorkspaceError::ArtifactExists(model));
        }
        for stale in [
            model,
            self.config_path(),
            self.training_trajectory_path(),
            self.decode_trajectory_path(),
            self.sample_trajectory_path(),
        ] {
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }
        Ok(())
    }
}
