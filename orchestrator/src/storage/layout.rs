//! Deployment directory layout

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Every path rollctl reads or writes inside the deployment directory
#[derive(Debug, Clone)]
pub struct DeploymentLayout {
    /// Base directory for the deployment
    pub base_dir: PathBuf,
}

impl DeploymentLayout {
    /// Create a new layout rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Live environment configuration
    pub fn env_file(&self) -> File {
        File::new(self.base_dir.join(".env"))
    }

    /// Optional template used when the env file is first created
    pub fn env_template_file(&self) -> File {
        File::new(self.base_dir.join(".env.example"))
    }

    /// Live service manifest
    pub fn manifest_file(&self) -> File {
        File::new(self.base_dir.join("docker-compose.yml"))
    }

    /// Settings file
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("rollctl.json"))
    }

    /// Persisted record of the last run
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Advisory lock file
    pub fn lock_file(&self) -> File {
        File::new(self.base_dir.join(".rollctl.lock"))
    }

    /// Snapshot root directory
    pub fn snapshots_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("snapshots"))
    }

    /// Log directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Create the directories rollctl writes into
    pub async fn setup(&self) -> Result<(), crate::errors::OrchestratorError> {
        Dir::new(&self.base_dir).create().await?;
        self.snapshots_dir().create().await?;
        Ok(())
    }
}

impl Default for DeploymentLayout {
    fn default() -> Self {
        let base_dir = std::env::var_os("ROLLCTL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/opt/rollctl"));

        Self::new(base_dir)
    }
}
