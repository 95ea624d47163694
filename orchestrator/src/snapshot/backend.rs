//! Persistence backends: how application data gets in and out of a snapshot

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::deploy::runtime::ContainerRuntime;
use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::manifest::model::{ManifestTemplate, TopologyKind, APP_SERVICE, DB_SERVICE};

/// Artifact name used by the logical dump backend
pub const DUMP_ARTIFACT: &str = "dump.sql";

pub const FILE_BACKEND: &str = "file";
pub const LOGICAL_DUMP_BACKEND: &str = "logical-dump";

/// Backend-specific export and import of persisted data
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// File name of the data artifact inside a snapshot directory
    fn artifact_name(&self) -> &str;

    /// Write the live data to `dest`
    async fn export(&self, runtime: &dyn ContainerRuntime, dest: &Path) -> Result<(), OrchestratorError>;

    /// Load `src` back into the running service group
    async fn import(&self, runtime: &dyn ContainerRuntime, src: &Path) -> Result<(), OrchestratorError>;
}

/// Data lives in a single file inside the app container
#[derive(Debug, Clone)]
pub struct FileArtifactBackend {
    pub service: String,
    pub container_path: String,
    pub artifact: String,
}

#[async_trait]
impl PersistenceBackend for FileArtifactBackend {
    fn name(&self) -> &str {
        FILE_BACKEND
    }

    fn artifact_name(&self) -> &str {
        &self.artifact
    }

    async fn export(&self, runtime: &dyn ContainerRuntime, dest: &Path) -> Result<(), OrchestratorError> {
        debug!("Copying {}:{} out", self.service, self.container_path);
        runtime.copy_from(&self.service, &self.container_path, dest).await
    }

    async fn import(&self, runtime: &dyn ContainerRuntime, src: &Path) -> Result<(), OrchestratorError> {
        debug!("Copying data back into {}:{}", self.service, self.container_path);
        runtime.copy_to(&self.service, src, &self.container_path).await
    }
}

/// Data lives in a relational database, captured as a logical dump
#[derive(Debug, Clone)]
pub struct LogicalDumpBackend {
    pub service: String,
    pub user: String,
    pub database: String,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
}

impl LogicalDumpBackend {
    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_ready(&self, runtime: &dyn ContainerRuntime) -> Result<(), OrchestratorError> {
        let probe = Self::args(&["pg_isready", "-U", &self.user, "-d", &self.database]);
        for attempt in 1..=self.ready_attempts.max(1) {
            match runtime.exec(&self.service, &probe).await {
                Ok(output) if output.success => return Ok(()),
                _ => debug!("Database not ready (attempt {})", attempt),
            }
            if attempt < self.ready_attempts {
                tokio::time::sleep(self.ready_interval).await;
            }
        }
        Err(OrchestratorError::Runtime(format!(
            "{} did not become ready",
            self.service
        )))
    }
}

#[async_trait]
impl PersistenceBackend for LogicalDumpBackend {
    fn name(&self) -> &str {
        LOGICAL_DUMP_BACKEND
    }

    fn artifact_name(&self) -> &str {
        DUMP_ARTIFACT
    }

    async fn export(&self, runtime: &dyn ContainerRuntime, dest: &Path) -> Result<(), OrchestratorError> {
        let command = Self::args(&[
            "pg_dump",
            "-U",
            &self.user,
            "--clean",
            "--if-exists",
            &self.database,
        ]);
        let output = runtime.exec(&self.service, &command).await?;
        if !output.success {
            return Err(OrchestratorError::Runtime(format!(
                "pg_dump failed: {}",
                output.stderr
            )));
        }
        File::new(dest).write_atomic(&output.stdout).await
    }

    async fn import(&self, runtime: &dyn ContainerRuntime, src: &Path) -> Result<(), OrchestratorError> {
        self.wait_ready(runtime).await?;

        let dump = tokio::fs::read(src).await?;
        let command = Self::args(&[
            "psql",
            "-U",
            &self.user,
            "-d",
            &self.database,
            "-v",
            "ON_ERROR_STOP=1",
        ]);
        let output = runtime.exec_with_input(&self.service, &command, &dump).await?;
        if !output.success {
            return Err(OrchestratorError::Runtime(format!(
                "psql restore failed: {}",
                output.stderr
            )));
        }
        Ok(())
    }
}

/// Backend matching a topology
pub fn backend_for(topology: TopologyKind, template: &ManifestTemplate) -> Box<dyn PersistenceBackend> {
    match topology {
        TopologyKind::Bind | TopologyKind::Volume => Box::new(FileArtifactBackend {
            service: APP_SERVICE.to_string(),
            container_path: template.data_file_container_path(),
            artifact: template.data_file.clone(),
        }),
        TopologyKind::Relational => Box::new(LogicalDumpBackend {
            service: DB_SERVICE.to_string(),
            user: template.db_user.clone(),
            database: template.db_name.clone(),
            ready_attempts: 10,
            ready_interval: Duration::from_secs(2),
        }),
    }
}
