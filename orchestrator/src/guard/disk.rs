//! Free disk space guard
//!
//! Measures free space on the runtime's storage root and, when it is below
//! the threshold, runs every reclamation step in order before measuring
//! again. Individual steps are best effort; only the final measurement
//! decides the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sysinfo::Disks;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::runtime::ContainerRuntime;
use crate::errors::{OrchestratorError, Warnings};
use crate::snapshot::store::SnapshotStore;

const MB: u64 = 1024 * 1024;

/// Reports free space for a path
pub trait DiskProbe: Send + Sync {
    fn free_mb(&self, root: &Path) -> Result<u64, OrchestratorError>;
}

/// [`DiskProbe`] backed by the mounted filesystems `sysinfo` reports
#[derive(Debug, Default)]
pub struct SysinfoDiskProbe;

impl DiskProbe for SysinfoDiskProbe {
    fn free_mb(&self, root: &Path) -> Result<u64, OrchestratorError> {
        let root = nearest_existing(root).canonicalize()?;
        let disks = Disks::new_with_refreshed_list();

        disks
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space() / MB)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("no mounted filesystem holds {}", root.display()))
            })
    }
}

fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// One best-effort way of freeing space
#[async_trait]
pub trait ReclaimStep: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), OrchestratorError>;
}

/// Unused images, build cache and dangling volumes
pub struct PruneRuntimeStep {
    pub runtime: Arc<dyn ContainerRuntime>,
}

#[async_trait]
impl ReclaimStep for PruneRuntimeStep {
    fn name(&self) -> &str {
        "prune runtime artifacts"
    }

    async fn run(&self) -> Result<(), OrchestratorError> {
        self.runtime.prune().await
    }
}

/// Truncate container json logs above `max_bytes`
pub struct TruncateLogsStep {
    pub containers_dir: PathBuf,
    pub max_bytes: u64,
}

#[async_trait]
impl ReclaimStep for TruncateLogsStep {
    fn name(&self) -> &str {
        "truncate container logs"
    }

    async fn run(&self) -> Result<(), OrchestratorError> {
        let mut containers = tokio::fs::read_dir(&self.containers_dir).await?;
        while let Some(container) = containers.next_entry().await? {
            if !container.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(container.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                if !name.to_string_lossy().ends_with("-json.log") {
                    continue;
                }
                let len = file.metadata().await?.len();
                if len > self.max_bytes {
                    debug!("Truncating {} ({} bytes)", file.path().display(), len);
                    let log = tokio::fs::OpenOptions::new().write(true).open(file.path()).await?;
                    log.set_len(0).await?;
                }
            }
        }
        Ok(())
    }
}

/// Run a host maintenance command
pub struct HostCommandStep {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommandStep {
    pub fn journal_vacuum(size: &str) -> Self {
        Self {
            label: "vacuum system journal".to_string(),
            program: "journalctl".to_string(),
            args: vec![format!("--vacuum-size={}", size)],
        }
    }

    pub fn package_cache_clean() -> Self {
        Self {
            label: "clear package cache".to_string(),
            program: "apt-get".to_string(),
            args: vec!["clean".to_string()],
        }
    }
}

#[async_trait]
impl ReclaimStep for HostCommandStep {
    fn name(&self) -> &str {
        &self.label
    }

    async fn run(&self) -> Result<(), OrchestratorError> {
        let output = Command::new(&self.program).args(&self.args).output().await?;
        if !output.status.success() {
            return Err(OrchestratorError::Runtime(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }
        Ok(())
    }
}

/// Delete snapshots beyond the newest `keep`
pub struct PruneSnapshotsStep {
    pub store: SnapshotStore,
    pub keep: usize,
}

#[async_trait]
impl ReclaimStep for PruneSnapshotsStep {
    fn name(&self) -> &str {
        "prune old snapshots"
    }

    async fn run(&self) -> Result<(), OrchestratorError> {
        self.store.prune(self.keep).await?;
        Ok(())
    }
}

/// Guard options
#[derive(Debug, Clone)]
pub struct Options {
    /// Storage root of the container runtime
    pub root: PathBuf,

    /// Minimum free space in MB
    pub threshold_mb: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/docker"),
            threshold_mb: 2048,
        }
    }
}

/// Refuses to let a rollout start on a nearly full disk
pub struct DiskGuard {
    probe: Box<dyn DiskProbe>,
    steps: Vec<Box<dyn ReclaimStep>>,
}

impl DiskGuard {
    pub fn new(probe: Box<dyn DiskProbe>, steps: Vec<Box<dyn ReclaimStep>>) -> Self {
        Self { probe, steps }
    }

    /// Succeed only if free space on `root` is at least `threshold_mb`,
    /// reclaiming space first when needed. Step failures become warnings.
    pub async fn ensure_free_space(
        &self,
        root: &Path,
        threshold_mb: u64,
        warnings: &mut Warnings,
    ) -> Result<u64, OrchestratorError> {
        let free_mb = self.probe.free_mb(root)?;
        if free_mb >= threshold_mb {
            debug!("{} MB free on {} (threshold {} MB)", free_mb, root.display(), threshold_mb);
            return Ok(free_mb);
        }

        info!(
            "Only {} MB free on {} (threshold {} MB), reclaiming space...",
            free_mb,
            root.display(),
            threshold_mb
        );

        for step in &self.steps {
            debug!("Reclaim step: {}", step.name());
            if let Err(e) = step.run().await {
                warnings.push("disk", format!("{} failed: {}", step.name(), e));
            }
        }

        let free_mb = self.probe.free_mb(root)?;
        if free_mb < threshold_mb {
            return Err(OrchestratorError::Disk {
                free_mb,
                threshold_mb,
            });
        }

        info!("Reclaimed space, {} MB free", free_mb);
        Ok(free_mb)
    }
}
