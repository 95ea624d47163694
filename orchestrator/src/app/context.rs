//! Collaborators shared by every stage of a run

use std::sync::Arc;

use tracing::debug;

use crate::app::options::DeployOptions;
use crate::config::reconciler::ConfigReconciler;
use crate::deploy::compose::DockerCompose;
use crate::deploy::health::{HttpProbe, ReadinessProbe};
use crate::deploy::rollback::RollbackController;
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::OrchestratorError;
use crate::guard::disk::{
    DiskGuard, DiskProbe, HostCommandStep, PruneRuntimeStep, PruneSnapshotsStep, ReclaimStep,
    SysinfoDiskProbe, TruncateLogsStep,
};
use crate::manifest::generator::ManifestGenerator;
use crate::manifest::model::{ServiceManifest, TopologyKind};
use crate::snapshot::backend::{backend_for, PersistenceBackend};
use crate::snapshot::store::SnapshotStore;

/// Explicit context threaded through a run
pub struct DeploymentContext {
    pub options: DeployOptions,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: SnapshotStore,
    pub disk_guard: DiskGuard,
    pub probe: Box<dyn ReadinessProbe>,
}

impl DeploymentContext {
    pub fn new(
        options: DeployOptions,
        runtime: Arc<dyn ContainerRuntime>,
        disk_guard: DiskGuard,
        probe: Box<dyn ReadinessProbe>,
    ) -> Self {
        let store = SnapshotStore::new(options.layout.snapshots_dir());
        Self {
            options,
            runtime,
            store,
            disk_guard,
            probe,
        }
    }

    /// Wire the production collaborators: compose CLI, sysinfo disk probe,
    /// the full reclamation sequence and the HTTP readiness probe.
    pub async fn from_options(options: DeployOptions) -> Result<Self, OrchestratorError> {
        let layout = &options.layout;
        let runtime: Arc<dyn ContainerRuntime> = if options.compose_command.is_empty() {
            Arc::new(DockerCompose::detect(&layout.base_dir, layout.manifest_file().path()).await)
        } else {
            Arc::new(DockerCompose::new(
                options.compose_command.clone(),
                &layout.base_dir,
                layout.manifest_file().path(),
            ))
        };

        let store = SnapshotStore::new(layout.snapshots_dir());
        let steps: Vec<Box<dyn ReclaimStep>> = vec![
            Box::new(PruneRuntimeStep {
                runtime: runtime.clone(),
            }),
            Box::new(TruncateLogsStep {
                containers_dir: options.disk.containers_dir.clone(),
                max_bytes: options.disk.max_container_log_bytes,
            }),
            Box::new(HostCommandStep::journal_vacuum(&options.disk.journal_vacuum_size)),
            Box::new(HostCommandStep::package_cache_clean()),
            Box::new(PruneSnapshotsStep {
                store,
                keep: options.disk.snapshot_retention,
            }),
        ];
        let probe: Box<dyn DiskProbe> = Box::new(SysinfoDiskProbe);
        let disk_guard = DiskGuard::new(probe, steps);

        let readiness = HttpProbe::for_template(&options.template, options.health.request_timeout)?;
        debug!("Readiness endpoints: {:?}", readiness.endpoints());

        Ok(Self::new(options, runtime, disk_guard, Box::new(readiness)))
    }

    pub fn reconciler(&self) -> ConfigReconciler {
        let layout = &self.options.layout;
        ConfigReconciler::new(layout.env_file(), Some(layout.env_template_file()))
    }

    pub fn generator(&self) -> ManifestGenerator {
        ManifestGenerator::new(self.options.template.clone())
    }

    /// The manifest currently on disk, if it parses
    pub async fn live_manifest(&self) -> Result<Option<ServiceManifest>, OrchestratorError> {
        let file = self.options.layout.manifest_file();
        match file.read_optional().await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                Ok(Some(ServiceManifest::from_yaml(&text)?))
            }
            None => Ok(None),
        }
    }

    /// Topology of the live manifest, or the requested one when nothing is live
    pub async fn live_topology(&self) -> Result<TopologyKind, OrchestratorError> {
        Ok(self
            .live_manifest()
            .await?
            .and_then(|m| m.topology(&self.options.template))
            .unwrap_or(self.options.topology))
    }

    pub fn backend(&self, topology: TopologyKind) -> Box<dyn PersistenceBackend> {
        backend_for(topology, &self.options.template)
    }

    pub fn rollback_controller(&self) -> RollbackController<'_> {
        let layout = &self.options.layout;
        RollbackController::new(
            self.runtime.as_ref(),
            &self.store,
            &self.options.template,
            &self.options.release,
            layout.manifest_file(),
            layout.env_file(),
        )
    }
}
