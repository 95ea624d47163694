//! Restore the last known-good snapshot

use tracing::{debug, info};

use crate::deploy::release::{self, await_ports_released};
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::{OrchestratorError, Warnings};
use crate::filesys::file::File;
use crate::manifest::model::{ManifestTemplate, ServiceManifest, TopologyKind};
use crate::snapshot::backend::{backend_for, PersistenceBackend, DUMP_ARTIFACT, LOGICAL_DUMP_BACKEND};
use crate::snapshot::store::{SnapshotId, SnapshotStore};

pub struct RollbackController<'a> {
    runtime: &'a dyn ContainerRuntime,
    store: &'a SnapshotStore,
    template: &'a ManifestTemplate,
    release: &'a release::Options,
    manifest: File,
    config: File,
}

impl<'a> RollbackController<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        store: &'a SnapshotStore,
        template: &'a ManifestTemplate,
        release: &'a release::Options,
        manifest: File,
        config: File,
    ) -> Self {
        Self {
            runtime,
            store,
            template,
            release,
            manifest,
            config,
        }
    }

    /// Stop the group and restore the newest snapshot, which restarts it
    /// once the host ports are free again. Health is not checked afterwards.
    pub async fn rollback(&self, warnings: &mut Warnings) -> Result<SnapshotId, OrchestratorError> {
        let id = self.store.latest().await?.ok_or(OrchestratorError::NoSnapshot)?;
        let backend = self.backend_for_snapshot(&id).await;

        let saved_manifest = self.store.dir(&id).file(&self.manifest.name());
        let mut ports = published_ports(&self.manifest).await;
        ports.extend(published_ports(&saved_manifest).await);
        ports.sort_unstable();
        ports.dedup();

        info!("Rolling back to snapshot {}...", id);
        self.runtime.stop_group().await?;
        await_ports_released(&ports, self.release).await?;
        self.store
            .restore(
                &id,
                self.runtime,
                &self.manifest,
                &self.config,
                backend.as_ref(),
                warnings,
            )
            .await?;

        info!("Rolled back to snapshot {}", id);
        Ok(id)
    }

    /// The backend that wrote the snapshot, which may differ from the
    /// topology being deployed
    async fn backend_for_snapshot(&self, id: &SnapshotId) -> Box<dyn PersistenceBackend> {
        let relational = match self.store.metadata(id).await {
            Ok(metadata) => metadata.backend == LOGICAL_DUMP_BACKEND,
            Err(e) => {
                debug!("No metadata for snapshot {}: {}", id, e);
                self.store.dir(id).file(DUMP_ARTIFACT).exists().await
            }
        };
        let topology = if relational {
            TopologyKind::Relational
        } else {
            TopologyKind::Bind
        };
        backend_for(topology, self.template)
    }
}

/// Host ports a manifest file publishes; none if it is missing or unreadable
async fn published_ports(file: &File) -> Vec<u16> {
    match file.read_optional().await {
        Ok(Some(bytes)) => match ServiceManifest::from_yaml(&String::from_utf8_lossy(&bytes)) {
            Ok(manifest) => manifest.published_ports(),
            Err(e) => {
                debug!("Cannot parse {}: {}", file.path().display(), e);
                Vec::new()
            }
        },
        Ok(None) => Vec::new(),
        Err(e) => {
            debug!("Cannot read {}: {}", file.path().display(), e);
            Vec::new()
        }
    }
}
