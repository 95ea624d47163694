//! Timestamped snapshots of manifest, config and data

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::deploy::runtime::ContainerRuntime;
use crate::errors::{OrchestratorError, Warnings};
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::manifest::model::ServiceManifest;
use crate::snapshot::backend::PersistenceBackend;
use crate::utils::sha256_hash;

const ID_FORMAT: &str = "%Y%m%d_%H%M%S";
const PARTIAL_SUFFIX: &str = ".partial";
const METADATA_FILE: &str = "snapshot.json";

/// Snapshot identifier, a UTC timestamp that sorts chronologically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn from_time(time: NaiveDateTime) -> Self {
        Self(time.format(ID_FORMAT).to_string())
    }

    pub fn parse(s: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(s, ID_FORMAT)
            .ok()
            .map(Self::from_time)
    }

    pub fn time(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, ID_FORMAT).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contents of `snapshot.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,

    /// App image of the captured manifest
    pub image: Option<String>,

    /// Persistence backend that produced the data artifact
    pub backend: String,

    /// Data artifact file name, if one was captured
    pub data_artifact: Option<String>,

    pub manifest_sha256: Option<String>,
}

/// Snapshot directory store
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: Dir,
}

impl SnapshotStore {
    pub fn new(root: Dir) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Dir {
        &self.root
    }

    /// Directory of a snapshot
    pub fn dir(&self, id: &SnapshotId) -> Dir {
        self.root.subdir(id.as_str())
    }

    /// Complete snapshots, oldest first
    pub async fn list(&self) -> Result<Vec<SnapshotId>, OrchestratorError> {
        let mut ids: Vec<SnapshotId> = self
            .root
            .list_dir_names()
            .await?
            .iter()
            .filter_map(|name| SnapshotId::parse(name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn latest(&self) -> Result<Option<SnapshotId>, OrchestratorError> {
        Ok(self.list().await?.pop())
    }

    pub async fn metadata(&self, id: &SnapshotId) -> Result<SnapshotMetadata, OrchestratorError> {
        self.dir(id).file(METADATA_FILE).read_json().await
    }

    /// Strictly greater than every existing id. Ids have whole-second
    /// precision, so a second capture within the same second is bumped.
    async fn next_id(&self) -> Result<SnapshotId, OrchestratorError> {
        let now = SnapshotId::from_time(Utc::now().naive_utc());
        match self.latest().await? {
            Some(latest) if latest >= now => {
                let time = latest.time().ok_or_else(|| {
                    OrchestratorError::Internal(format!("unparseable snapshot id {}", latest))
                })?;
                Ok(SnapshotId::from_time(time + ChronoDuration::seconds(1)))
            }
            _ => Ok(now),
        }
    }

    /// Snapshot the live manifest, config and data.
    ///
    /// Returns `None` without touching anything when the service group is
    /// not running. A failed data export is recorded as a warning and the
    /// manifest and config are still captured.
    pub async fn capture(
        &self,
        runtime: &dyn ContainerRuntime,
        manifest: &File,
        config: &File,
        backend: &dyn PersistenceBackend,
        warnings: &mut Warnings,
    ) -> Result<Option<SnapshotId>, OrchestratorError> {
        if !runtime.is_running().await? {
            info!("Service group is not running, skipping snapshot");
            return Ok(None);
        }

        let id = self.next_id().await?;
        let partial = self.root.subdir(&format!("{}{}", id, PARTIAL_SUFFIX));
        partial.delete().await?;
        partial.create().await?;

        let mut manifest_sha256 = None;
        let mut image = None;
        for live in [manifest, config] {
            match live.read_optional().await? {
                Some(bytes) => {
                    partial.file(&live.name()).write_atomic(&bytes).await?;
                    if live == manifest {
                        manifest_sha256 = Some(sha256_hash(&bytes));
                        image = std::str::from_utf8(&bytes)
                            .ok()
                            .and_then(|text| ServiceManifest::from_yaml(text).ok())
                            .and_then(|m| m.app_image().map(str::to_string));
                    }
                }
                None => warnings.push(
                    "snapshot",
                    format!("{} does not exist, not captured", live.path().display()),
                ),
            }
        }

        let artifact = partial.file(backend.artifact_name());
        let data_artifact = match backend.export(runtime, artifact.path()).await {
            Ok(()) if artifact.exists().await => Some(backend.artifact_name().to_string()),
            Ok(()) => {
                warnings.push("snapshot", "data export produced no artifact");
                None
            }
            Err(e) => {
                warnings.push("snapshot", format!("data export failed: {}", e));
                artifact.delete().await?;
                None
            }
        };

        let metadata = SnapshotMetadata {
            id: id.clone(),
            created_at: Utc::now(),
            image,
            backend: backend.name().to_string(),
            data_artifact,
            manifest_sha256,
        };
        partial.file(METADATA_FILE).write_json(&metadata).await?;
        partial.rename_to(&self.dir(&id)).await?;

        info!("Captured snapshot {}", id);
        Ok(Some(id))
    }

    /// Put a snapshot's manifest and config back, start the group from them
    /// and load the data artifact if the snapshot has one.
    pub async fn restore(
        &self,
        id: &SnapshotId,
        runtime: &dyn ContainerRuntime,
        manifest: &File,
        config: &File,
        backend: &dyn PersistenceBackend,
        warnings: &mut Warnings,
    ) -> Result<(), OrchestratorError> {
        let dir = self.dir(id);
        if !dir.exists().await {
            return Err(OrchestratorError::NotFound(format!("snapshot {}", id)));
        }

        for live in [manifest, config] {
            let saved = dir.file(&live.name());
            if saved.exists().await {
                saved.copy_to(live).await?;
                debug!("Restored {}", live.path().display());
            } else {
                warnings.push(
                    "restore",
                    format!("snapshot {} has no {}", id, live.name()),
                );
            }
        }

        runtime.start_group().await?;

        let artifact = dir.file(backend.artifact_name());
        if artifact.exists().await {
            if let Err(e) = backend.import(runtime, artifact.path()).await {
                warnings.push("restore", format!("data import failed: {}", e));
            }
        } else {
            info!("Snapshot {} has no data artifact, restored structure only", id);
        }

        info!("Restored snapshot {}", id);
        Ok(())
    }

    /// Delete the oldest snapshots so that at most `keep` remain. The newest
    /// snapshot is always kept. Leftovers of interrupted captures are swept
    /// too; callers hold the deployment lock, so none of them is in progress.
    pub async fn prune(&self, keep: usize) -> Result<Vec<SnapshotId>, OrchestratorError> {
        for name in self.root.list_dir_names().await? {
            if name.ends_with(PARTIAL_SUFFIX) {
                self.root.subdir(&name).delete().await?;
                debug!("Removed interrupted snapshot {}", name);
            }
        }

        let ids = self.list().await?;
        let keep = keep.max(1);
        if ids.len() <= keep {
            return Ok(Vec::new());
        }

        let doomed: Vec<SnapshotId> = ids[..ids.len() - keep].to_vec();
        for id in &doomed {
            self.dir(id).delete().await?;
            debug!("Pruned snapshot {}", id);
        }
        Ok(doomed)
    }
}
