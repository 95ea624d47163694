//! Persisted record of the last run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentState;
use crate::errors::{OrchestratorError, Warning};
use crate::filesys::file::File;
use crate::manifest::model::TopologyKind;
use crate::snapshot::store::SnapshotId;

/// Which operation produced the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Rollback,
    Backup,
}

/// Contents of `state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub operation: Operation,
    pub state: DeploymentState,

    /// Image reference the run targeted
    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub topology: Option<TopologyKind>,

    /// Snapshot taken before the rollout
    #[serde(default)]
    pub snapshot: Option<SnapshotId>,

    /// Snapshot restored by a rollback
    #[serde(default)]
    pub restored: Option<SnapshotId>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub warnings: Vec<Warning>,

    /// States visited, in order
    #[serde(default)]
    pub history: Vec<DeploymentState>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            state: DeploymentState::Idle,
            image: None,
            topology: None,
            snapshot: None,
            restored: None,
            error: None,
            warnings: Vec::new(),
            history: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the operation reached its goal
    pub fn succeeded(&self) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.operation {
            Operation::Deploy => self.state == DeploymentState::Healthy,
            Operation::Rollback => self.state == DeploymentState::RolledBack,
            Operation::Backup => true,
        }
    }

    /// Stamp the finish time and write the record atomically
    pub async fn save(&mut self, file: &File) -> Result<(), OrchestratorError> {
        self.finished_at = Some(Utc::now());
        file.write_json(self).await
    }

    /// The last record, if any run has been recorded
    pub async fn load(file: &File) -> Result<Option<Self>, OrchestratorError> {
        if !file.exists().await {
            return Ok(None);
        }
        Ok(Some(file.read_json().await?))
    }
}
