//! Finite State Machine for a release run

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Nothing in progress
    Idle,

    /// Reconciling config and rendering the manifest
    Reconciling,

    /// Checking free disk space
    GuardingDisk,

    /// Capturing the pre-rollout snapshot
    Snapshotting,

    Pulling,
    Stopping,
    Starting,

    /// Running one-off migration and asset commands
    Migrating,

    HealthChecking,

    /// New release is serving
    Healthy,

    /// Rollout failed after live state was mutated
    Failed,

    RollingBack,

    /// Latest snapshot restored
    RolledBack,
}

impl DeploymentState {
    /// States in which live files or services may already have changed
    pub fn is_rollout(&self) -> bool {
        matches!(
            self,
            DeploymentState::Pulling
                | DeploymentState::Stopping
                | DeploymentState::Starting
                | DeploymentState::Migrating
                | DeploymentState::HealthChecking
        )
    }

    /// States before any mutation of the live deployment
    pub fn is_preparation(&self) -> bool {
        matches!(
            self,
            DeploymentState::Reconciling | DeploymentState::GuardingDisk | DeploymentState::Snapshotting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Healthy | DeploymentState::Failed | DeploymentState::RolledBack
        )
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    Reconcile,
    GuardDisk,
    Snapshot,
    Pull,
    Stop,
    Start,
    Migrate,
    CheckHealth,

    /// Health gate passed
    Pass,

    /// Fatal error before any mutation
    Abort(String),

    /// Fatal error during rollout or rollback
    Fail(String),

    /// Begin rollback; refused unless a snapshot exists
    RollBack { snapshot_available: bool },

    RollbackComplete,

    /// Return a finished run to idle
    Reset,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
    history: Vec<DeploymentState>,
}

impl DeploymentFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self::from_state(DeploymentState::Idle)
    }

    /// Resume from a persisted state
    pub fn from_state(state: DeploymentState) -> Self {
        Self {
            state,
            error: None,
            history: vec![state],
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[DeploymentState] {
        &self.history
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentState, OrchestratorError> {
        use DeploymentEvent as E;
        use DeploymentState as S;

        let new_state = match (self.state, &event) {
            // Happy path
            (S::Idle, E::Reconcile) => {
                self.error = None;
                S::Reconciling
            }
            (S::Reconciling, E::GuardDisk) => S::GuardingDisk,
            (S::GuardingDisk, E::Snapshot) => S::Snapshotting,
            (S::Snapshotting, E::Pull) => S::Pulling,
            (S::Pulling, E::Stop) => S::Stopping,
            (S::Stopping, E::Start) => S::Starting,
            (S::Starting, E::Migrate) => S::Migrating,
            (S::Migrating, E::CheckHealth) => S::HealthChecking,
            (S::HealthChecking, E::Pass) => S::Healthy,

            // Nothing mutated yet
            (state, E::Abort(err)) if state.is_preparation() => {
                self.error = Some(err.clone());
                S::Idle
            }

            (state, E::Fail(err)) if state.is_rollout() || state == S::RollingBack => {
                self.error = Some(err.clone());
                S::Failed
            }

            // Rollback
            (S::Failed, E::RollBack { snapshot_available: true }) => S::RollingBack,
            (S::Failed, E::RollBack { snapshot_available: false }) => {
                return Err(OrchestratorError::NoSnapshot);
            }
            (S::RollingBack, E::RollbackComplete) => S::RolledBack,

            (S::Healthy | S::Failed | S::RolledBack, E::Reset) => {
                self.error = None;
                S::Idle
            }

            // Invalid transitions
            (state, event) => {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        self.history.push(new_state);
        Ok(new_state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
