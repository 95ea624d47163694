//! Error types for rollctl

use std::fmt;

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Manifest encoding error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("Registry authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    #[error("Insufficient disk space: {free_mb} MB free, {threshold_mb} MB required")]
    Disk { free_mb: u64, threshold_mb: u64 },

    #[error("No backup found to roll back to")]
    NoSnapshot,

    #[error("Image pull failed: {0}")]
    Pull(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Host ports still in use after stop: {0:?}")]
    PortsBusy(Vec<u16>),

    #[error("Health check failed after {attempts} attempts")]
    HealthCheckFailed { attempts: u32 },

    #[error("Deployment lock error: {0}")]
    Lock(String),

    #[error("Invalid deployment target: {0}")]
    InvalidTarget(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(format!("{:#}", err))
    }
}

/// A non-fatal problem surfaced to the operator at the end of a run
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Warning {
    /// Pipeline stage that produced the warning
    pub stage: String,

    /// Human readable message
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}

/// Accumulated warnings for one invocation
#[derive(Debug, Clone, Default)]
pub struct Warnings {
    items: Vec<Warning>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and log it
    pub fn push(&mut self, stage: &str, message: impl Into<String>) {
        let warning = Warning {
            stage: stage.to_string(),
            message: message.into(),
        };
        tracing::warn!("{}", warning);
        self.items.push(warning);
    }

    pub fn extend(&mut self, other: Warnings) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Warning> {
        self.items
    }
}
