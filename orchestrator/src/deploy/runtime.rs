//! Container runtime collaborator

use std::path::Path;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::OrchestratorError;

/// Captured result of a one-off command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Registry credentials for `login`
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub registry: String,
    pub username: String,
    pub password: SecretString,
}

/// Primitive operations the orchestrator needs from the container runtime.
///
/// Every operation acts on the service group described by the live manifest
/// in the deployment directory.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fail if the runtime tooling is not usable on this host
    async fn ensure_available(&self) -> Result<(), OrchestratorError>;

    async fn login(&self, credentials: &RegistryCredentials) -> Result<(), OrchestratorError>;

    /// Pull every image the live manifest references
    async fn pull(&self) -> Result<(), OrchestratorError>;

    /// Whether any service of the group is running
    async fn is_running(&self) -> Result<bool, OrchestratorError>;

    async fn stop_group(&self) -> Result<(), OrchestratorError>;

    async fn start_group(&self) -> Result<(), OrchestratorError>;

    /// Run a one-off command inside a running service
    async fn exec(&self, service: &str, command: &[String]) -> Result<CommandOutput, OrchestratorError>;

    /// Run a one-off command inside a running service, feeding `input` on stdin
    async fn exec_with_input(
        &self,
        service: &str,
        command: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, OrchestratorError>;

    /// Copy a file out of a running service
    async fn copy_from(&self, service: &str, container_path: &str, dest: &Path) -> Result<(), OrchestratorError>;

    /// Copy a file into a running service
    async fn copy_to(&self, service: &str, src: &Path, container_path: &str) -> Result<(), OrchestratorError>;

    /// Remove unused images, build cache and dangling volumes
    async fn prune(&self) -> Result<(), OrchestratorError>;
}
