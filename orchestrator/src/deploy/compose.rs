//! Docker Compose runtime

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::runtime::{CommandOutput, ContainerRuntime, RegistryCredentials};
use crate::errors::OrchestratorError;

/// Drives the service group through the `docker compose` CLI
#[derive(Debug, Clone)]
pub struct DockerCompose {
    /// Compose invocation, e.g. `["docker", "compose"]` or `["docker-compose"]`
    command: Vec<String>,
    project_dir: PathBuf,
    manifest_file: PathBuf,
}

impl DockerCompose {
    pub fn new(command: Vec<String>, project_dir: impl Into<PathBuf>, manifest_file: impl Into<PathBuf>) -> Self {
        let command = if command.is_empty() {
            vec!["docker".to_string(), "compose".to_string()]
        } else {
            command
        };
        Self {
            command,
            project_dir: project_dir.into(),
            manifest_file: manifest_file.into(),
        }
    }

    /// Prefer `docker compose`, fall back to the standalone `docker-compose`
    pub async fn detect(project_dir: impl Into<PathBuf>, manifest_file: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let manifest_file = manifest_file.into();

        let plugin = vec!["docker".to_string(), "compose".to_string()];
        let ok = Command::new("docker")
            .args(["compose", "version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);

        if ok {
            return Self::new(plugin, project_dir, manifest_file);
        }

        debug!("'docker compose' unavailable, trying 'docker-compose'...");
        Self::new(vec!["docker-compose".to_string()], project_dir, manifest_file)
    }

    fn docker_binary(&self) -> &str {
        match self.command.first().map(String::as_str) {
            Some("docker-compose") | None => "docker",
            Some(binary) => binary,
        }
    }

    fn compose(&self) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg("--project-directory")
            .arg(&self.project_dir)
            .arg("-f")
            .arg(&self.manifest_file)
            .current_dir(&self.project_dir);
        cmd
    }

    async fn run(&self, mut cmd: Command, input: Option<&[u8]>) -> Result<CommandOutput, std::io::Error> {
        debug!("Running {:?}", cmd.as_std());

        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).await?;
            drop(stdin);
        }
        let output = child.wait_with_output().await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_compose(&self, args: &[&str], what: &str) -> Result<CommandOutput, OrchestratorError> {
        let mut cmd = self.compose();
        cmd.args(args);
        let output = self
            .run(cmd, None)
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("Failed to run compose {}: {}", what, e)))?;

        if !output.success {
            return Err(OrchestratorError::Runtime(format!(
                "compose {} failed: {}",
                what, output.stderr
            )));
        }
        Ok(output)
    }

    fn has_manifest(&self) -> bool {
        self.manifest_file.is_file()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCompose {
    async fn ensure_available(&self) -> Result<(), OrchestratorError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).arg("version");

        match self.run(cmd, None).await {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(OrchestratorError::Bootstrap(format!(
                "{} is not usable: {}",
                self.command.join(" "),
                output.stderr
            ))),
            Err(e) => Err(OrchestratorError::Bootstrap(format!(
                "{} not found: {}",
                self.command.join(" "),
                e
            ))),
        }
    }

    async fn login(&self, credentials: &RegistryCredentials) -> Result<(), OrchestratorError> {
        debug!("Authenticating with {}...", credentials.registry);
        let mut cmd = Command::new(self.docker_binary());
        cmd.args([
            "login",
            credentials.registry.as_str(),
            "-u",
            credentials.username.as_str(),
            "--password-stdin",
        ]);

        let output = self
            .run(cmd, Some(credentials.password.expose_secret().as_bytes()))
            .await
            .map_err(|e| OrchestratorError::Auth(format!("Failed to run docker login: {}", e)))?;

        if !output.success {
            return Err(OrchestratorError::Auth(format!(
                "{} rejected credentials for {}: {}",
                credentials.registry, credentials.username, output.stderr
            )));
        }
        info!("Authenticated with {}", credentials.registry);
        Ok(())
    }

    async fn pull(&self) -> Result<(), OrchestratorError> {
        self.run_compose(&["pull"], "pull")
            .await
            .map_err(|e| OrchestratorError::Pull(e.to_string()))?;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, OrchestratorError> {
        if !self.has_manifest() {
            return Ok(false);
        }
        let output = self
            .run_compose(&["ps", "--status", "running", "--quiet"], "ps")
            .await?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn stop_group(&self) -> Result<(), OrchestratorError> {
        if !self.has_manifest() {
            debug!("No live manifest, nothing to stop");
            return Ok(());
        }
        self.run_compose(&["down", "--remove-orphans"], "down").await?;
        Ok(())
    }

    async fn start_group(&self) -> Result<(), OrchestratorError> {
        self.run_compose(&["up", "-d", "--remove-orphans"], "up").await?;
        Ok(())
    }

    async fn exec(&self, service: &str, command: &[String]) -> Result<CommandOutput, OrchestratorError> {
        let mut cmd = self.compose();
        cmd.args(["exec", "-T", service]).args(command);
        self.run(cmd, None)
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("Failed to exec in {}: {}", service, e)))
    }

    async fn exec_with_input(
        &self,
        service: &str,
        command: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, OrchestratorError> {
        let mut cmd = self.compose();
        cmd.args(["exec", "-T", service]).args(command);
        self.run(cmd, Some(input))
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("Failed to exec in {}: {}", service, e)))
    }

    async fn copy_from(&self, service: &str, container_path: &str, dest: &Path) -> Result<(), OrchestratorError> {
        let source = format!("{}:{}", service, container_path);
        let dest = dest.to_string_lossy();
        self.run_compose(&["cp", source.as_str(), dest.as_ref()], "cp").await?;
        Ok(())
    }

    async fn copy_to(&self, service: &str, src: &Path, container_path: &str) -> Result<(), OrchestratorError> {
        let src = src.to_string_lossy();
        let dest = format!("{}:{}", service, container_path);
        self.run_compose(&["cp", src.as_ref(), dest.as_str()], "cp").await?;
        Ok(())
    }

    async fn prune(&self) -> Result<(), OrchestratorError> {
        let steps: [&[&str]; 3] = [
            &["image", "prune", "-af"],
            &["builder", "prune", "-af"],
            &["volume", "prune", "-f"],
        ];

        let mut failures = Vec::new();
        for args in steps {
            let mut cmd = Command::new(self.docker_binary());
            cmd.args(args);
            match self.run(cmd, None).await {
                Ok(output) if output.success => {}
                Ok(output) => failures.push(format!("{}: {}", args.join(" "), output.stderr)),
                Err(e) => failures.push(format!("{}: {}", args.join(" "), e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Runtime(failures.join("; ")))
        }
    }
}
