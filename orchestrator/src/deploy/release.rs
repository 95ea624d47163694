//! Rollout sequence: pull, stop, start, one-off commands

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::{OrchestratorError, Warnings};
use crate::manifest::model::APP_SERVICE;

/// Release controller options
#[derive(Debug, Clone)]
pub struct Options {
    /// Schema migration command run inside the app service
    pub migrate_command: Vec<String>,

    /// Static asset collection command run inside the app service
    pub collect_static_command: Vec<String>,

    /// How long to wait for published host ports to be released after stop.
    /// Zero disables the wait.
    pub port_release_timeout: Duration,

    pub port_poll_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            migrate_command: split_command("python manage.py migrate --noinput"),
            collect_static_command: split_command("python manage.py collectstatic --noinput"),
            port_release_timeout: Duration::from_secs(30),
            port_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Whitespace-split a command line
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Drives `Pulling -> Stopping -> Starting -> Migrating`
pub struct ReleaseController<'a> {
    runtime: &'a dyn ContainerRuntime,
    options: &'a Options,
}

impl<'a> ReleaseController<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, options: &'a Options) -> Self {
        Self { runtime, options }
    }

    /// Roll the live manifest out. Expects the machine in `Pulling`; `ports`
    /// are the host ports the manifest publishes.
    ///
    /// Pull, stop, start and port release failures are fatal. The one-off
    /// commands only produce warnings.
    pub async fn rollout(
        &self,
        fsm: &mut DeploymentFsm,
        ports: &[u16],
        warnings: &mut Warnings,
    ) -> Result<(), OrchestratorError> {
        info!("Pulling images...");
        self.runtime.pull().await?;

        fsm.process(DeploymentEvent::Stop)?;
        info!("Stopping service group...");
        self.runtime.stop_group().await?;
        await_ports_released(ports, self.options).await?;

        fsm.process(DeploymentEvent::Start)?;
        info!("Starting service group...");
        self.runtime.start_group().await?;

        fsm.process(DeploymentEvent::Migrate)?;
        self.run_one_off("migrate", &self.options.migrate_command, warnings)
            .await;
        self.run_one_off("collectstatic", &self.options.collect_static_command, warnings)
            .await;

        Ok(())
    }

    async fn run_one_off(&self, label: &str, command: &[String], warnings: &mut Warnings) {
        if command.is_empty() {
            debug!("No {} command configured", label);
            return;
        }

        info!("Running {}...", command.join(" "));
        match self.runtime.exec(APP_SERVICE, command).await {
            Ok(output) if output.success => debug!("{} succeeded", label),
            Ok(output) => warnings.push(label, format!("{} failed: {}", command.join(" "), output.stderr)),
            Err(e) => warnings.push(label, format!("{} failed: {}", command.join(" "), e)),
        }
    }
}

/// Poll until none of `ports` is bound on this host, bounded by
/// `port_release_timeout`. Ports still held then are a `PortsBusy` error.
pub async fn await_ports_released(ports: &[u16], options: &Options) -> Result<(), OrchestratorError> {
    if options.port_release_timeout.is_zero() || ports.is_empty() {
        return Ok(());
    }

    let deadline = Instant::now() + options.port_release_timeout;
    loop {
        let mut held = Vec::new();
        for &port in ports {
            if port_held(port).await {
                held.push(port);
            }
        }
        if held.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(OrchestratorError::PortsBusy(held));
        }
        debug!("Waiting for ports {:?} to be released", held);
        tokio::time::sleep(options.port_poll_interval).await;
    }
}

/// Only "address in use" counts as held; any other bind error is unknown
async fn port_held(port: u16) -> bool {
    match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await {
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            debug!("Cannot probe port {}: {}", port, e);
            false
        }
    }
}
