//! Options for one invocation, from settings plus command line overrides

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::runtime::RegistryCredentials;
use crate::deploy::{health, release};
use crate::guard::disk;
use crate::manifest::model::{ManifestTemplate, TopologyKind};
use crate::storage::layout::DeploymentLayout;
use crate::storage::settings::Settings;

/// Everything a run needs to know, resolved before it starts
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Deployment directory layout
    pub layout: DeploymentLayout,

    /// Image coordinates
    pub target: TargetOptions,

    /// Registry login, skipped when absent
    pub credentials: Option<RegistryCredentials>,

    pub topology: TopologyKind,

    /// Accept a topology different from the live one for this run
    pub allow_topology_change: bool,

    /// Break an existing lock regardless of its age
    pub force: bool,

    pub template: ManifestTemplate,

    pub disk: DiskOptions,

    pub health: health::Options,

    pub release: release::Options,

    /// Echo service for public address discovery
    pub public_address_url: Option<String>,

    pub extra_allowed_hosts: Vec<String>,

    pub lock_stale_after: Duration,

    /// Compose invocation; empty means detect
    pub compose_command: Vec<String>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self::from_settings(DeploymentLayout::default(), &Settings::default())
    }
}

impl DeployOptions {
    pub fn from_settings(layout: DeploymentLayout, settings: &Settings) -> Self {
        Self {
            layout,
            target: TargetOptions {
                registry: settings.target.registry.clone(),
                repository: settings.target.repository.clone(),
                tag: settings.target.tag.clone(),
            },
            credentials: None,
            topology: settings.topology,
            allow_topology_change: settings.allow_topology_change,
            force: false,
            template: settings.manifest.clone(),
            disk: DiskOptions {
                guard: disk::Options {
                    root: PathBuf::from(&settings.disk.root),
                    threshold_mb: settings.disk.threshold_mb,
                },
                snapshot_retention: settings.disk.snapshot_retention,
                containers_dir: PathBuf::from(&settings.disk.containers_dir),
                max_container_log_bytes: settings.disk.max_container_log_mb * 1024 * 1024,
                journal_vacuum_size: settings.disk.journal_vacuum_size.clone(),
            },
            health: health::Options {
                settle_delay: Duration::from_secs(settings.health.settle_delay_secs),
                max_attempts: settings.health.max_attempts,
                interval: Duration::from_secs(settings.health.interval_secs),
                request_timeout: Duration::from_secs(settings.health.request_timeout_secs),
            },
            release: release::Options {
                migrate_command: release::split_command(&settings.release.migrate_command),
                collect_static_command: release::split_command(&settings.release.collect_static_command),
                port_release_timeout: Duration::from_secs(settings.release.port_release_timeout_secs),
                ..Default::default()
            },
            public_address_url: settings.public_address_url.clone(),
            extra_allowed_hosts: settings.extra_allowed_hosts.clone(),
            lock_stale_after: Duration::from_secs(settings.lock_stale_after_secs),
            compose_command: settings.runtime.compose_command.clone(),
        }
    }
}

/// Registry image coordinates, validated when a deploy starts
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

/// Disk guard and reclamation options
#[derive(Debug, Clone)]
pub struct DiskOptions {
    pub guard: disk::Options,

    /// Snapshots kept after a healthy deploy and during reclamation
    pub snapshot_retention: usize,

    /// Per-container log directories of the runtime
    pub containers_dir: PathBuf,

    pub max_container_log_bytes: u64,

    pub journal_vacuum_size: String,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            guard: disk::Options::default(),
            snapshot_retention: 5,
            containers_dir: PathBuf::from("/var/lib/docker/containers"),
            max_container_log_bytes: 100 * 1024 * 1024,
            journal_vacuum_size: "100M".to_string(),
        }
    }
}
