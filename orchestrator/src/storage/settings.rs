//! Settings file management

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::manifest::model::{ManifestTemplate, TopologyKind};

/// Orchestrator settings, read from `rollctl.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// JSON formatted stdout logs
    #[serde(default)]
    pub json_logs: bool,

    /// Also write `logs/rollctl.log`
    #[serde(default = "default_true")]
    pub file_logging: bool,

    /// Image to deploy
    #[serde(default)]
    pub target: TargetSettings,

    #[serde(default)]
    pub topology: TopologyKind,

    /// Accept a topology different from the live one
    #[serde(default)]
    pub allow_topology_change: bool,

    #[serde(default)]
    pub manifest: ManifestTemplate,

    #[serde(default)]
    pub disk: DiskSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub release: ReleaseSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Echo service used to discover the public address; `null` disables it
    #[serde(default = "default_public_address_url")]
    pub public_address_url: Option<String>,

    /// Added to `ALLOWED_HOSTS`
    #[serde(default)]
    pub extra_allowed_hosts: Vec<String>,

    /// Locks older than this are broken
    #[serde(default = "default_lock_stale_after")]
    pub lock_stale_after_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_public_address_url() -> Option<String> {
    Some("https://api.ipify.org".to_string())
}

fn default_lock_stale_after() -> u64 {
    3600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            file_logging: true,
            target: TargetSettings::default(),
            topology: TopologyKind::default(),
            allow_topology_change: false,
            manifest: ManifestTemplate::default(),
            disk: DiskSettings::default(),
            health: HealthSettings::default(),
            release: ReleaseSettings::default(),
            runtime: RuntimeSettings::default(),
            public_address_url: default_public_address_url(),
            extra_allowed_hosts: Vec::new(),
            lock_stale_after_secs: default_lock_stale_after(),
        }
    }
}

impl Settings {
    /// Read the settings file; a missing file means defaults
    pub async fn load(file: &File) -> Result<Self, OrchestratorError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json().await
    }
}

/// Registry image coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSettings {
    #[serde(default)]
    pub registry: String,

    #[serde(default)]
    pub repository: String,

    #[serde(default = "default_tag")]
    pub tag: String,

    /// Registry login user; the password only comes from the environment
    #[serde(default)]
    pub username: Option<String>,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            registry: String::new(),
            repository: String::new(),
            tag: default_tag(),
            username: None,
        }
    }
}

/// Disk guard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSettings {
    /// Storage root of the container runtime
    #[serde(default = "default_disk_root")]
    pub root: String,

    #[serde(default = "default_threshold_mb")]
    pub threshold_mb: u64,

    /// Snapshots kept by pruning
    #[serde(default = "default_retention")]
    pub snapshot_retention: usize,

    #[serde(default = "default_containers_dir")]
    pub containers_dir: String,

    /// Container logs above this size are truncated during reclamation
    #[serde(default = "default_max_container_log_mb")]
    pub max_container_log_mb: u64,

    #[serde(default = "default_journal_size")]
    pub journal_vacuum_size: String,
}

fn default_disk_root() -> String {
    "/var/lib/docker".to_string()
}

fn default_threshold_mb() -> u64 {
    2048
}

fn default_retention() -> usize {
    5
}

fn default_containers_dir() -> String {
    "/var/lib/docker/containers".to_string()
}

fn default_max_container_log_mb() -> u64 {
    100
}

fn default_journal_size() -> String {
    "100M".to_string()
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            root: default_disk_root(),
            threshold_mb: default_threshold_mb(),
            snapshot_retention: default_retention(),
            containers_dir: default_containers_dir(),
            max_container_log_mb: default_max_container_log_mb(),
            journal_vacuum_size: default_journal_size(),
        }
    }
}

/// Health gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_settle_delay() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    10
}

fn default_interval() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    5
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            settle_delay_secs: default_settle_delay(),
            max_attempts: default_max_attempts(),
            interval_secs: default_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Release settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSettings {
    /// Empty to skip
    #[serde(default = "default_migrate_command")]
    pub migrate_command: String,

    /// Empty to skip
    #[serde(default = "default_collect_static_command")]
    pub collect_static_command: String,

    #[serde(default = "default_port_release_timeout")]
    pub port_release_timeout_secs: u64,
}

fn default_migrate_command() -> String {
    "python manage.py migrate --noinput".to_string()
}

fn default_collect_static_command() -> String {
    "python manage.py collectstatic --noinput".to_string()
}

fn default_port_release_timeout() -> u64 {
    30
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            migrate_command: default_migrate_command(),
            collect_static_command: default_collect_static_command(),
            port_release_timeout_secs: default_port_release_timeout(),
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Compose invocation, e.g. `["docker", "compose"]`. Empty means detect.
    #[serde(default)]
    pub compose_command: Vec<String>,
}
