//! Typed service manifest

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

pub const APP_SERVICE: &str = "app";
pub const PROXY_SERVICE: &str = "proxy";
pub const DB_SERVICE: &str = "db";
pub const CACHE_SERVICE: &str = "cache";

/// Registry image reference, immutable for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl DeploymentTarget {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self, OrchestratorError> {
        let target = Self {
            registry: registry.into().trim_end_matches('/').to_string(),
            repository: repository.into().trim_matches('/').to_string(),
            tag: tag.into(),
        };

        if target.repository.is_empty() {
            return Err(OrchestratorError::InvalidTarget(
                "repository is empty".to_string(),
            ));
        }
        if target.tag.is_empty()
            || target
                .tag
                .chars()
                .any(|c| c == ':' || c == '/' || c.is_whitespace())
        {
            return Err(OrchestratorError::InvalidTarget(format!(
                "invalid tag {:?}",
                target.tag
            )));
        }
        Ok(target)
    }

    /// `registry/repository:tag`
    pub fn image_ref(&self) -> String {
        if self.registry.is_empty() {
            format!("{}:{}", self.repository, self.tag)
        } else {
            format!("{}/{}:{}", self.registry, self.repository, self.tag)
        }
    }
}

/// Persistence backend variant of the service group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    /// File persistence in a host directory bind-mounted into the app
    #[default]
    Bind,
    /// File persistence in a runtime-managed named volume
    Volume,
    /// Relational database service plus cache service
    Relational,
}

impl TopologyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::Bind => "bind",
            TopologyKind::Volume => "volume",
            TopologyKind::Relational => "relational",
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bind" => Ok(TopologyKind::Bind),
            "volume" => Ok(TopologyKind::Volume),
            "relational" | "postgres" => Ok(TopologyKind::Relational),
            _ => Err(OrchestratorError::Config(format!("Unknown topology: {}", s))),
        }
    }
}

/// Fixed parts of the manifest that do not depend on the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestTemplate {
    pub project_name: String,
    pub app_port: u16,
    pub proxy_image: String,
    pub proxy_ports: Vec<u16>,
    pub proxy_conf_dir: Option<String>,
    pub db_image: String,
    pub cache_image: String,
    pub network: String,
    pub restart_policy: String,
    /// Host path bound to the data directory in `bind` topology
    pub bind_source: String,
    /// Named volume holding the data directory in `volume` topology
    pub data_volume: String,
    /// Data directory inside the app container
    pub data_dir: String,
    pub data_file: String,
    pub db_user: String,
    pub db_name: String,
}

impl Default for ManifestTemplate {
    fn default() -> Self {
        Self {
            project_name: "app".to_string(),
            app_port: 8000,
            proxy_image: "nginx:1.27-alpine".to_string(),
            proxy_ports: vec![80, 443],
            proxy_conf_dir: Some("./nginx".to_string()),
            db_image: "postgres:16-alpine".to_string(),
            cache_image: "redis:7-alpine".to_string(),
            network: "web".to_string(),
            restart_policy: "unless-stopped".to_string(),
            bind_source: "./data".to_string(),
            data_volume: "app-data".to_string(),
            data_dir: "/app/data".to_string(),
            data_file: "db.sqlite3".to_string(),
            db_user: "app".to_string(),
            db_name: "app".to_string(),
        }
    }
}

impl ManifestTemplate {
    /// Canonical in-container path of the file-based data store
    pub fn data_file_container_path(&self) -> String {
        format!("{}/{}", self.data_dir.trim_end_matches('/'), self.data_file)
    }

    /// Host path of the data file in `bind` topology
    pub fn bind_data_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.bind_source).join(&self.data_file)
    }
}

/// `host:container` port publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

impl From<PortBinding> for String {
    fn from(port: PortBinding) -> Self {
        format!("{}:{}", port.host, port.container)
    }
}

impl TryFrom<String> for PortBinding {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (host, container) = match value.rsplit_once(':') {
            Some((host, container)) => (host.rsplit(':').next().unwrap_or(host), container),
            None => (value.as_str(), value.as_str()),
        };
        let parse = |s: &str| {
            s.split('/')
                .next()
                .unwrap_or(s)
                .parse::<u16>()
                .map_err(|e| format!("invalid port binding {:?}: {}", value, e))
        };
        Ok(Self {
            host: parse(host)?,
            container: parse(container)?,
        })
    }
}

/// Where a volume binding gets its data from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    HostPath(String),
    Named(String),
}

/// `source:target[:ro]` volume binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VolumeBinding {
    pub source: VolumeSource,
    pub target: String,
    pub read_only: bool,
}

impl From<VolumeBinding> for String {
    fn from(binding: VolumeBinding) -> Self {
        let source = match &binding.source {
            VolumeSource::HostPath(path) | VolumeSource::Named(path) => path.clone(),
        };
        if binding.read_only {
            format!("{}:{}:ro", source, binding.target)
        } else {
            format!("{}:{}", source, binding.target)
        }
    }
}

impl TryFrom<String> for VolumeBinding {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut parts = value.split(':');
        let (source, target) = match (parts.next(), parts.next()) {
            (Some(s), Some(t)) if !s.is_empty() && !t.is_empty() => (s, t),
            _ => return Err(format!("invalid volume binding {:?}", value)),
        };
        let read_only = parts.next() == Some("ro");

        let source = if source.starts_with('.') || source.starts_with('/') || source.starts_with('~') {
            VolumeSource::HostPath(source.to_string())
        } else {
            VolumeSource::Named(source.to_string())
        };
        Ok(Self {
            source,
            target: target.to_string(),
            read_only,
        })
    }
}

/// One named service of the group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_file: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortBinding>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeBinding>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Top-level named volume or network declaration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {}

/// Declarative description of the service group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceManifest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub services: BTreeMap<String, Service>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Declaration>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Declaration>,
}

impl ServiceManifest {
    /// Serialize to compose YAML
    pub fn to_yaml(&self) -> Result<String, OrchestratorError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, OrchestratorError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Image reference of the app service
    pub fn app_image(&self) -> Option<&str> {
        self.service(APP_SERVICE).map(|s| s.image.as_str())
    }

    /// Host ports published by any service, ascending
    pub fn published_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .services
            .values()
            .flat_map(|s| s.ports.iter().map(|p| p.host))
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Infer which persistence variant this manifest was rendered for
    pub fn topology(&self, template: &ManifestTemplate) -> Option<TopologyKind> {
        if self.services.contains_key(DB_SERVICE) {
            return Some(TopologyKind::Relational);
        }
        let app = self.service(APP_SERVICE)?;
        app.volumes
            .iter()
            .find(|v| v.target.trim_end_matches('/') == template.data_dir.trim_end_matches('/'))
            .map(|v| match v.source {
                VolumeSource::HostPath(_) => TopologyKind::Bind,
                VolumeSource::Named(_) => TopologyKind::Volume,
            })
    }
}
