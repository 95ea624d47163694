//! Values the reconciler derives from the host and the chosen topology

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::reconciler::KeyValues;
use crate::errors::OrchestratorError;
use crate::manifest::model::{ManifestTemplate, TopologyKind};
use crate::utils::generate_secret_key;

/// Defaults written only when a key is absent
pub fn required_defaults() -> KeyValues {
    vec![("SECRET_KEY".to_string(), generate_secret_key())]
}

/// Values forced on every run
pub fn computed_overrides(
    topology: TopologyKind,
    template: &ManifestTemplate,
    allowed_hosts: &[String],
) -> KeyValues {
    let mut overrides = vec![
        ("ALLOWED_HOSTS".to_string(), allowed_hosts.join(",")),
        ("DATABASE_URL".to_string(), database_url(topology, template)),
    ];
    if topology == TopologyKind::Relational {
        overrides.push(("REDIS_URL".to_string(), "redis://cache:6379/0".to_string()));
    }
    overrides
}

/// Persistence locator pinned to the canonical in-container location
pub fn database_url(topology: TopologyKind, template: &ManifestTemplate) -> String {
    match topology {
        TopologyKind::Bind | TopologyKind::Volume => {
            format!("sqlite:///{}", template.data_file_container_path())
        }
        TopologyKind::Relational => format!(
            "postgres://{}@db:5432/{}",
            template.db_user, template.db_name
        ),
    }
}

/// Ordered, de-duplicated allowed hosts list
pub fn allowed_hosts(
    hostname: Option<&str>,
    public_address: Option<&str>,
    extra: &[String],
) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    let candidates = ["localhost", "127.0.0.1"]
        .into_iter()
        .map(str::to_string)
        .chain(hostname.map(str::to_string))
        .chain(public_address.map(str::to_string))
        .chain(extra.iter().cloned());

    for host in candidates {
        let host = host.trim().to_string();
        if !host.is_empty() && !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}

/// Ask an echo service for this host's public address
pub async fn discover_public_address(url: &str) -> Result<String, OrchestratorError> {
    debug!("Discovering public address via {}", url);
    let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
    let response = client.get(url).send().await?.error_for_status()?;
    let address = response.text().await?.trim().to_string();

    if address.is_empty() || address.contains(char::is_whitespace) {
        return Err(OrchestratorError::Config(format!(
            "Unexpected public address response: {:?}",
            address
        )));
    }
    Ok(address)
}
