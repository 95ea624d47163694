//! Renders the service manifest for a target and topology

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::OrchestratorError;
use crate::manifest::model::{
    Declaration, DeploymentTarget, ManifestTemplate, PortBinding, Service, ServiceManifest,
    TopologyKind, VolumeBinding, VolumeSource, APP_SERVICE, CACHE_SERVICE, DB_SERVICE,
    PROXY_SERVICE,
};

/// Named volume backing the relational database
pub const DB_VOLUME: &str = "db-data";

/// Builds [`ServiceManifest`] values from a [`ManifestTemplate`]
#[derive(Debug, Clone)]
pub struct ManifestGenerator {
    template: ManifestTemplate,
}

impl ManifestGenerator {
    pub fn new(template: ManifestTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &ManifestTemplate {
        &self.template
    }

    /// Render the manifest. Same inputs always give the same document.
    pub fn render(&self, target: &DeploymentTarget, topology: TopologyKind) -> ServiceManifest {
        let t = &self.template;
        let mut services = BTreeMap::new();
        let mut volumes = BTreeMap::new();

        let mut app = Service {
            image: target.image_ref(),
            restart: Some(t.restart_policy.clone()),
            env_file: vec![".env".to_string()],
            ports: vec![PortBinding {
                host: t.app_port,
                container: t.app_port,
            }],
            networks: vec![t.network.clone()],
            ..Default::default()
        };

        match topology {
            TopologyKind::Bind => {
                app.volumes.push(VolumeBinding {
                    source: VolumeSource::HostPath(t.bind_source.clone()),
                    target: t.data_dir.clone(),
                    read_only: false,
                });
            }
            TopologyKind::Volume => {
                app.volumes.push(VolumeBinding {
                    source: VolumeSource::Named(t.data_volume.clone()),
                    target: t.data_dir.clone(),
                    read_only: false,
                });
                volumes.insert(t.data_volume.clone(), Declaration::default());
            }
            TopologyKind::Relational => {
                app.depends_on = vec![CACHE_SERVICE.to_string(), DB_SERVICE.to_string()];

                let mut environment = BTreeMap::new();
                environment.insert("POSTGRES_USER".to_string(), t.db_user.clone());
                environment.insert("POSTGRES_DB".to_string(), t.db_name.clone());
                environment.insert("POSTGRES_HOST_AUTH_METHOD".to_string(), "trust".to_string());

                services.insert(
                    DB_SERVICE.to_string(),
                    Service {
                        image: t.db_image.clone(),
                        restart: Some(t.restart_policy.clone()),
                        environment,
                        volumes: vec![VolumeBinding {
                            source: VolumeSource::Named(DB_VOLUME.to_string()),
                            target: "/var/lib/postgresql/data".to_string(),
                            read_only: false,
                        }],
                        networks: vec![t.network.clone()],
                        ..Default::default()
                    },
                );
                services.insert(
                    CACHE_SERVICE.to_string(),
                    Service {
                        image: t.cache_image.clone(),
                        restart: Some(t.restart_policy.clone()),
                        networks: vec![t.network.clone()],
                        ..Default::default()
                    },
                );
                volumes.insert(DB_VOLUME.to_string(), Declaration::default());
            }
        }
        services.insert(APP_SERVICE.to_string(), app);

        let proxy = Service {
            image: t.proxy_image.clone(),
            restart: Some(t.restart_policy.clone()),
            ports: t
                .proxy_ports
                .iter()
                .map(|&port| PortBinding {
                    host: port,
                    container: port,
                })
                .collect(),
            volumes: t
                .proxy_conf_dir
                .iter()
                .map(|dir| VolumeBinding {
                    source: VolumeSource::HostPath(dir.clone()),
                    target: "/etc/nginx/conf.d".to_string(),
                    read_only: true,
                })
                .collect(),
            networks: vec![t.network.clone()],
            depends_on: vec![APP_SERVICE.to_string()],
            ..Default::default()
        };
        services.insert(PROXY_SERVICE.to_string(), proxy);

        let mut networks = BTreeMap::new();
        networks.insert(t.network.clone(), Declaration::default());

        debug!("Rendered {} manifest for {}", topology, target.image_ref());

        ServiceManifest {
            name: t.project_name.clone(),
            services,
            volumes,
            networks,
        }
    }

    /// Reject switching persistence variants without an explicit migration.
    ///
    /// `live` is the manifest currently on disk, `bind_data_present` tells
    /// whether the bind data directory still holds the data file.
    pub fn check_topology(
        &self,
        live: Option<&ServiceManifest>,
        requested: TopologyKind,
        bind_data_present: bool,
    ) -> Result<(), OrchestratorError> {
        if let Some(current) = live.and_then(|m| m.topology(&self.template)) {
            if current != requested {
                return Err(OrchestratorError::TopologyConflict(format!(
                    "live manifest uses {} persistence but {} was requested",
                    current, requested
                )));
            }
        }

        if requested == TopologyKind::Relational && bind_data_present {
            return Err(OrchestratorError::TopologyConflict(format!(
                "{} persistence requested while file data exists in {}",
                requested, self.template.bind_source
            )));
        }

        Ok(())
    }
}
