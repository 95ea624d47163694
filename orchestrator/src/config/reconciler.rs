//! Environment configuration reconciliation

use tracing::{debug, info};

use crate::config::env_file::EnvironmentConfig;
use crate::errors::{OrchestratorError, Warnings};
use crate::filesys::file::File;

/// Keys that must hold real values after reconciliation
pub const REQUIRED_KEYS: [&str; 3] = ["SECRET_KEY", "ALLOWED_HOSTS", "DATABASE_URL"];

/// Values that mean "nobody filled this in"
pub const PLACEHOLDER_VALUES: [&str; 5] = [
    "CHANGE_ME",
    "changeme",
    "change-me",
    "your-secret-key",
    "",
];

/// Sample used when neither an env file nor a template exists
pub const BUNDLED_SAMPLE: &str = "\
# Application environment managed by rollctl.
# SECRET_KEY, ALLOWED_HOSTS and DATABASE_URL are enforced on every deploy.
DEBUG=False
SECRET_KEY=CHANGE_ME
ALLOWED_HOSTS=localhost
DATABASE_URL=
";

/// Ordered key/value pairs
pub type KeyValues = Vec<(String, String)>;

/// Outcome of planning a reconciliation, before anything is written
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// The reconciled configuration
    pub config: EnvironmentConfig,

    /// The env file did not exist and will be created
    pub created: bool,

    /// Rendered contents differ from what is on disk
    pub changed: bool,

    /// Placeholder violations and other non-fatal findings
    pub warnings: Warnings,
}

/// Brings the env file into a known-correct state
#[derive(Debug, Clone)]
pub struct ConfigReconciler {
    env_file: File,
    template_file: Option<File>,
}

impl ConfigReconciler {
    pub fn new(env_file: File, template_file: Option<File>) -> Self {
        Self {
            env_file,
            template_file,
        }
    }

    /// The env file this reconciler manages
    pub fn env_file(&self) -> &File {
        &self.env_file
    }

    /// Load the env file (or its template) and apply defaults and overrides
    /// in memory.
    pub async fn prepare(
        &self,
        required_defaults: &KeyValues,
        computed_overrides: &KeyValues,
    ) -> Result<Reconciliation, OrchestratorError> {
        let existing = match self.env_file.read_optional().await? {
            Some(bytes) => Some(String::from_utf8(bytes).map_err(|e| {
                OrchestratorError::Config(format!(
                    "{} is not valid UTF-8: {}",
                    self.env_file.path().display(),
                    e
                ))
            })?),
            None => None,
        };

        let created = existing.is_none();
        let mut config = match &existing {
            Some(text) => EnvironmentConfig::parse(text),
            None => EnvironmentConfig::parse(&self.load_template().await?),
        };

        for (key, value) in required_defaults {
            if created {
                config.set(key, value);
            } else {
                config.set_if_missing(key, value);
            }
        }

        for (key, value) in computed_overrides {
            if config.set(key, value) {
                debug!("Enforced {} in {}", key, self.env_file.name());
            }
        }

        let changed = existing.as_deref() != Some(config.render().as_str());

        let mut warnings = Warnings::new();
        for violation in check_required(&config) {
            warnings.push("reconcile", violation.to_string());
        }

        Ok(Reconciliation {
            config,
            created,
            changed,
            warnings,
        })
    }

    /// Write the reconciled file with write-then-rename. Unchanged files are
    /// left alone. Returns whether a write happened.
    pub async fn commit(&self, reconciliation: &Reconciliation) -> Result<bool, OrchestratorError> {
        if !reconciliation.changed {
            debug!("{} already reconciled", self.env_file.name());
            return Ok(false);
        }

        self.env_file
            .write_atomic(reconciliation.config.render().as_bytes())
            .await?;

        if reconciliation.created {
            info!("Created {}", self.env_file.path().display());
        } else {
            info!("Updated {}", self.env_file.path().display());
        }
        Ok(true)
    }

    /// Prepare and commit in one step
    pub async fn reconcile(
        &self,
        required_defaults: &KeyValues,
        computed_overrides: &KeyValues,
    ) -> Result<Reconciliation, OrchestratorError> {
        let reconciliation = self.prepare(required_defaults, computed_overrides).await?;
        self.commit(&reconciliation).await?;
        Ok(reconciliation)
    }

    async fn load_template(&self) -> Result<String, OrchestratorError> {
        if let Some(template) = &self.template_file {
            if template.exists().await {
                debug!("Creating env file from {}", template.path().display());
                return template.read_string().await;
            }
        }
        debug!("Creating env file from bundled sample");
        Ok(BUNDLED_SAMPLE.to_string())
    }
}

/// Required keys that are missing or still hold a placeholder
pub fn check_required(config: &EnvironmentConfig) -> Vec<OrchestratorError> {
    REQUIRED_KEYS
        .iter()
        .filter_map(|key| match config.get(key) {
            None => Some(OrchestratorError::Config(format!("{} is missing", key))),
            Some(value) if is_placeholder(value) => Some(OrchestratorError::Config(format!(
                "{} still holds a placeholder value",
                key
            ))),
            Some(_) => None,
        })
        .collect()
}

pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
    PLACEHOLDER_VALUES.iter().any(|p| p.eq_ignore_ascii_case(value))
}
