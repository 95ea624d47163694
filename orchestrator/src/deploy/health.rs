//! Health gate: bounded readiness polling after a rollout

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::OrchestratorError;
use crate::manifest::model::ManifestTemplate;

/// Readiness path served by the app
pub const HEALTH_PATH: &str = "/health/";

/// Health gate options
#[derive(Debug, Clone)]
pub struct Options {
    /// Wait before the first attempt
    pub settle_delay: Duration,

    pub max_attempts: u32,

    /// Wait between attempts
    pub interval: Duration,

    /// Per-request timeout, also the cap on a single attempt
    pub request_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(10),
            max_attempts: 10,
            interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// One readiness attempt
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probes the front door and the direct port together; any 2xx passes, so the
/// direct port stands in when the proxy is not answering yet
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    endpoints: Vec<Url>,
}

impl HttpProbe {
    pub fn new(endpoints: Vec<Url>, request_timeout: Duration) -> Result<Self, OrchestratorError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, endpoints })
    }

    /// Front-door (first proxy port) then the app's direct port
    pub fn for_template(template: &ManifestTemplate, request_timeout: Duration) -> Result<Self, OrchestratorError> {
        let mut endpoints = Vec::new();
        if let Some(port) = template.proxy_ports.first() {
            endpoints.push(endpoint(*port)?);
        }
        endpoints.push(endpoint(template.app_port)?);
        Self::new(endpoints, request_timeout)
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }
}

fn endpoint(port: u16) -> Result<Url, OrchestratorError> {
    Url::parse(&format!("http://127.0.0.1:{}{}", port, HEALTH_PATH))
        .map_err(|e| OrchestratorError::Config(format!("Invalid health endpoint: {}", e)))
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check(&self) -> bool {
        let mut requests = JoinSet::new();
        for url in self.endpoints.iter().cloned() {
            let client = self.client.clone();
            requests.spawn(async move {
                match client.get(url.clone()).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!("{} answered {}", url, response.status());
                        true
                    }
                    Ok(response) => {
                        debug!("{} answered {}", url, response.status());
                        false
                    }
                    Err(e) => {
                        debug!("{} unreachable: {}", url, e);
                        false
                    }
                }
            });
        }

        while let Some(result) = requests.join_next().await {
            if matches!(result, Ok(true)) {
                return true;
            }
        }
        false
    }
}

/// Poll `probe` until it passes or `max_attempts` are used up.
///
/// Sleeps `settle_delay` once, then `interval` between attempts. Nothing is
/// slept after the last attempt. An attempt that has not answered within
/// `request_timeout` fails, so the whole gate takes at most
/// `settle_delay + (max_attempts - 1) * interval + max_attempts * request_timeout`.
pub async fn await_healthy<S, F>(
    probe: &dyn ReadinessProbe,
    options: &Options,
    sleep_fn: S,
) -> Result<u32, OrchestratorError>
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    let max_attempts = options.max_attempts.max(1);
    info!(
        "Waiting for readiness ({} attempts every {:?} after {:?})",
        max_attempts, options.interval, options.settle_delay
    );
    sleep_fn(options.settle_delay).await;

    for attempt in 1..=max_attempts {
        match tokio::time::timeout(options.request_timeout, probe.check()).await {
            Ok(true) => {
                info!("Healthy after {} attempt(s)", attempt);
                return Ok(attempt);
            }
            Ok(false) => warn!("Health check attempt {}/{} failed", attempt, max_attempts),
            Err(_) => warn!(
                "Health check attempt {}/{} timed out after {:?}",
                attempt, max_attempts, options.request_timeout
            ),
        }
        if attempt < max_attempts {
            sleep_fn(options.interval).await;
        }
    }

    Err(OrchestratorError::HealthCheckFailed {
        attempts: max_attempts,
    })
}
