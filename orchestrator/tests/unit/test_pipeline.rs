//! End-to-end deploy pipeline tests against a fake container runtime

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use rollctl::app::context::DeploymentContext;
use rollctl::app::options::DeployOptions;
use rollctl::app::run::{backup, deploy, rollback, status};
use rollctl::deploy::fsm::DeploymentState;
use rollctl::deploy::health::ReadinessProbe;
use rollctl::deploy::runtime::{CommandOutput, ContainerRuntime, RegistryCredentials};
use rollctl::errors::OrchestratorError;
use rollctl::guard::disk::{DiskGuard, DiskProbe};
use rollctl::manifest::model::{ServiceManifest, TopologyKind};
use rollctl::storage::layout::DeploymentLayout;
use rollctl::storage::settings::Settings;
use rollctl::storage::state::RunRecord;

#[derive(Default)]
struct FakeState {
    running: bool,
    /// Data file inside the app container
    data: Option<Vec<u8>>,
    /// Rows in the db service
    db: Option<Vec<u8>>,
    fail_pull: bool,
    /// Make the one-off manage.py commands exit non-zero
    fail_one_off: bool,
    starts: u32,
    commands: Vec<String>,
}

#[derive(Default)]
struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    fn data(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().data.clone()
    }

    fn set_data(&self, data: &[u8]) {
        self.state.lock().unwrap().data = Some(data.to_vec());
    }

    fn set_fail_pull(&self, fail: bool) {
        self.state.lock().unwrap().fail_pull = fail;
    }

    fn db(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().db.clone()
    }

    fn set_db(&self, rows: &[u8]) {
        self.state.lock().unwrap().db = Some(rows.to_vec());
    }

    fn set_fail_one_off(&self, fail: bool) {
        self.state.lock().unwrap().fail_one_off = fail;
    }

    fn starts(&self) -> u32 {
        self.state.lock().unwrap().starts
    }

    fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    fn is_up(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_available(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn login(&self, _credentials: &RegistryCredentials) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn pull(&self) -> Result<(), OrchestratorError> {
        if self.state.lock().unwrap().fail_pull {
            return Err(OrchestratorError::Pull("manifest unknown".to_string()));
        }
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, OrchestratorError> {
        Ok(self.is_up())
    }

    async fn stop_group(&self) -> Result<(), OrchestratorError> {
        self.state.lock().unwrap().running = false;
        Ok(())
    }

    async fn start_group(&self) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    async fn exec(&self, _service: &str, command: &[String]) -> Result<CommandOutput, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        let line = command.join(" ");
        state.commands.push(line.clone());

        if line.starts_with("pg_dump") {
            return Ok(match state.db.clone() {
                Some(rows) => CommandOutput {
                    success: true,
                    stdout: rows,
                    ..Default::default()
                },
                None => CommandOutput {
                    stderr: "database does not exist".to_string(),
                    ..Default::default()
                },
            });
        }
        if line.contains("manage.py") && state.fail_one_off {
            return Ok(CommandOutput {
                stderr: "django.db.utils.OperationalError".to_string(),
                ..Default::default()
            });
        }
        // The new release rewrites the data on migrate
        if line.contains("migrate") {
            if state.data.is_some() {
                state.data = Some(b"migrated".to_vec());
            }
            if state.db.is_some() {
                state.db = Some(b"migrated".to_vec());
            }
        }
        Ok(CommandOutput {
            success: true,
            ..Default::default()
        })
    }

    async fn exec_with_input(
        &self,
        service: &str,
        command: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, OrchestratorError> {
        if command.first().is_some_and(|c| c == "psql") {
            let mut state = self.state.lock().unwrap();
            state.commands.push(command.join(" "));
            state.db = Some(input.to_vec());
            return Ok(CommandOutput {
                success: true,
                ..Default::default()
            });
        }
        self.exec(service, command).await
    }

    async fn copy_from(&self, _service: &str, _container_path: &str, dest: &Path) -> Result<(), OrchestratorError> {
        match self.data() {
            Some(data) => Ok(std::fs::write(dest, data)?),
            None => Err(OrchestratorError::Runtime("no such file".to_string())),
        }
    }

    async fn copy_to(&self, _service: &str, src: &Path, _container_path: &str) -> Result<(), OrchestratorError> {
        let data = std::fs::read(src)?;
        self.set_data(&data);
        Ok(())
    }

    async fn prune(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

struct FakeProbe {
    healthy: Arc<AtomicBool>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn check(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}

struct FixedDisk(u64);

impl DiskProbe for FixedDisk {
    fn free_mb(&self, _root: &Path) -> Result<u64, OrchestratorError> {
        Ok(self.0)
    }
}

struct Harness {
    runtime: Arc<FakeRuntime>,
    healthy: Arc<AtomicBool>,
    probe_calls: Arc<AtomicU32>,
}

impl Harness {
    fn new() -> Self {
        Self {
            runtime: Arc::new(FakeRuntime::default()),
            healthy: Arc::new(AtomicBool::new(true)),
            probe_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn context(&self, dir: &Path, tag: &str, free_mb: u64) -> DeploymentContext {
        let settings = Settings {
            public_address_url: None,
            ..Default::default()
        };
        let mut options = DeployOptions::from_settings(DeploymentLayout::new(dir), &settings);
        options.target.registry = "registry.example.com".to_string();
        options.target.repository = "acme/web".to_string();
        options.target.tag = tag.to_string();
        options.release.port_release_timeout = Duration::ZERO;

        let probe = FakeProbe {
            healthy: self.healthy.clone(),
            calls: self.probe_calls.clone(),
        };
        DeploymentContext::new(
            options,
            self.runtime.clone(),
            DiskGuard::new(Box::new(FixedDisk(free_mb)), Vec::new()),
            Box::new(probe),
        )
    }
}

fn no_sleep(_: Duration) -> std::future::Ready<()> {
    std::future::ready(())
}

fn app_image(dir: &Path) -> String {
    let text = std::fs::read_to_string(dir.join("docker-compose.yml")).unwrap();
    ServiceManifest::from_yaml(&text)
        .unwrap()
        .app_image()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_fresh_deploy_is_healthy_without_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let ctx = harness.context(dir.path(), "v1", 10_000);

    let record = deploy(&ctx, no_sleep).await.unwrap();

    assert_eq!(record.state, DeploymentState::Healthy);
    assert!(record.succeeded());
    assert!(record.snapshot.is_none());
    assert!(dir.path().join(".env").exists());
    assert_eq!(app_image(dir.path()), "registry.example.com/acme/web:v1");
    assert!(harness.runtime.is_up());
    assert!(ctx.store.list().await.unwrap().is_empty());
    assert!(!dir.path().join(".rollctl.lock").exists());

    let saved = status(&ctx).await.unwrap().unwrap();
    assert_eq!(saved.state, DeploymentState::Healthy);
    assert_eq!(saved.history.first(), Some(&DeploymentState::Idle));
}

#[tokio::test]
async fn test_failed_health_rolls_back_manifest_config_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    deploy(&harness.context(dir.path(), "v1", 10_000), no_sleep)
        .await
        .unwrap();
    harness.runtime.set_data(b"v1-data");
    let env_before = std::fs::read(dir.path().join(".env")).unwrap();
    let manifest_before = std::fs::read(dir.path().join("docker-compose.yml")).unwrap();

    harness.healthy.store(false, Ordering::SeqCst);
    let mut ctx = harness.context(dir.path(), "v2", 10_000);
    ctx.options.extra_allowed_hosts = vec!["new.example.com".to_string()];
    let record = deploy(&ctx, no_sleep).await.unwrap();

    assert_eq!(record.state, DeploymentState::RolledBack);
    assert!(!record.succeeded());
    assert!(record.error.as_deref().unwrap().contains("Health check failed"));
    assert_eq!(record.snapshot, record.restored);
    assert_eq!(harness.probe_calls.load(Ordering::SeqCst), 10);

    assert_eq!(std::fs::read(dir.path().join(".env")).unwrap(), env_before);
    assert_eq!(std::fs::read(dir.path().join("docker-compose.yml")).unwrap(), manifest_before);
    assert_eq!(app_image(dir.path()), "registry.example.com/acme/web:v1");
    assert_eq!(harness.runtime.data().unwrap(), b"v1-data");
    assert!(harness.runtime.is_up());
}

#[tokio::test]
async fn test_snapshot_is_taken_before_live_files_change() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    deploy(&harness.context(dir.path(), "v1", 10_000), no_sleep)
        .await
        .unwrap();
    harness.runtime.set_data(b"v1-data");

    let ctx = harness.context(dir.path(), "v2", 10_000);
    let record = deploy(&ctx, no_sleep).await.unwrap();
    assert_eq!(record.state, DeploymentState::Healthy);

    let id = record.snapshot.unwrap();
    let snapshot = ctx.store.dir(&id);
    let saved = std::fs::read_to_string(snapshot.path().join("docker-compose.yml")).unwrap();
    assert!(saved.contains("acme/web:v1"));
    assert_eq!(std::fs::read(snapshot.path().join("db.sqlite3")).unwrap(), b"v1-data");

    let metadata = ctx.store.metadata(&id).await.unwrap();
    assert_eq!(metadata.image.as_deref(), Some("registry.example.com/acme/web:v1"));
    assert_eq!(metadata.data_artifact.as_deref(), Some("db.sqlite3"));
    assert_eq!(app_image(dir.path()), "registry.example.com/acme/web:v2");
}

#[tokio::test]
async fn test_low_disk_aborts_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let env = dir.path().join(".env");
    std::fs::write(&env, "SECRET_KEY=existing\nALLOWED_HOSTS=old\n").unwrap();
    let harness = Harness::new();
    let ctx = harness.context(dir.path(), "v1", 100);

    let result = deploy(&ctx, no_sleep).await;

    assert!(matches!(
        result,
        Err(OrchestratorError::Disk {
            free_mb: 100,
            threshold_mb: 2048
        })
    ));
    assert_eq!(
        std::fs::read_to_string(&env).unwrap(),
        "SECRET_KEY=existing\nALLOWED_HOSTS=old\n"
    );
    assert!(!dir.path().join("docker-compose.yml").exists());
    assert!(!harness.runtime.is_up());
    assert!(!dir.path().join(".rollctl.lock").exists());

    let saved = RunRecord::load(&ctx.options.layout.state_file()).await.unwrap().unwrap();
    assert_eq!(saved.state, DeploymentState::Idle);
    assert!(saved.error.unwrap().contains("disk space"));
}

#[tokio::test]
async fn test_first_deploy_health_failure_has_no_backup() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.healthy.store(false, Ordering::SeqCst);
    let ctx = harness.context(dir.path(), "v1", 10_000);

    let result = deploy(&ctx, no_sleep).await;

    assert!(matches!(result, Err(OrchestratorError::NoSnapshot)));
    let saved = status(&ctx).await.unwrap().unwrap();
    assert_eq!(saved.state, DeploymentState::Failed);
    assert!(!saved.succeeded());
}

#[tokio::test]
async fn test_pull_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    deploy(&harness.context(dir.path(), "v1", 10_000), no_sleep)
        .await
        .unwrap();
    harness.runtime.set_fail_pull(true);

    let record = deploy(&harness.context(dir.path(), "v2", 10_000), no_sleep)
        .await
        .unwrap();

    assert_eq!(record.state, DeploymentState::RolledBack);
    assert!(record.history.contains(&DeploymentState::Pulling));
    assert!(!record.history.contains(&DeploymentState::Stopping));
    assert_eq!(app_image(dir.path()), "registry.example.com/acme/web:v1");
}

#[tokio::test]
async fn test_manual_rollback_and_backup() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let ctx = harness.context(dir.path(), "v1", 10_000);

    let result = rollback(&ctx).await;
    assert!(matches!(result, Err(OrchestratorError::NoSnapshot)));

    deploy(&ctx, no_sleep).await.unwrap();
    harness.runtime.set_data(b"v1-data");

    let record = backup(&ctx).await.unwrap();
    let id = record.snapshot.unwrap();
    for name in ["docker-compose.yml", ".env", "db.sqlite3", "snapshot.json"] {
        assert!(ctx.store.dir(&id).path().join(name).exists(), "{} missing", name);
    }

    harness.runtime.set_data(b"corrupted");
    let record = rollback(&ctx).await.unwrap();
    assert_eq!(record.state, DeploymentState::RolledBack);
    assert_eq!(record.restored, Some(id));
    assert_eq!(harness.runtime.data().unwrap(), b"v1-data");
}

#[tokio::test]
async fn test_concurrent_run_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let ctx = harness.context(dir.path(), "v1", 10_000);

    let holder = serde_json::json!({
        "pid": std::process::id(),
        "hostname": rollctl::utils::hostname(),
        "acquired_at": chrono::Utc::now(),
        "token": "someone-else",
    });
    std::fs::write(dir.path().join(".rollctl.lock"), holder.to_string()).unwrap();

    let result = deploy(&ctx, no_sleep).await;
    assert!(matches!(result, Err(OrchestratorError::Lock(_))));
    assert!(!dir.path().join(".env").exists());
    assert!(dir.path().join(".rollctl.lock").exists());
}

#[tokio::test]
async fn test_backup_then_deploy_in_the_same_second() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    deploy(&harness.context(dir.path(), "v1", 10_000), no_sleep)
        .await
        .unwrap();
    harness.runtime.set_data(b"v1-data");

    let ctx = harness.context(dir.path(), "v2", 10_000);
    let backup_id = backup(&ctx).await.unwrap().snapshot.unwrap();
    let record = deploy(&ctx, no_sleep).await.unwrap();

    assert_eq!(record.state, DeploymentState::Healthy);
    let deploy_id = record.snapshot.unwrap();
    assert!(deploy_id > backup_id);
    assert_eq!(ctx.store.list().await.unwrap(), vec![backup_id, deploy_id]);
    let leftovers = std::fs::read_dir(ctx.store.root().path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".partial"))
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_failed_one_off_commands_are_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.runtime.set_fail_one_off(true);
    let ctx = harness.context(dir.path(), "v1", 10_000);

    let record = deploy(&ctx, no_sleep).await.unwrap();

    assert_eq!(record.state, DeploymentState::Healthy);
    assert!(record.succeeded());
    let stages: Vec<&str> = record.warnings.iter().map(|w| w.stage.as_str()).collect();
    assert!(stages.contains(&"migrate"));
    assert!(stages.contains(&"collectstatic"));
    assert!(record
        .warnings
        .iter()
        .any(|w| w.message.contains("OperationalError")));
}

#[tokio::test]
async fn test_relational_rollback_restores_dump() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let relational = |tag: &str| {
        let mut ctx = harness.context(dir.path(), tag, 10_000);
        ctx.options.topology = TopologyKind::Relational;
        ctx
    };

    deploy(&relational("v1"), no_sleep).await.unwrap();
    harness.runtime.set_db(b"-- v1 rows");

    harness.healthy.store(false, Ordering::SeqCst);
    let ctx = relational("v2");
    let record = deploy(&ctx, no_sleep).await.unwrap();

    assert_eq!(record.state, DeploymentState::RolledBack);
    let id = record.restored.unwrap();
    let metadata = ctx.store.metadata(&id).await.unwrap();
    assert_eq!(metadata.backend, "logical-dump");
    assert_eq!(metadata.data_artifact.as_deref(), Some("dump.sql"));
    assert_eq!(
        std::fs::read(ctx.store.dir(&id).path().join("dump.sql")).unwrap(),
        b"-- v1 rows"
    );

    assert_eq!(harness.runtime.db().unwrap(), b"-- v1 rows");
    let commands = harness.runtime.commands();
    assert!(commands.iter().any(|c| c.starts_with("pg_dump")));
    assert!(commands.iter().any(|c| c.starts_with("pg_isready")));
    assert!(commands.iter().any(|c| c.starts_with("psql")));
    assert_eq!(app_image(dir.path()), "registry.example.com/acme/web:v1");
}

#[tokio::test]
async fn test_topology_change_is_refused_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    deploy(&harness.context(dir.path(), "v1", 10_000), no_sleep)
        .await
        .unwrap();
    let env_before = std::fs::read(dir.path().join(".env")).unwrap();
    let manifest_before = std::fs::read(dir.path().join("docker-compose.yml")).unwrap();

    let mut ctx = harness.context(dir.path(), "v2", 10_000);
    ctx.options.topology = TopologyKind::Relational;
    let result = deploy(&ctx, no_sleep).await;

    assert!(matches!(result, Err(OrchestratorError::TopologyConflict(_))));
    assert_eq!(std::fs::read(dir.path().join(".env")).unwrap(), env_before);
    assert_eq!(std::fs::read(dir.path().join("docker-compose.yml")).unwrap(), manifest_before);
    assert!(ctx.store.list().await.unwrap().is_empty());

    let saved = status(&ctx).await.unwrap().unwrap();
    assert_eq!(saved.state, DeploymentState::Idle);
    assert!(saved.error.is_some());
}

#[tokio::test]
async fn test_rollback_waits_for_published_ports() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut ctx = harness.context(dir.path(), "v1", 10_000);
    ctx.options.template.proxy_ports = vec![port];
    deploy(&ctx, no_sleep).await.unwrap();
    let id = backup(&ctx).await.unwrap().snapshot.unwrap();

    ctx.options.release.port_release_timeout = Duration::from_millis(200);
    ctx.options.release.port_poll_interval = Duration::from_millis(20);
    let starts = harness.runtime.starts();

    // Something still holds the proxy port after stop
    let result = rollback(&ctx).await;
    assert!(matches!(result, Err(OrchestratorError::PortsBusy(ref ports)) if ports == &vec![port]));
    assert_eq!(harness.runtime.starts(), starts);
    assert!(!harness.runtime.is_up());
    let saved = status(&ctx).await.unwrap().unwrap();
    assert_eq!(saved.state, DeploymentState::Failed);

    drop(listener);
    let record = rollback(&ctx).await.unwrap();
    assert_eq!(record.state, DeploymentState::RolledBack);
    assert_eq!(record.restored, Some(id));
    assert_eq!(harness.runtime.starts(), starts + 1);
}
