//! Operation drivers: deploy, rollback, backup, snapshots, status

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app::context::DeploymentContext;
use crate::config::overrides::{allowed_hosts, computed_overrides, discover_public_address, required_defaults};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use crate::deploy::health::await_healthy;
use crate::deploy::release::ReleaseController;
use crate::errors::{OrchestratorError, Warnings};
use crate::manifest::model::DeploymentTarget;
use crate::snapshot::store::{SnapshotId, SnapshotMetadata};
use crate::storage::lock::DeploymentLock;
use crate::storage::state::{Operation, RunRecord};
use crate::utils::hostname;

/// Deploy the configured target.
///
/// Returns the record of a run that ended `Healthy` or `RolledBack`. Any other
/// outcome is returned as the fatal error, after the record has been saved.
pub async fn deploy<S, F>(ctx: &DeploymentContext, sleep_fn: S) -> Result<RunRecord, OrchestratorError>
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    let mut warnings = Warnings::new();
    let lock = acquire_lock(ctx, &mut warnings).await?;

    let mut record = RunRecord::new(Operation::Deploy);
    record.topology = Some(ctx.options.topology);
    let mut fsm = DeploymentFsm::new();

    let result = match run_deploy(ctx, &mut fsm, &mut record, &mut warnings, sleep_fn).await {
        Ok(()) => Ok(()),
        Err(e) if fsm.state().is_preparation() => {
            error!("Deploy aborted before any change: {}", e);
            fsm.process(DeploymentEvent::Abort(e.to_string()))?;
            Err(e)
        }
        Err(e) => recover(ctx, &mut fsm, &mut record, &mut warnings, e).await,
    };

    record.state = fsm.state();
    record.history = fsm.history().to_vec();
    record.error = fsm.error().map(str::to_string);
    finish(ctx, record, warnings, lock, result).await
}

async fn run_deploy<S, F>(
    ctx: &DeploymentContext,
    fsm: &mut DeploymentFsm,
    record: &mut RunRecord,
    warnings: &mut Warnings,
    sleep_fn: S,
) -> Result<(), OrchestratorError>
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    let options = &ctx.options;
    let layout = &options.layout;

    fsm.process(DeploymentEvent::Reconcile)?;
    ctx.runtime.ensure_available().await?;
    if let Some(credentials) = &options.credentials {
        ctx.runtime.login(credentials).await?;
    }

    let target = DeploymentTarget::new(
        options.target.registry.clone(),
        options.target.repository.clone(),
        options.target.tag.clone(),
    )?;
    record.image = Some(target.image_ref());
    info!("Deploying {} ({} persistence)", target.image_ref(), options.topology);

    let generator = ctx.generator();
    let live = ctx.live_manifest().await?;
    let previous_topology = live
        .as_ref()
        .and_then(|m| m.topology(&options.template))
        .unwrap_or(options.topology);
    if options.allow_topology_change {
        if previous_topology != options.topology {
            warnings.push(
                "reconcile",
                format!("switching persistence from {} to {}", previous_topology, options.topology),
            );
        }
    } else {
        let bind_data = options.template.bind_data_path(&layout.base_dir);
        generator.check_topology(live.as_ref(), options.topology, bind_data.is_file())?;
    }

    let public_address = match &options.public_address_url {
        Some(url) => match discover_public_address(url).await {
            Ok(address) => Some(address),
            Err(e) => {
                warnings.push("reconcile", format!("public address discovery failed: {}", e));
                None
            }
        },
        None => None,
    };
    let hosts = allowed_hosts(
        hostname().as_deref(),
        public_address.as_deref(),
        &options.extra_allowed_hosts,
    );

    let reconciler = ctx.reconciler();
    let reconciliation = reconciler
        .prepare(
            &required_defaults(),
            &computed_overrides(options.topology, &options.template, &hosts),
        )
        .await?;
    warnings.extend(reconciliation.warnings.clone());

    let manifest = generator.render(&target, options.topology);
    let manifest_yaml = manifest.to_yaml()?;

    fsm.process(DeploymentEvent::GuardDisk)?;
    ctx.disk_guard
        .ensure_free_space(&options.disk.guard.root, options.disk.guard.threshold_mb, warnings)
        .await?;

    fsm.process(DeploymentEvent::Snapshot)?;
    let backend = ctx.backend(previous_topology);
    record.snapshot = ctx
        .store
        .capture(
            ctx.runtime.as_ref(),
            &layout.manifest_file(),
            &layout.env_file(),
            backend.as_ref(),
            warnings,
        )
        .await?;

    // Live files change from here on
    fsm.process(DeploymentEvent::Pull)?;
    reconciler.commit(&reconciliation).await?;
    layout.manifest_file().write_atomic(manifest_yaml.as_bytes()).await?;

    ReleaseController::new(ctx.runtime.as_ref(), &options.release)
        .rollout(fsm, &manifest.published_ports(), warnings)
        .await?;

    fsm.process(DeploymentEvent::CheckHealth)?;
    await_healthy(ctx.probe.as_ref(), &options.health, sleep_fn).await?;
    fsm.process(DeploymentEvent::Pass)?;
    info!("{} is healthy", target.image_ref());

    prune_after_success(ctx, warnings).await;
    Ok(())
}

/// Roll back after a failure that happened once live files were changed
async fn recover(
    ctx: &DeploymentContext,
    fsm: &mut DeploymentFsm,
    record: &mut RunRecord,
    warnings: &mut Warnings,
    cause: OrchestratorError,
) -> Result<(), OrchestratorError> {
    error!("Deploy failed in {:?}: {}", fsm.state(), cause);
    fsm.process(DeploymentEvent::Fail(cause.to_string()))?;

    let snapshot_available = ctx.store.latest().await?.is_some();
    match fsm.process(DeploymentEvent::RollBack { snapshot_available }) {
        Ok(_) => {}
        Err(OrchestratorError::NoSnapshot) => {
            error!("{}, leaving the failed release in place", OrchestratorError::NoSnapshot);
            warnings.push("rollback", format!("not rolled back: {}", cause));
            return Err(OrchestratorError::NoSnapshot);
        }
        Err(e) => return Err(e),
    }

    let controller = ctx.rollback_controller();
    match controller.rollback(warnings).await {
        Ok(id) => {
            record.restored = Some(id);
            fsm.process(DeploymentEvent::RollbackComplete)?;
            warn!("Deploy failed and was rolled back: {}", cause);
            Ok(())
        }
        Err(e) => {
            error!("Rollback failed: {}", e);
            fsm.process(DeploymentEvent::Fail(format!("{}; rollback failed: {}", cause, e)))?;
            Err(e)
        }
    }
}

/// Drop snapshots beyond retention and unused runtime artifacts
async fn prune_after_success(ctx: &DeploymentContext, warnings: &mut Warnings) {
    match ctx.store.prune(ctx.options.disk.snapshot_retention).await {
        Ok(pruned) if !pruned.is_empty() => info!("Pruned {} old snapshot(s)", pruned.len()),
        Ok(_) => {}
        Err(e) => warnings.push("prune", format!("snapshot pruning failed: {}", e)),
    }
    if let Err(e) = ctx.runtime.prune().await {
        warnings.push("prune", format!("runtime pruning failed: {}", e));
    }
}

/// Restore the newest snapshot on operator request
pub async fn rollback(ctx: &DeploymentContext) -> Result<RunRecord, OrchestratorError> {
    let mut warnings = Warnings::new();
    let lock = acquire_lock(ctx, &mut warnings).await?;

    let mut record = RunRecord::new(Operation::Rollback);
    // An operator asking for a rollback declares the live release failed
    let mut fsm = DeploymentFsm::from_state(DeploymentState::Failed);

    let result = async {
        ctx.runtime.ensure_available().await?;
        let snapshot_available = ctx.store.latest().await?.is_some();
        fsm.process(DeploymentEvent::RollBack { snapshot_available })?;

        match ctx.rollback_controller().rollback(&mut warnings).await {
            Ok(id) => {
                record.restored = Some(id);
                fsm.process(DeploymentEvent::RollbackComplete)?;
                Ok(())
            }
            Err(e) => {
                fsm.process(DeploymentEvent::Fail(e.to_string()))?;
                Err(e)
            }
        }
    }
    .await;

    record.state = fsm.state();
    record.history = fsm.history().to_vec();
    record.error = result.as_ref().err().map(|e| e.to_string());
    finish(ctx, record, warnings, lock, result).await
}

/// Snapshot the running deployment without changing it
pub async fn backup(ctx: &DeploymentContext) -> Result<RunRecord, OrchestratorError> {
    let mut warnings = Warnings::new();
    let lock = acquire_lock(ctx, &mut warnings).await?;

    let mut record = RunRecord::new(Operation::Backup);
    let result = async {
        ctx.runtime.ensure_available().await?;
        let topology = ctx.live_topology().await?;
        record.topology = Some(topology);
        let backend = ctx.backend(topology);
        let layout = &ctx.options.layout;

        record.snapshot = ctx
            .store
            .capture(
                ctx.runtime.as_ref(),
                &layout.manifest_file(),
                &layout.env_file(),
                backend.as_ref(),
                &mut warnings,
            )
            .await?;
        if record.snapshot.is_none() {
            warnings.push("snapshot", "service group is not running, nothing captured");
        }
        Ok::<(), OrchestratorError>(())
    }
    .await;

    record.error = result.as_ref().err().map(|e| e.to_string());
    finish(ctx, record, warnings, lock, result).await
}

/// A snapshot and its metadata, if readable
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub id: SnapshotId,
    pub metadata: Option<SnapshotMetadata>,
}

/// Every complete snapshot, oldest first
pub async fn list_snapshots(ctx: &DeploymentContext) -> Result<Vec<SnapshotEntry>, OrchestratorError> {
    let mut entries = Vec::new();
    for id in ctx.store.list().await? {
        let metadata = ctx.store.metadata(&id).await.ok();
        entries.push(SnapshotEntry { id, metadata });
    }
    Ok(entries)
}

/// Record of the last run
pub async fn status(ctx: &DeploymentContext) -> Result<Option<RunRecord>, OrchestratorError> {
    RunRecord::load(&ctx.options.layout.state_file()).await
}

async fn acquire_lock(ctx: &DeploymentContext, warnings: &mut Warnings) -> Result<DeploymentLock, OrchestratorError> {
    let layout = &ctx.options.layout;
    layout.setup().await?;
    DeploymentLock::acquire(
        layout.lock_file(),
        ctx.options.lock_stale_after,
        ctx.options.force,
        warnings,
    )
    .await
}

/// Persist the record and release the lock on every exit path
async fn finish(
    ctx: &DeploymentContext,
    mut record: RunRecord,
    warnings: Warnings,
    lock: DeploymentLock,
    result: Result<(), OrchestratorError>,
) -> Result<RunRecord, OrchestratorError> {
    record.warnings = warnings.into_vec();
    if let Err(e) = record.save(&ctx.options.layout.state_file()).await {
        error!("Failed to save run record: {}", e);
    }
    if let Err(e) = lock.release().await {
        error!("Failed to release deployment lock: {}", e);
    }
    result.map(|()| record)
}
