//! FSM unit tests

use rollctl::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use rollctl::errors::OrchestratorError;

fn advance_to_health_check(fsm: &mut DeploymentFsm) {
    for event in [
        DeploymentEvent::Reconcile,
        DeploymentEvent::GuardDisk,
        DeploymentEvent::Snapshot,
        DeploymentEvent::Pull,
        DeploymentEvent::Stop,
        DeploymentEvent::Start,
        DeploymentEvent::Migrate,
        DeploymentEvent::CheckHealth,
    ] {
        fsm.process(event).unwrap();
    }
}

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Idle);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history(), &[DeploymentState::Idle]);
}

#[test]
fn test_fsm_health_failure_then_rollback() {
    let mut fsm = DeploymentFsm::new();
    advance_to_health_check(&mut fsm);

    // HealthChecking -> Failed
    fsm.process(DeploymentEvent::Fail("health check failed".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentState::Failed);

    // Failed -> RollingBack -> RolledBack
    fsm.process(DeploymentEvent::RollBack {
        snapshot_available: true,
    })
    .unwrap();
    assert_eq!(fsm.state(), DeploymentState::RollingBack);
    fsm.process(DeploymentEvent::RollbackComplete).unwrap();
    assert_eq!(fsm.state(), DeploymentState::RolledBack);
    assert_eq!(fsm.error(), Some("health check failed"));
}

#[test]
fn test_fsm_rollback_refused_without_snapshot() {
    let mut fsm = DeploymentFsm::new();
    advance_to_health_check(&mut fsm);
    fsm.process(DeploymentEvent::Fail("timeout".to_string()))
        .unwrap();

    let result = fsm.process(DeploymentEvent::RollBack {
        snapshot_available: false,
    });
    assert!(matches!(result, Err(OrchestratorError::NoSnapshot)));
    assert_eq!(fsm.state(), DeploymentState::Failed);
}

#[test]
fn test_fsm_abort_before_mutation_returns_to_idle() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Reconcile).unwrap();
    fsm.process(DeploymentEvent::GuardDisk).unwrap();

    fsm.process(DeploymentEvent::Abort("disk full".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentState::Idle);
    assert_eq!(fsm.error(), Some("disk full"));
}

#[test]
fn test_fsm_fail_not_allowed_before_rollout() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Reconcile).unwrap();

    let result = fsm.process(DeploymentEvent::Fail("too early".to_string()));
    assert!(matches!(result, Err(OrchestratorError::InvalidTransition(_))));
    assert_eq!(fsm.state(), DeploymentState::Reconciling);
}

#[test]
fn test_fsm_rollback_failure_returns_to_failed() {
    let mut fsm = DeploymentFsm::from_state(DeploymentState::Failed);
    fsm.process(DeploymentEvent::RollBack {
        snapshot_available: true,
    })
    .unwrap();

    fsm.process(DeploymentEvent::Fail("restore failed".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentState::Failed);
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeploymentFsm::new();

    // Cannot skip straight to pulling
    let result = fsm.process(DeploymentEvent::Pull);
    assert!(result.is_err());
    assert_eq!(fsm.state(), DeploymentState::Idle);

    // Rollback only from Failed
    let result = fsm.process(DeploymentEvent::RollBack {
        snapshot_available: true,
    });
    assert!(result.is_err());
}

#[test]
fn test_fsm_reset_after_terminal_state() {
    let mut fsm = DeploymentFsm::new();
    advance_to_health_check(&mut fsm);
    fsm.process(DeploymentEvent::Pass).unwrap();
    assert!(fsm.state().is_terminal());

    fsm.process(DeploymentEvent::Reset).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Idle);
}

#[test]
fn test_state_serializes_snake_case() {
    let json = serde_json::to_string(&DeploymentState::HealthChecking).unwrap();
    assert_eq!(json, "\"health_checking\"");
}
