//! rollctl library
//!
//! Release orchestration for a containerized web service: config
//! reconciliation, manifest rendering, disk guarding, snapshots, rollout,
//! health gating and rollback.

pub mod app;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod guard;
pub mod logs;
pub mod manifest;
pub mod snapshot;
pub mod storage;
pub mod utils;
