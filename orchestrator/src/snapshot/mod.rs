//! Snapshot capture and restore

pub mod backend;
pub mod store;
