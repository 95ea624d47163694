//! Environment configuration

pub mod env_file;
pub mod overrides;
pub mod reconciler;
