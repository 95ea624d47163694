//! Deployment directory storage

pub mod layout;
pub mod lock;
pub mod settings;
pub mod state;
