//! Pre-rollout resource guards

pub mod disk;
