//! Rollout, health gating and rollback

pub mod compose;
pub mod fsm;
pub mod health;
pub mod release;
pub mod rollback;
pub mod runtime;
