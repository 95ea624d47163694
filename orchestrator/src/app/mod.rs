//! Application entry points

pub mod context;
pub mod options;
pub mod run;
