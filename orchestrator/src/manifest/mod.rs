//! Service topology manifest

pub mod generator;
pub mod model;
