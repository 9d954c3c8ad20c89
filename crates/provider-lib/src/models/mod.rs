//! Core data models for the provider

mod container_group;
mod monitor;
mod stats;

pub use container_group::*;
pub use monitor::*;
pub use stats::*;
