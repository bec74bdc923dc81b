//! Shared data types: settings sections and the per-machine model.

pub mod config;
pub mod machine;
