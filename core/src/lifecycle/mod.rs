//! Launching machines: project upload and the launch sequence.

pub mod manager;
pub mod package;

pub use manager::{LifecycleManager, MachineSpec};
pub use package::{MockPackager, Packager, RsyncPackager};
