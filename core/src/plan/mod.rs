//! Execution plans and the remote script generated from them.
//!
//! `builder` deals run IDs to slots. `script` turns a plan into the bash
//! script a machine executes and names the files that script writes.

pub mod builder;
pub mod script;

pub use builder::{build, ExecutionPlan, SetupStep, SlotPlan, DEFAULT_SETUP_COMMAND};
pub use script::{render_script, RemoteLayout, ScriptOptions};
