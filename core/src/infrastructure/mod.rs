//! Process execution backends.
//!
//! Everything that shells out (the cloud CLI, rsync, one-shot ssh calls) goes
//! through [`runner::CommandRunner`] so tests can script the results.

pub mod runner;

pub use runner::{CommandRunner, MockRunner, ProcessOutput, ProcessRunner};
