//! Command runner abstraction for executing local programs.
//!
//! `CommandRunner` is the trait the control plane, packager and one-shot ssh
//! calls go through. `ProcessRunner` is the production implementation.
//! `MockRunner` is the test double that records calls and returns preset
//! outputs.

use std::collections::VecDeque;
use std::io;
use std::process::Command;
use std::sync::Mutex;

use tracing::debug;

/// Captured result of one finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit status, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: &str) -> Self {
        ProcessOutput {
            status: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: &str) -> Self {
        ProcessOutput {
            status: Some(status),
            stdout: Vec::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Trait for running a program to completion.
pub trait CommandRunner: Send + Sync {
    /// Spawn `program` with `args` and wait for it. An `Err` means the
    /// program could not be started at all.
    fn run(&self, program: &str, args: &[String]) -> io::Result<ProcessOutput>;
}

/// Production runner that spawns the program directly, without a shell.
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<ProcessOutput> {
        debug!(program, ?args, "spawning");
        let output = Command::new(program).args(args).output()?;
        Ok(ProcessOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Test-double runner that records commands and returns pre-configured
/// outputs in order. Once the script runs out it answers with empty success.
pub struct MockRunner {
    responses: Mutex<VecDeque<io::Result<ProcessOutput>>>,
    commands: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockRunner {
    pub fn with_responses(responses: Vec<io::Result<ProcessOutput>>) -> Self {
        MockRunner {
            responses: Mutex::new(responses.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_responses(Vec::new())
    }

    pub fn push_response(&self, response: io::Result<ProcessOutput>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response);
        }
    }

    /// Every call so far as `(program, args)`.
    pub fn executed_commands(&self) -> Vec<(String, Vec<String>)> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<ProcessOutput> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push((program.to_string(), args.to_vec()));
        }
        let next = self.responses.lock().ok().and_then(|mut r| r.pop_front());
        next.unwrap_or_else(|| Ok(ProcessOutput::ok("")))
    }
}
