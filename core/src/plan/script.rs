//! Render an execution plan into the bash script the machine runs.
//!
//! The script runs from the remote home directory and keeps everything under
//! one working directory (see [`RemoteLayout`]). Exit codes are written via a
//! temp file and `mv` so a reader never sees a half-written code.

use crate::types::config::{LaunchConfig, SetupFailurePolicy};

use super::builder::ExecutionPlan;


// ---------------------------------------------------------------------------
// RemoteLayout
// ---------------------------------------------------------------------------

/// File locations on the machine, relative to the remote home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    workdir: String,
}

impl RemoteLayout {
    pub fn new(workdir: &str) -> Self {
        RemoteLayout {
            workdir: workdir.trim_end_matches('/').to_string(),
        }
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn script(&self) -> String {
        format!("{}/run.sh", self.workdir)
    }

    /// Uploaded project tree; commands run from here.
    pub fn project(&self) -> String {
        format!("{}/project", self.workdir)
    }

    pub fn started_marker(&self) -> String {
        format!("{}/started", self.workdir)
    }

    pub fn shutdown_marker(&self) -> String {
        format!("{}/shutdown", self.workdir)
    }

    pub fn setup_log(&self) -> String {
        format!("{}/setup.log", self.workdir)
    }

    pub fn setup_exit(&self) -> String {
        format!("{}/setup.exit", self.workdir)
    }

    pub fn runs_dir(&self) -> String {
        format!("{}/runs", self.workdir)
    }

    pub fn run_log(&self, slot: u32, run: u32) -> String {
        format!("{}/slot{}_run{}.log", self.runs_dir(), slot, run)
    }

    pub fn run_exit(&self, slot: u32, run: u32) -> String {
        format!("{}/slot{}_run{}.exit", self.runs_dir(), slot, run)
    }
}


// ---------------------------------------------------------------------------
// Script rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScriptOptions {
    pub workdir: String,
    pub setup_failure: SetupFailurePolicy,
    pub power_off: bool,
}

impl From<&LaunchConfig> for ScriptOptions {
    fn from(config: &LaunchConfig) -> Self {
        ScriptOptions {
            workdir: config.remote_workdir.clone(),
            setup_failure: config.setup_failure,
            power_off: config.power_off,
        }
    }
}

/// Produce the full script for `plan`.
pub fn render_script(plan: &ExecutionPlan, opts: &ScriptOptions) -> String {
    let layout = RemoteLayout::new(&opts.workdir);
    let mut out = String::new();

    out.push_str("#!/bin/bash\n");
    out.push_str(&format!(
        "# fleetlab: {} run(s) over {} slot(s)\n",
        plan.repeats, plan.parallelism
    ));
    out.push_str("cd \"$HOME\"\n");
    out.push_str(&format!("mkdir -p {}\n", layout.runs_dir()));
    out.push_str(&format!("date -u +%FT%TZ > {}\n\n", layout.started_marker()));

    out.push_str("record_exit() {\n");
    out.push_str("    echo \"$1\" > \"$2.tmp\" && mv \"$2.tmp\" \"$2\"\n");
    out.push_str("}\n\n");

    out.push_str("finish() {\n");
    out.push_str(&format!("    touch {}\n", layout.shutdown_marker()));
    if opts.power_off {
        out.push_str("    sudo shutdown -h now\n");
    }
    out.push_str("}\n\n");

    out.push_str("# setup, once\n");
    out.push_str(&format!(
        "(cd {} && {}) > {} 2>&1\n",
        layout.project(),
        plan.setup.command,
        layout.setup_log()
    ));
    out.push_str("code=$?\n");
    out.push_str(&format!("record_exit $code {}\n", layout.setup_exit()));
    out.push_str("if [ $code -ne 0 ]; then\n");
    match opts.setup_failure {
        SetupFailurePolicy::PowerOff => out.push_str("    finish\n"),
        SetupFailurePolicy::KeepForDebugging => {
            out.push_str("    # left running for inspection\n");
        }
    }
    out.push_str("    exit $code\n");
    out.push_str("fi\n\n");

    for slot in &plan.slots {
        let runs: Vec<String> = slot.run_ids.iter().map(|r| r.to_string()).collect();
        out.push_str(&format!("slot_{}() {{\n", slot.slot));
        out.push_str(&format!("    export FLEETLAB_SLOT={}\n", slot.slot));
        out.push_str(&format!("    for run in {}; do\n", runs.join(" ")));
        out.push_str("        export FLEETLAB_RUN_ID=$run\n");
        out.push_str(&format!(
            "        (cd {} && {}) > {}/slot{}_run${{run}}.log 2>&1\n",
            layout.project(),
            plan.command,
            layout.runs_dir(),
            slot.slot
        ));
        out.push_str(&format!(
            "        record_exit $? {}/slot{}_run${{run}}.exit\n",
            layout.runs_dir(),
            slot.slot
        ));
        out.push_str("    done\n");
        out.push_str("}\n\n");
    }

    for slot in &plan.slots {
        out.push_str(&format!("slot_{} &\n", slot.slot));
    }
    out.push_str("wait\n");
    out.push_str("finish\n");
    out
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
