//! The machine model: lifecycle state, slots and per-run records.
//!
//! `Machine` owns its lifecycle state and enforces the transition table. The
//! durable state (the last state that is not `Unreachable`) is kept alongside
//! so a successful poll can put the machine back where it was.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::plan::ExecutionPlan;


// ---------------------------------------------------------------------------
// LifecycleState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Launch requested; the control plane has not reported it running yet.
    Requested,
    /// Running according to the control plane, script not observed yet.
    Provisioning,
    /// The remote script is installing dependencies.
    Setup,
    RunningExperiments,
    /// Work is over (or setup failed); the host is powering down.
    ShuttingDown,
    Terminated,
    /// Polling has failed repeatedly. A diagnosis, not a phase.
    Unreachable,
}

impl LifecycleState {
    /// Position in the forward chain. `None` for `Unreachable`.
    fn rank(self) -> Option<u8> {
        match self {
            LifecycleState::Requested => Some(0),
            LifecycleState::Provisioning => Some(1),
            LifecycleState::Setup => Some(2),
            LifecycleState::RunningExperiments => Some(3),
            LifecycleState::ShuttingDown => Some(4),
            LifecycleState::Terminated => Some(5),
            LifecycleState::Unreachable => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Terminated
    }

    pub fn is_durable(self) -> bool {
        self != LifecycleState::Unreachable
    }

    /// Whether the host is (or may still be) doing work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            LifecycleState::Requested
                | LifecycleState::Provisioning
                | LifecycleState::Setup
                | LifecycleState::RunningExperiments
        )
    }

    /// The transition table between durable states. `Unreachable` is entered
    /// and left through [`Machine::mark_unreachable`] and [`Machine::restore`],
    /// except for the direct `Unreachable -> Terminated` edge.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (Terminated, _) => false,
            (Unreachable, Terminated) => true,
            (Unreachable, _) | (_, Unreachable) => false,
            (from, ShuttingDown) => from.is_active(),
            (ShuttingDown, Terminated) => true,
            (from, to) => match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b == a + 1 && to != Terminated,
                _ => false,
            },
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LifecycleState::Requested => "requested",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Setup => "setup",
            LifecycleState::RunningExperiments => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}


// ---------------------------------------------------------------------------
// Runs and slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn from_exit_code(code: i32) -> RunStatus {
        if code == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

/// What is known about one run of the experiment command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub slot: u32,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    /// Identifier the experiment prints about itself. May never show up.
    pub experiment_id: Option<u64>,
    /// Latest progress line seen in the run's output.
    pub last_line: Option<String>,
}

/// One execution lane on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub index: u32,
    pub assigned_run_indices: Vec<u32>,
    pub current_run_id: Option<u32>,
    pub run_status: RunStatus,
}

impl Slot {
    pub fn is_finished(&self) -> bool {
        self.run_status.is_finished() && self.current_run_id == self.assigned_run_indices.last().copied()
    }
}


// ---------------------------------------------------------------------------
// Host stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStat {
    pub index: u32,
    pub utilization_pct: u32,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

/// Load and GPU usage sampled during the last successful poll.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostStats {
    pub load_1m: Option<f64>,
    pub gpus: Vec<GpuStat>,
}


// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub instance_id: String,
    pub launched_at: DateTime<Utc>,
    /// Address the monitor opens sessions to, once the control plane has one.
    pub address: Option<String>,
    pub plan: ExecutionPlan,
    pub slots: Vec<Slot>,
    pub runs: BTreeMap<u32, RunRecord>,
    pub setup_exit: Option<i32>,
    pub setup_failed: bool,
    pub host_stats: Option<HostStats>,
    state: LifecycleState,
    durable_state: LifecycleState,
}

impl Machine {
    /// A freshly requested machine with every run pending.
    pub fn new(
        name: &str,
        instance_id: &str,
        launched_at: DateTime<Utc>,
        plan: ExecutionPlan,
    ) -> Machine {
        let slots = plan
            .slots
            .iter()
            .map(|s| Slot {
                index: s.slot,
                assigned_run_indices: s.run_ids.clone(),
                current_run_id: s.run_ids.first().copied(),
                run_status: RunStatus::Pending,
            })
            .collect();
        let runs = plan
            .slots
            .iter()
            .flat_map(|s| {
                s.run_ids.iter().map(move |&run| {
                    (
                        run,
                        RunRecord {
                            slot: s.slot,
                            status: RunStatus::Pending,
                            exit_code: None,
                            experiment_id: None,
                            last_line: None,
                        },
                    )
                })
            })
            .collect();
        Machine {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            launched_at,
            address: None,
            plan,
            slots,
            runs,
            setup_exit: None,
            setup_failed: false,
            host_stats: None,
            state: LifecycleState::Requested,
            durable_state: LifecycleState::Requested,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The last state that was not `Unreachable`.
    pub fn durable_state(&self) -> LifecycleState {
        self.durable_state
    }

    /// Move to `to` if the transition table allows it. Re-entering the
    /// current state is a no-op.
    pub fn transition(&mut self, to: LifecycleState) -> Result<(), TransitionError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.durable_state = to;
        Ok(())
    }

    /// Diagnose the machine as unreachable. Returns whether the state
    /// changed. A terminated machine is never marked.
    pub fn mark_unreachable(&mut self) -> Result<bool, TransitionError> {
        match self.state {
            LifecycleState::Terminated => Err(TransitionError {
                from: LifecycleState::Terminated,
                to: LifecycleState::Unreachable,
            }),
            LifecycleState::Unreachable => Ok(false),
            _ => {
                self.state = LifecycleState::Unreachable;
                Ok(true)
            }
        }
    }

    /// Leave the `Unreachable` diagnosis for the last durable state.
    /// Returns the state the machine is now in.
    pub fn restore(&mut self) -> LifecycleState {
        if self.state == LifecycleState::Unreachable {
            self.state = self.durable_state;
        }
        self.state
    }

    pub fn record_setup_exit(&mut self, code: i32) {
        self.setup_exit = Some(code);
        self.setup_failed = code != 0;
    }

    /// Mark a run as started. Finished runs are left alone.
    pub fn record_run_started(&mut self, run: u32) {
        if let Some(record) = self.runs.get_mut(&run) {
            if record.status == RunStatus::Pending {
                record.status = RunStatus::Running;
            }
        }
        self.refresh_slots();
    }

    pub fn record_run_exit(&mut self, run: u32, code: i32) {
        if let Some(record) = self.runs.get_mut(&run) {
            record.exit_code = Some(code);
            record.status = RunStatus::from_exit_code(code);
        }
        self.refresh_slots();
    }

    pub fn all_runs_finished(&self) -> bool {
        !self.runs.is_empty() && self.runs.values().all(|r| r.status.is_finished())
    }

    /// Recompute each slot's current run and status from the run records.
    /// A slot points at its first unfinished run; once all are done it
    /// points at its last run and reports `Failed` if any run failed.
    fn refresh_slots(&mut self) {
        for slot in &mut self.slots {
            let next = slot
                .assigned_run_indices
                .iter()
                .copied()
                .find(|run| !self.runs.get(run).is_some_and(|r| r.status.is_finished()));
            match next {
                Some(run) => {
                    slot.current_run_id = Some(run);
                    slot.run_status = self
                        .runs
                        .get(&run)
                        .map(|r| r.status)
                        .unwrap_or(RunStatus::Pending);
                }
                None => {
                    slot.current_run_id = slot.assigned_run_indices.last().copied();
                    let any_failed = slot
                        .assigned_run_indices
                        .iter()
                        .any(|run| self.runs.get(run).is_some_and(|r| r.status == RunStatus::Failed));
                    slot.run_status = if any_failed {
                        RunStatus::Failed
                    } else {
                        RunStatus::Completed
                    };
                }
            }
        }
    }

    /// Experiment id announced by a run's output. The latest announcement wins.
    pub fn set_experiment_id(&mut self, run: u32, id: u64) {
        if let Some(record) = self.runs.get_mut(&run) {
            record.experiment_id = Some(id);
        }
    }

    pub fn set_last_line(&mut self, run: u32, line: String) {
        if let Some(record) = self.runs.get_mut(&run) {
            record.last_line = Some(line);
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
