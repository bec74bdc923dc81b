//! One machine, one poll.
//!
//! `MachinePoller::poll` runs the strictly ordered steps for a single
//! machine: ask the control plane, open a session, probe the script's state,
//! mirror new log output, then evaluate lifecycle transitions. Every failure
//! is recorded in the returned [`PollReport`]; none of them escapes the poll.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::control::{ControlPlane, InstanceStatus};
use crate::error::{FleetError, SessionError};
use crate::logsync::{LogSynchronizer, StreamId, StreamKind};
use crate::plan::RemoteLayout;
use crate::remote::{ConnectionHealth, OutputLine, Session, StreamEnd, Transport};
use crate::types::config::{MonitorConfig, SetupFailurePolicy};
use crate::types::machine::{LifecycleState, Machine};

use super::output::{extract_experiment_id, extract_last_line, latest_experiment_id};
use super::probe::{fetch_command, parse_status, status_command, RemoteReport};

/// Bytes of persisted log read back to recover a run's last line.
const LAST_LINE_WINDOW: u64 = 2048;


// ---------------------------------------------------------------------------
// Tracked machine
// ---------------------------------------------------------------------------

/// Outcome of the single log pull made when a machine stops working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FinalSync {
    Pending,
    Done,
    Failed(String),
}

/// A machine plus what the monitor remembers about reaching it.
#[derive(Debug, Clone)]
pub struct TrackedMachine {
    pub machine: Machine,
    pub health: ConnectionHealth,
    pub final_sync: FinalSync,
    pub final_sync_attempts: u32,
    pub last_error: Option<String>,
    history_scanned: bool,
}

impl TrackedMachine {
    pub fn new(machine: Machine) -> Self {
        TrackedMachine {
            machine,
            health: ConnectionHealth::new(),
            final_sync: FinalSync::Pending,
            final_sync_attempts: 0,
            last_error: None,
            history_scanned: false,
        }
    }

    /// Terminated and its final logs pulled (or given up on).
    pub fn is_released(&self) -> bool {
        self.machine.state().is_terminal() && self.final_sync != FinalSync::Pending
    }
}

/// What one poll of one machine did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub machine: String,
    pub transitions: Vec<(LifecycleState, LifecycleState)>,
    pub bytes_synced: u64,
    pub errors: Vec<String>,
    pub released: bool,
}

impl PollReport {
    fn new(machine: &str) -> Self {
        PollReport {
            machine: machine.to_string(),
            ..PollReport::default()
        }
    }
}


// ---------------------------------------------------------------------------
// MachinePoller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MachinePoller {
    control: Arc<dyn ControlPlane>,
    transport: Arc<dyn Transport>,
    logs: LogSynchronizer,
    layout: RemoteLayout,
    config: MonitorConfig,
    prefer_public: bool,
}

impl MachinePoller {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        transport: Arc<dyn Transport>,
        config: MonitorConfig,
    ) -> Self {
        MachinePoller {
            control,
            transport,
            logs: LogSynchronizer::new(&config.logs_root),
            layout: RemoteLayout::new(&config.remote_workdir),
            config,
            prefer_public: false,
        }
    }

    pub fn prefer_public_address(mut self, prefer: bool) -> Self {
        self.prefer_public = prefer;
        self
    }

    pub fn logs(&self) -> &LogSynchronizer {
        &self.logs
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn poll(&self, t: &mut TrackedMachine) -> PollReport {
        let mut report = PollReport::new(&t.machine.name);
        if t.machine.state().is_terminal() {
            report.released = t.is_released();
            return report;
        }

        let info = match self.control.describe(&t.machine.instance_id) {
            Ok(info) => info,
            Err(e) => {
                warn!(machine = %t.machine.name, error = %e, "control plane poll failed, keeping last state");
                report.errors.push(e.to_string());
                return report;
            }
        };
        if let Some(addr) = info.as_ref().and_then(|i| i.address(self.prefer_public)) {
            t.machine.address = Some(addr.to_string());
        }

        match info.map(|i| i.status) {
            None | Some(InstanceStatus::Terminated) => {
                if t.machine.state() == LifecycleState::Unreachable {
                    self.final_sync(t, None, &mut report);
                } else {
                    self.begin_shutdown(t, None, &mut report);
                }
                self.move_to(t, LifecycleState::Terminated, &mut report);
                report.released = t.is_released();
                return report;
            }
            Some(status) if status.is_stopped() => {
                if t.machine.state() == LifecycleState::RunningExperiments {
                    info!(machine = %t.machine.name, "host stopped on its own");
                }
                self.begin_shutdown(t, None, &mut report);
                return report;
            }
            Some(InstanceStatus::Pending) => return report,
            Some(_) => {}
        }

        if t.machine.state() == LifecycleState::Requested {
            self.move_to(t, LifecycleState::Provisioning, &mut report);
        }
        if t.machine.state() == LifecycleState::ShuttingDown {
            // Waiting for the control plane to confirm termination.
            self.final_sync(t, None, &mut report);
            return report;
        }

        let Some(host) = t.machine.address.clone() else {
            report.errors.push("no address known yet".into());
            return report;
        };
        let session =
            match Session::open_with_retry(Arc::clone(&self.transport), &host, &self.config.connect_retry) {
                Ok(session) => session,
                Err(e) => {
                    self.note_failure(t, &e, &mut report);
                    return report;
                }
            };
        t.health.record_success(now_ms());
        t.last_error = None;
        self.restore(t, &mut report);

        match self.pull(t, &session, false, &mut report) {
            Ok(remote) => {
                self.advance(t, &remote, &mut report);
                if t.machine.state() == LifecycleState::ShuttingDown {
                    self.final_sync(t, Some(&session), &mut report);
                }
            }
            Err(FleetError::Session(e)) => self.note_failure(t, &e, &mut report),
            Err(e) => {
                warn!(machine = %t.machine.name, error = %e, "log sync failed");
                t.last_error = Some(e.to_string());
                report.errors.push(e.to_string());
            }
        }
        report
    }

    /// Probe the machine, fold the report into its run records and mirror
    /// every stream that grew. A stream whose writer has exited, or any
    /// stream on the `final_pass`, is mirrored through its last partial line.
    fn pull(
        &self,
        t: &mut TrackedMachine,
        session: &Session,
        final_pass: bool,
        report: &mut PollReport,
    ) -> Result<RemoteReport, FleetError> {
        let status = session.run_to_end(&status_command(&self.layout))?;
        let remote = parse_status(&status.text());
        apply_report(&mut t.machine, &remote);

        if !t.history_scanned {
            self.scan_history(&mut t.machine)?;
            t.history_scanned = true;
        }

        for stream in t.machine.plan.expected_streams() {
            let Some(size) = remote.size_of(stream) else {
                continue;
            };
            let id = StreamId::new(&t.machine.name, stream);
            let offset = self.logs.persisted_offset(&id)?;
            if size <= offset {
                continue;
            }
            let mut handle = session.run(&fetch_command(&self.layout, stream, offset))?;
            let lines: Vec<OutputLine> = handle.by_ref().collect();
            let end = handle.finish();

            report.bytes_synced += if final_pass || remote.has_exited(stream) {
                self.logs.sync_final(&id, offset, &lines)?
            } else {
                self.logs.sync(&id, offset, &lines)?
            };
            read_output(&mut t.machine, stream, &lines);

            match end {
                StreamEnd::Exited(_) => {}
                StreamEnd::SessionLost(reason) => {
                    return Err(SessionError::SessionLost { host: session.host().into(), reason }.into())
                }
                StreamEnd::HostUnreachable(reason) => {
                    return Err(SessionError::HostUnreachable { host: session.host().into(), reason }.into())
                }
            }
        }
        Ok(remote)
    }

    /// First pass over a machine: recover experiment ids and last lines
    /// from what an earlier monitor already mirrored.
    fn scan_history(&self, machine: &mut Machine) -> Result<(), FleetError> {
        for stream in machine.plan.expected_streams() {
            let StreamKind::Run { run, .. } = stream else {
                continue;
            };
            let id = StreamId::new(&machine.name, stream);
            let persisted = self.logs.read_persisted(&id)?;
            if persisted.is_empty() {
                continue;
            }
            if let Some(exp) = latest_experiment_id(&persisted) {
                machine.set_experiment_id(run, exp);
            }
            let tail = self.logs.read_tail(&id, LAST_LINE_WINDOW)?;
            if let Some(line) = extract_last_line(&tail) {
                machine.set_last_line(run, line);
            }
        }
        Ok(())
    }

    /// Apply every transition the report justifies, in order.
    fn advance(&self, t: &mut TrackedMachine, remote: &RemoteReport, report: &mut PollReport) {
        use LifecycleState::*;
        loop {
            let next = match t.machine.state() {
                Provisioning if remote.started || remote.setup_exit.is_some() => Some(Setup),
                Setup => match remote.setup_exit {
                    Some(0) => Some(RunningExperiments),
                    Some(code) if self.config.setup_failure == SetupFailurePolicy::PowerOff => {
                        warn!(machine = %t.machine.name, code, "setup failed");
                        Some(ShuttingDown)
                    }
                    _ => None,
                },
                RunningExperiments if t.machine.all_runs_finished() => Some(ShuttingDown),
                _ => None,
            };
            let next = next.or_else(|| {
                (remote.shutdown && t.machine.state().is_active()).then_some(ShuttingDown)
            });
            match next {
                Some(to) if self.move_to(t, to, report) => continue,
                _ => break,
            }
        }
    }

    /// Move into `ShuttingDown` if the machine was still working, then make
    /// the final log pull.
    fn begin_shutdown(&self, t: &mut TrackedMachine, session: Option<&Session>, report: &mut PollReport) {
        self.restore(t, report);
        if t.machine.state().is_active() {
            self.move_to(t, LifecycleState::ShuttingDown, report);
        }
        self.final_sync(t, session, report);
    }

    /// The one final pull, with bounded retries. Failure is reported and
    /// otherwise ignored.
    fn final_sync(&self, t: &mut TrackedMachine, session: Option<&Session>, report: &mut PollReport) {
        if t.final_sync != FinalSync::Pending {
            return;
        }
        t.final_sync_attempts += 1;
        let Some(host) = t.machine.address.clone() else {
            t.final_sync = FinalSync::Failed("no address known".into());
            report.errors.push("final log sync skipped: no address known".into());
            return;
        };

        let outcome = self.config.final_sync_retry.run(
            |attempt| -> Result<RemoteReport, FleetError> {
                match (attempt, session) {
                    (0, Some(s)) => self.pull(t, s, true, report),
                    _ => {
                        let s = Session::open(Arc::clone(&self.transport), &host)?;
                        self.pull(t, &s, true, report)
                    }
                }
            },
            is_transient,
        );
        t.final_sync = match outcome {
            Ok(_) => {
                info!(machine = %t.machine.name, "final logs synced");
                FinalSync::Done
            }
            Err(e) => {
                warn!(machine = %t.machine.name, error = %e, "final log sync failed");
                report.errors.push(format!("final log sync failed: {}", e));
                FinalSync::Failed(e.to_string())
            }
        };
    }

    fn restore(&self, t: &mut TrackedMachine, report: &mut PollReport) {
        if t.machine.state() == LifecycleState::Unreachable {
            let to = t.machine.restore();
            info!(machine = %t.machine.name, state = %to, "reachable again");
            report.transitions.push((LifecycleState::Unreachable, to));
        }
    }

    fn note_failure(&self, t: &mut TrackedMachine, e: &SessionError, report: &mut PollReport) {
        let failures = t.health.record_failure(e, now_ms());
        debug!(machine = %t.machine.name, failures, error = %e, "poll could not reach host");
        t.last_error = Some(e.to_string());
        report.errors.push(e.to_string());
        if !t.health.exceeds(self.config.unreachable_after) {
            return;
        }
        let from = t.machine.state();
        match t.machine.mark_unreachable() {
            Ok(true) => {
                warn!(machine = %t.machine.name, failures, "machine unreachable");
                report.transitions.push((from, LifecycleState::Unreachable));
            }
            Ok(false) => {}
            Err(err) => report.errors.push(err.to_string()),
        }
    }

    /// Transition and record it. Returns whether the state changed.
    fn move_to(&self, t: &mut TrackedMachine, to: LifecycleState, report: &mut PollReport) -> bool {
        let from = t.machine.state();
        if from == to {
            return false;
        }
        match t.machine.transition(to) {
            Ok(()) => {
                info!(machine = %t.machine.name, %from, %to, "state changed");
                report.transitions.push((from, to));
                true
            }
            Err(e) => {
                warn!(machine = %t.machine.name, error = %e, "transition refused");
                report.errors.push(e.to_string());
                false
            }
        }
    }
}

fn apply_report(machine: &mut Machine, remote: &RemoteReport) {
    machine.host_stats = Some(remote.host.clone());
    if let Some(code) = remote.setup_exit {
        machine.record_setup_exit(code);
    }
    for &run in remote.run_log_sizes.keys() {
        machine.record_run_started(run);
    }
    for (&run, &code) in &remote.run_exits {
        machine.record_run_exit(run, code);
    }
}

/// Pick up the latest progress line and experiment id from fresh output.
fn read_output(machine: &mut Machine, stream: StreamKind, lines: &[OutputLine]) {
    let StreamKind::Run { run, .. } = stream else {
        return;
    };
    for line in lines {
        if let Some(exp) = extract_experiment_id(&line.text()) {
            machine.set_experiment_id(run, exp);
        }
    }
    let raw: Vec<u8> = lines.iter().flat_map(|l| l.0.iter().copied()).collect();
    if let Some(last) = extract_last_line(&raw) {
        machine.set_last_line(run, last);
    }
}

fn is_transient(e: &FleetError) -> bool {
    matches!(
        e,
        FleetError::Session(
            SessionError::Connect { .. }
                | SessionError::HostUnreachable { .. }
                | SessionError::SessionLost { .. }
        )
    )
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
