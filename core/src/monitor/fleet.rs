//! Fleet monitor: discovery, per-machine polling and the monitor loop.
//!
//! The control plane is the source of truth for which machines exist. A
//! restarted monitor rebuilds every machine from its instance tags and picks
//! up log mirroring where the local files end.
//!
//! Under [`FleetMonitor::run`] every tracked machine gets its own worker
//! thread polling on its own cadence, so a slow session open or a hung
//! command on one host never delays the others. Workers report each poll
//! back over the monitor's mpsc channel; the loop is the single consumer.
//! Machines are released once they are terminated and their final logs were
//! pulled.

use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::control::{ControlPlane, FleetFilter, InstanceStatus};
use crate::error::ControlPlaneError;
use crate::plan::ExecutionPlan;
use crate::remote::Transport;
use crate::types::config::MonitorConfig;
use crate::types::machine::{HostStats, LifecycleState, Machine, RunRecord, Slot};

use super::poller::{FinalSync, MachinePoller, PollReport, TrackedMachine};


// ---------------------------------------------------------------------------
// Events and handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Poll every machine now without waiting out the interval.
    PollNow,
    Stop,
    /// A worker finished one poll of its machine.
    Polled {
        snapshot: MachineSnapshot,
        report: PollReport,
    },
}

/// Cloneable handle for talking to a running monitor loop.
#[derive(Clone)]
pub struct MonitorHandle {
    sender: mpsc::Sender<MonitorEvent>,
}

impl MonitorHandle {
    pub fn poll_now(&self) -> Result<(), String> {
        self.sender
            .send(MonitorEvent::PollNow)
            .map_err(|e| format!("monitor loop gone: {}", e))
    }

    pub fn stop(&self) -> Result<(), String> {
        self.sender
            .send(MonitorEvent::Stop)
            .map_err(|e| format!("monitor loop gone: {}", e))
    }
}


// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Operator view of one machine, taken after a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSnapshot {
    pub name: String,
    pub instance_id: String,
    pub state: LifecycleState,
    pub address: Option<String>,
    pub setup_failed: bool,
    pub slots: Vec<Slot>,
    pub runs: BTreeMap<u32, RunRecord>,
    pub host: Option<HostStats>,
    pub last_error: Option<String>,
    pub final_sync: FinalSync,
}

impl MachineSnapshot {
    pub fn of(t: &TrackedMachine) -> Self {
        MachineSnapshot {
            name: t.machine.name.clone(),
            instance_id: t.machine.instance_id.clone(),
            state: t.machine.state(),
            address: t.machine.address.clone(),
            setup_failed: t.machine.setup_failed,
            slots: t.machine.slots.clone(),
            runs: t.machine.runs.clone(),
            host: t.machine.host_stats.clone(),
            last_error: t.last_error.clone(),
            final_sync: t.final_sync.clone(),
        }
    }
}


// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerCommand {
    PollNow,
    Stop,
}

/// One machine's poll loop. The thread hands the machine back when it ends.
struct Worker {
    commands: mpsc::Sender<WorkerCommand>,
    thread: thread::JoinHandle<TrackedMachine>,
}

impl Worker {
    fn spawn(
        poller: Arc<MachinePoller>,
        mut tracked: TrackedMachine,
        events: mpsc::Sender<MonitorEvent>,
        interval: Duration,
    ) -> Self {
        let (commands, inbox) = mpsc::channel();
        let thread = thread::spawn(move || loop {
            let report = poller.poll(&mut tracked);
            let released = report.released;
            let event = MonitorEvent::Polled {
                snapshot: MachineSnapshot::of(&tracked),
                report,
            };
            if events.send(event).is_err() || released {
                return tracked;
            }
            match inbox.recv_timeout(interval) {
                Ok(WorkerCommand::PollNow) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(WorkerCommand::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return tracked
                }
            }
        });
        Worker { commands, thread }
    }

    fn poll_now(&self) {
        if self.commands.send(WorkerCommand::PollNow).is_err() {
            debug!("worker already finished");
        }
    }

    /// Ask the worker to stop and wait for its current poll to end.
    fn stop(self) -> Option<TrackedMachine> {
        if self.commands.send(WorkerCommand::Stop).is_err() {
            debug!("worker already finished");
        }
        match self.thread.join() {
            Ok(tracked) => Some(tracked),
            Err(_) => {
                warn!("machine worker panicked");
                None
            }
        }
    }
}


// ---------------------------------------------------------------------------
// FleetMonitor
// ---------------------------------------------------------------------------

pub struct FleetMonitor {
    poller: MachinePoller,
    control: Arc<dyn ControlPlane>,
    filter: FleetFilter,
    machines: BTreeMap<String, TrackedMachine>,
    /// Instance ids already released; never tracked again.
    released: HashSet<String>,
    /// Names currently owned by a worker under `run`.
    working: HashSet<String>,
    last_discovery: Option<Instant>,
    sender: mpsc::Sender<MonitorEvent>,
    receiver: mpsc::Receiver<MonitorEvent>,
}

impl FleetMonitor {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        transport: Arc<dyn Transport>,
        filter: FleetFilter,
        config: MonitorConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        FleetMonitor {
            poller: MachinePoller::new(Arc::clone(&control), transport, config),
            control,
            filter,
            machines: BTreeMap::new(),
            released: HashSet::new(),
            working: HashSet::new(),
            last_discovery: None,
            sender,
            receiver,
        }
    }

    pub fn prefer_public_address(mut self, prefer: bool) -> Self {
        self.poller = self.poller.prefer_public_address(prefer);
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            sender: self.sender.clone(),
        }
    }

    /// Start tracking a machine launched by this process.
    pub fn track(&mut self, machine: Machine) {
        self.machines
            .insert(machine.name.clone(), TrackedMachine::new(machine));
    }

    pub fn get(&self, name: &str) -> Option<&TrackedMachine> {
        self.machines.get(name)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Track every managed instance not tracked yet, rebuilding its plan from
    /// its tags. Returns how many machines were added.
    pub fn discover(&mut self) -> Result<usize, ControlPlaneError> {
        self.last_discovery = Some(Instant::now());
        let mut added = 0;
        for info in self.control.list_managed(&self.filter)? {
            if info.status == InstanceStatus::Terminated || self.released.contains(&info.instance_id) {
                continue;
            }
            let Some(name) = info.name() else {
                continue;
            };
            if self.machines.contains_key(name) || self.working.contains(name) {
                continue;
            }
            let Some(plan) = ExecutionPlan::from_tags(&info.tags) else {
                warn!(machine = name, instance_id = %info.instance_id, "no plan tags, not tracking");
                continue;
            };
            let launched_at = info.launch_time.unwrap_or_else(Utc::now);
            let mut machine = Machine::new(name, &info.instance_id, launched_at, plan);
            machine.address = info.private_ip.clone().or_else(|| info.public_ip.clone());
            info!(machine = name, instance_id = %info.instance_id, "discovered");
            self.machines
                .insert(name.to_string(), TrackedMachine::new(machine));
            added += 1;
        }
        Ok(added)
    }

    /// One concurrent pass over every tracked machine, then drop released
    /// ones. Used for single-shot monitoring; `run` polls continuously.
    pub fn poll_cycle(&mut self) -> Vec<PollReport> {
        let poller = &self.poller;
        let reports: Vec<PollReport> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .machines
                .values_mut()
                .map(|t| scope.spawn(move || poller.poll(t)))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| match h.join() {
                    Ok(report) => Some(report),
                    Err(_) => {
                        warn!("machine poll panicked");
                        None
                    }
                })
                .collect()
        });

        for report in reports.iter().filter(|r| r.released) {
            if let Some(t) = self.machines.remove(&report.machine) {
                info!(machine = %report.machine, "released");
                self.released.insert(t.machine.instance_id);
            }
        }
        reports
    }

    /// Discover if due, then poll once.
    pub fn tick(&mut self) -> Vec<PollReport> {
        let interval = Duration::from_millis(self.poller.config().discovery_interval_ms);
        let due = self
            .last_discovery
            .map_or(true, |at| at.elapsed() >= interval);
        if due {
            if let Err(e) = self.discover() {
                warn!(error = %e, "discovery failed, polling known machines");
            }
        }
        self.poll_cycle()
    }

    pub fn snapshots(&self) -> Vec<MachineSnapshot> {
        self.machines.values().map(MachineSnapshot::of).collect()
    }

    /// Poll every machine on its own worker until a `Stop` event arrives.
    ///
    /// `on_update` runs after each single poll with the whole fleet as last
    /// seen and that poll's report. When the loop ends, unreleased machines
    /// are tracked by `self` again.
    pub fn run(&mut self, mut on_update: impl FnMut(&[MachineSnapshot], &[PollReport])) {
        let poller = Arc::new(self.poller.clone());
        let interval = Duration::from_millis(self.poller.config().poll_interval_ms);
        let discovery = Duration::from_millis(self.poller.config().discovery_interval_ms);
        let mut workers: BTreeMap<String, Worker> = BTreeMap::new();
        let mut fleet: BTreeMap<String, MachineSnapshot> = BTreeMap::new();

        loop {
            let due = self
                .last_discovery
                .map_or(true, |at| at.elapsed() >= discovery);
            if due {
                if let Err(e) = self.discover() {
                    warn!(error = %e, "discovery failed, polling known machines");
                }
            }
            for (name, tracked) in std::mem::take(&mut self.machines) {
                fleet.insert(name.clone(), MachineSnapshot::of(&tracked));
                let worker = Worker::spawn(Arc::clone(&poller), tracked, self.sender.clone(), interval);
                self.working.insert(name.clone());
                workers.insert(name, worker);
            }

            match self.receiver.recv_timeout(interval.min(discovery)) {
                Ok(MonitorEvent::Polled { snapshot, report }) => {
                    if report.released {
                        fleet.remove(&report.machine);
                        self.working.remove(&report.machine);
                        if let Some(worker) = workers.remove(&report.machine) {
                            worker.stop();
                        }
                        info!(machine = %report.machine, "released");
                        self.released.insert(snapshot.instance_id);
                    } else {
                        fleet.insert(report.machine.clone(), snapshot);
                    }
                    let view: Vec<MachineSnapshot> = fleet.values().cloned().collect();
                    on_update(&view, std::slice::from_ref(&report));
                }
                Ok(MonitorEvent::PollNow) => workers.values().for_each(Worker::poll_now),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(MonitorEvent::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    info!("monitor stopping");
                    break;
                }
            }
        }

        for (name, worker) in workers {
            self.working.remove(&name);
            if let Some(tracked) = worker.stop() {
                self.machines.insert(name, tracked);
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
