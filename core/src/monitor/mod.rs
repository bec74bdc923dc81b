//! Fleet monitoring.
//!
//! `probe` builds the remote status command and parses its report.
//! `output` reads progress lines and experiment ids out of run logs.
//! `poller` runs one poll of one machine and owns the lifecycle rules.
//! `fleet` discovers machines and polls all of them concurrently.

pub mod fleet;
pub mod output;
pub mod poller;
pub mod probe;

pub use fleet::{FleetMonitor, MachineSnapshot, MonitorEvent, MonitorHandle};
pub use poller::{FinalSync, MachinePoller, PollReport, TrackedMachine};
pub use probe::RemoteReport;
