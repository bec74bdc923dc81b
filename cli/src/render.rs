//! Plain-text tables for the terminal.

use std::fmt::Write as _;

use fleetlab_core::control::InstanceInfo;
use fleetlab_core::monitor::{FinalSync, MachineSnapshot, PollReport};
use fleetlab_core::types::machine::{HostStats, LifecycleState, RunStatus};

const LAST_LINE_WIDTH: usize = 60;

/// One block per machine: a header line, then one line per slot.
pub fn fleet_table(snapshots: &[MachineSnapshot]) -> String {
    if snapshots.is_empty() {
        return "no machines\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<14} {:<16} {:<6} GPU",
        "NAME", "STATE", "ADDRESS", "LOAD"
    );
    for s in snapshots {
        let _ = writeln!(
            out,
            "{:<12} {:<14} {:<16} {:<6} {}",
            s.name,
            state_label(s),
            s.address.as_deref().unwrap_or("-"),
            load(s.host.as_ref()),
            gpus(s.host.as_ref()),
        );
        for slot in &s.slots {
            let Some(run) = slot.current_run_id else {
                continue;
            };
            let record = s.runs.get(&run);
            let exp = record
                .and_then(|r| r.experiment_id)
                .map(|id| format!(" [exp {}]", id))
                .unwrap_or_default();
            let last = record
                .and_then(|r| r.last_line.as_deref())
                .map(|l| format!("  {}", clip(l, LAST_LINE_WIDTH)))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  slot {} run {}/{} {}{}{}",
                slot.index,
                position(&slot.assigned_run_indices, run),
                slot.assigned_run_indices.len(),
                status_label(slot.run_status),
                exp,
                last
            );
        }
        if let Some(err) = &s.last_error {
            let _ = writeln!(out, "  last error: {}", clip(err, 100));
        }
    }
    out
}

/// Errors a cycle ran into, one line each.
pub fn cycle_errors(reports: &[PollReport]) -> String {
    let mut out = String::new();
    for r in reports {
        for e in &r.errors {
            let _ = writeln!(out, "{}: {}", r.machine, e);
        }
    }
    out
}

/// The `list` output.
pub fn instance_table(instances: &[InstanceInfo]) -> String {
    if instances.is_empty() {
        return "no machines\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<20} {:<14} ADDRESS", "NAME", "INSTANCE", "STATUS");
    for i in instances {
        let _ = writeln!(
            out,
            "{:<12} {:<20} {:<14} {}",
            i.name().unwrap_or("?"),
            i.instance_id,
            i.status.as_ec2(),
            i.private_ip.as_deref().unwrap_or("-"),
        );
    }
    out
}

fn state_label(s: &MachineSnapshot) -> String {
    let mut label = s.state.label().to_string();
    if s.setup_failed {
        label.push_str(" (setup failed)");
    } else if s.state == LifecycleState::Terminated {
        if let FinalSync::Failed(_) = s.final_sync {
            label.push_str(" (logs incomplete)");
        }
    }
    label
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

fn load(host: Option<&HostStats>) -> String {
    host.and_then(|h| h.load_1m)
        .map(|l| format!("{:.2}", l))
        .unwrap_or_else(|| "-".into())
}

fn gpus(host: Option<&HostStats>) -> String {
    let Some(host) = host else {
        return "-".into();
    };
    if host.gpus.is_empty() {
        return "-".into();
    }
    host.gpus
        .iter()
        .map(|g| {
            format!(
                "{}%/{:.1}G",
                g.utilization_pct,
                g.memory_total_mib as f64 / 1024.0
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// 1-based position of `run` in the slot's assignment.
fn position(assigned: &[u32], run: u32) -> usize {
    assigned.iter().position(|&r| r == run).map_or(0, |i| i + 1)
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut clipped: String = s.chars().take(max.saturating_sub(3)).collect();
    clipped.push_str("...");
    clipped
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetlab_core::monitor::TrackedMachine;
    use fleetlab_core::plan;
    use fleetlab_core::types::machine::{GpuStat, Machine};

    fn snapshot() -> MachineSnapshot {
        let mut machine = Machine::new("otter", "i-1", Utc::now(), plan::build("x", 3, 2).unwrap());
        machine.address = Some("10.0.0.7".into());
        machine.record_run_started(0);
        machine.set_experiment_id(0, 7160);
        machine.set_last_line(0, "epoch 3/10".into());
        machine.host_stats = Some(HostStats {
            load_1m: Some(1.5),
            gpus: vec![GpuStat {
                index: 0,
                utilization_pct: 90,
                memory_used_mib: 9000,
                memory_total_mib: 11264,
            }],
        });
        MachineSnapshot::of(&TrackedMachine::new(machine))
    }

    #[test]
    fn fleet_table_shows_slots_and_stats() {
        let table = fleet_table(&[snapshot()]);
        assert!(table.starts_with("NAME"));
        assert!(table.contains("otter"));
        assert!(table.contains("10.0.0.7"));
        assert!(table.contains("1.50"));
        assert!(table.contains("90%/11.0G"));
        assert!(table.contains("slot 0 run 1/2 running [exp 7160]  epoch 3/10"));
        assert!(table.contains("slot 1 run 1/1 pending"));
    }

    #[test]
    fn setup_failure_is_labelled() {
        let mut s = snapshot();
        s.setup_failed = true;
        assert!(fleet_table(&[s]).contains("(setup failed)"));
    }

    #[test]
    fn empty_fleet() {
        assert_eq!(fleet_table(&[]), "no machines\n");
        assert_eq!(instance_table(&[]), "no machines\n");
    }

    #[test]
    fn long_lines_are_clipped() {
        assert_eq!(clip("abcdefgh", 6), "abc...");
        assert_eq!(clip("abc", 6), "abc");
    }
}
