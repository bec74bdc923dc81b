//! Remote status probe.
//!
//! One shell command per poll reports everything the monitor needs about a
//! machine: the script's markers, exit codes, log sizes, load and GPU usage.
//! Each fact is printed as one tagged line so the parser can ignore what it
//! does not recognise.

use std::collections::BTreeMap;

use crate::logsync::StreamKind;
use crate::plan::RemoteLayout;
use crate::types::machine::{GpuStat, HostStats};

/// What the machine reported during one probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteReport {
    pub started: bool,
    pub shutdown: bool,
    pub setup_exit: Option<i32>,
    pub setup_log_size: Option<u64>,
    /// Exit codes by run id.
    pub run_exits: BTreeMap<u32, i32>,
    /// Remote log sizes by run id. A run with a log has started.
    pub run_log_sizes: BTreeMap<u32, u64>,
    pub host: HostStats,
}

impl RemoteReport {
    /// Size of the remote file behind `stream`, if it exists.
    pub fn size_of(&self, stream: StreamKind) -> Option<u64> {
        match stream {
            StreamKind::Setup => self.setup_log_size,
            StreamKind::Run { run, .. } => self.run_log_sizes.get(&run).copied(),
        }
    }

    /// Whether the command writing `stream` has exited, so its log is final.
    pub fn has_exited(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Setup => self.setup_exit.is_some(),
            StreamKind::Run { run, .. } => self.run_exits.contains_key(&run),
        }
    }
}

/// The status command for a machine using `layout`.
pub fn status_command(layout: &RemoteLayout) -> String {
    let runs = layout.runs_dir();
    [
        format!("[ -f {} ] && echo started", layout.started_marker()),
        format!("[ -f {} ] && echo shutdown", layout.shutdown_marker()),
        format!(
            "[ -f {0} ] && echo \"setup_exit $(cat {0})\"",
            layout.setup_exit()
        ),
        format!(
            "[ -f {0} ] && echo \"setup_log $(wc -c < {0})\"",
            layout.setup_log()
        ),
        format!(
            "for f in {runs}/*.exit; do [ -f \"$f\" ] && echo \"run_exit $(basename \"$f\" .exit) $(cat \"$f\")\"; done"
        ),
        format!(
            "for f in {runs}/*.log; do [ -f \"$f\" ] && echo \"run_log $(basename \"$f\" .log) $(wc -c < \"$f\")\"; done"
        ),
        "echo \"loadavg $(cut -d' ' -f1 /proc/loadavg)\"".to_string(),
        "nvidia-smi --query-gpu=index,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits 2>/dev/null | sed 's/^/gpu /'".to_string(),
        "true".to_string(),
    ]
    .join("; ")
}

/// Parse the output of [`status_command`].
pub fn parse_status(output: &str) -> RemoteReport {
    let mut report = RemoteReport::default();
    for line in output.lines() {
        let line = line.trim();
        let (tag, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match tag {
            "started" => report.started = true,
            "shutdown" => report.shutdown = true,
            "setup_exit" => report.setup_exit = rest.parse().ok(),
            "setup_log" => report.setup_log_size = rest.parse().ok(),
            "run_exit" => {
                if let Some((run, value)) = run_entry(rest) {
                    if let Ok(code) = value.parse() {
                        report.run_exits.insert(run, code);
                    }
                }
            }
            "run_log" => {
                if let Some((run, value)) = run_entry(rest) {
                    if let Ok(size) = value.parse() {
                        report.run_log_sizes.insert(run, size);
                    }
                }
            }
            "loadavg" => report.host.load_1m = rest.parse().ok(),
            "gpu" => report.host.gpus.extend(parse_gpu(rest)),
            _ => {}
        }
    }
    report
}

/// `slot0_run2 17` -> `(2, "17")`.
fn run_entry(rest: &str) -> Option<(u32, &str)> {
    let (file, value) = rest.split_once(' ')?;
    let (_, run) = parse_stream_stem(file)?;
    Some((run, value.trim()))
}

/// `slot<S>_run<R>` -> `(S, R)`.
pub fn parse_stream_stem(stem: &str) -> Option<(u32, u32)> {
    let rest = stem.strip_prefix("slot")?;
    let (slot, run) = rest.split_once("_run")?;
    Some((slot.parse().ok()?, run.parse().ok()?))
}

/// `0, 45, 1024, 11178` (index, utilisation %, used MiB, total MiB).
fn parse_gpu(fields: &str) -> Option<GpuStat> {
    let values: Vec<&str> = fields.split(',').map(str::trim).collect();
    if values.len() != 4 {
        return None;
    }
    Some(GpuStat {
        index: values[0].parse().ok()?,
        utilization_pct: values[1].parse().ok()?,
        memory_used_mib: values[2].parse().ok()?,
        memory_total_mib: values[3].parse().ok()?,
    })
}

/// Remote path of a log stream.
pub fn remote_log_path(layout: &RemoteLayout, stream: StreamKind) -> String {
    match stream {
        StreamKind::Setup => layout.setup_log(),
        StreamKind::Run { slot, run } => layout.run_log(slot, run),
    }
}

/// Everything in the remote log from byte `offset` on.
pub fn fetch_command(layout: &RemoteLayout, stream: StreamKind, offset: u64) -> String {
    format!("tail -c +{} {}", offset + 1, remote_log_path(layout, stream))
}

/// Follow a remote log live, starting with its last `lines` lines.
pub fn follow_command(layout: &RemoteLayout, stream: StreamKind, lines: u32) -> String {
    format!(
        "tail -n {} -F {} 2>/dev/null",
        lines,
        remote_log_path(layout, stream)
    )
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_command_checks_every_marker() {
        let cmd = status_command(&RemoteLayout::new("fleetlab"));
        assert!(cmd.contains("[ -f fleetlab/started ] && echo started"));
        assert!(cmd.contains("fleetlab/shutdown"));
        assert!(cmd.contains("fleetlab/setup.exit"));
        assert!(cmd.contains("fleetlab/runs/*.exit"));
        assert!(cmd.contains("/proc/loadavg"));
        assert!(cmd.ends_with("; true"));
    }

    #[test]
    fn parses_a_full_report() {
        let out = "started\n\
                   setup_exit 0\n\
                   setup_log 120\n\
                   run_exit slot0_run0 0\n\
                   run_exit slot1_run1 3\n\
                   run_log slot0_run0 40\n\
                   run_log slot1_run1 12\n\
                   run_log slot0_run2 5\n\
                   loadavg 1.25\n\
                   gpu 0, 87, 10240, 11178\n\
                   gpu 1, 0, 2, 11178\n";
        let r = parse_status(out);
        assert!(r.started);
        assert!(!r.shutdown);
        assert_eq!(r.setup_exit, Some(0));
        assert_eq!(r.setup_log_size, Some(120));
        assert_eq!(r.run_exits.get(&0), Some(&0));
        assert_eq!(r.run_exits.get(&1), Some(&3));
        assert_eq!(r.run_exits.get(&2), None);
        assert_eq!(r.size_of(StreamKind::Run { slot: 0, run: 2 }), Some(5));
        assert_eq!(r.host.load_1m, Some(1.25));
        assert_eq!(r.host.gpus.len(), 2);
        assert_eq!(r.host.gpus[0].utilization_pct, 87);
        assert_eq!(r.host.gpus[0].memory_total_mib, 11178);
    }

    #[test]
    fn empty_report_before_the_script_starts() {
        let r = parse_status("loadavg 0.01\n");
        assert!(!r.started);
        assert_eq!(r.setup_exit, None);
        assert!(r.run_log_sizes.is_empty());
        assert!(r.host.gpus.is_empty());
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let r = parse_status("bash: nvidia-smi: command not found\nrun_exit nonsense 1\ngpu N/A\nshutdown\n");
        assert!(r.shutdown);
        assert!(r.run_exits.is_empty());
        assert!(r.host.gpus.is_empty());
    }

    #[test]
    fn stream_stems() {
        assert_eq!(parse_stream_stem("slot3_run17"), Some((3, 17)));
        assert_eq!(parse_stream_stem("setup"), None);
        assert_eq!(parse_stream_stem("slotX_run1"), None);
    }

    #[test]
    fn fetch_resumes_after_persisted_bytes() {
        let layout = RemoteLayout::new("fleetlab");
        assert_eq!(
            fetch_command(&layout, StreamKind::Run { slot: 1, run: 3 }, 0),
            "tail -c +1 fleetlab/runs/slot1_run3.log"
        );
        assert_eq!(
            fetch_command(&layout, StreamKind::Setup, 120),
            "tail -c +121 fleetlab/setup.log"
        );
    }
}
