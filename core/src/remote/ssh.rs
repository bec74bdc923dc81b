//! OpenSSH-backed transport.
//!
//! `connect` starts a background master connection on a private control
//! socket; `exec` multiplexes commands over it, so each command costs no new
//! handshake. ssh reports its own failures as exit status 255, and the stderr
//! text is used to tell an unreachable host from a dropped session.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::error::SessionError;
use crate::infrastructure::CommandRunner;

use super::config::SshConfig;
use super::session::{Connection, OutputLine, RemoteStream, StreamEnd, Transport};

/// ssh's own exit status for connection-level failures.
const SSH_FAILURE: i32 = 255;

/// stderr fragments that mean the network path to the host is gone.
const UNREACHABLE_MARKERS: &[&str] = &[
    "Connection timed out",
    "Operation timed out",
    "No route to host",
    "Network is unreachable",
    "Could not resolve hostname",
    "Host is down",
];

/// Classify an ssh connection-level failure from its stderr.
pub fn classify_failure(host: &str, stderr: &str, connecting: bool) -> SessionError {
    let reason = stderr.trim().to_string();
    if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        SessionError::HostUnreachable {
            host: host.to_string(),
            reason,
        }
    } else if connecting {
        SessionError::Connect {
            host: host.to_string(),
            reason,
        }
    } else {
        SessionError::SessionLost {
            host: host.to_string(),
            reason,
        }
    }
}


// ---------------------------------------------------------------------------
// SshTransport
// ---------------------------------------------------------------------------

pub struct SshTransport {
    config: SshConfig,
    runner: Arc<dyn CommandRunner>,
    next_token: AtomicU64,
}

impl SshTransport {
    pub fn new(config: SshConfig, runner: Arc<dyn CommandRunner>) -> Self {
        SshTransport {
            config,
            runner,
            next_token: AtomicU64::new(1),
        }
    }

    /// Control socket path for a connection. Kept short; unix socket paths
    /// are limited to about 100 bytes.
    fn control_path(&self, token: u64) -> String {
        self.config
            .control_dir()
            .join(format!("{}-{}", std::process::id(), token))
            .display()
            .to_string()
    }

    /// Arguments that start a master connection in the background.
    pub fn master_args(&self, host: &str, token: u64) -> Vec<String> {
        let mut args = self.config.base_args();
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path(token)),
            "-o".to_string(),
            "ControlPersist=120".to_string(),
            "-fN".to_string(),
            self.config.user_at_host(host),
        ]);
        args
    }

    /// Arguments that run `command` over an existing master.
    pub fn exec_args(&self, conn: &Connection, command: &str) -> Vec<String> {
        let mut args = self.config.base_args();
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path(conn.token)),
            self.config.user_at_host(&conn.host),
            command.to_string(),
        ]);
        args
    }

    pub fn exit_args(&self, conn: &Connection) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path(conn.token)),
            "-O".to_string(),
            "exit".to_string(),
            self.config.user_at_host(&conn.host),
        ]
    }
}

impl Transport for SshTransport {
    fn connect(&self, host: &str) -> Result<Connection, SessionError> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = std::fs::create_dir_all(self.config.control_dir()) {
            return Err(SessionError::Connect {
                host: host.to_string(),
                reason: format!("cannot create control directory: {}", e),
            });
        }
        let output = self
            .runner
            .run("ssh", &self.master_args(host, token))
            .map_err(|e| SessionError::Connect {
                host: host.to_string(),
                reason: format!("cannot start ssh: {}", e),
            })?;
        if output.success() {
            Ok(Connection {
                host: host.to_string(),
                token,
            })
        } else {
            Err(classify_failure(host, &output.stderr, true))
        }
    }

    fn exec(&self, conn: &Connection, command: &str) -> Result<Box<dyn RemoteStream>, SessionError> {
        debug!(host = %conn.host, command, "ssh exec");
        let mut child = Command::new("ssh")
            .args(self.exec_args(conn, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::SessionLost {
                host: conn.host.clone(),
                reason: format!("cannot start ssh: {}", e),
            })?;

        let stderr = Arc::new(Mutex::new(String::new()));
        if let Some(mut pipe) = child.stderr.take() {
            let sink = Arc::clone(&stderr);
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                if let Ok(mut s) = sink.lock() {
                    s.push_str(&buf);
                }
            });
        }
        let stdout = child.stdout.take().map(BufReader::new);

        Ok(Box::new(SshStream {
            host: conn.host.clone(),
            child: Some(child),
            stdout,
            stderr,
            read_error: None,
        }))
    }

    fn disconnect(&self, conn: &Connection) {
        match self.runner.run("ssh", &self.exit_args(conn)) {
            Ok(out) if !out.success() => {
                debug!(host = %conn.host, stderr = %out.stderr.trim(), "master already gone");
            }
            Err(e) => warn!(host = %conn.host, error = %e, "cannot stop ssh master"),
            Ok(_) => {}
        }
    }
}


// ---------------------------------------------------------------------------
// SshStream
// ---------------------------------------------------------------------------

struct SshStream {
    host: String,
    child: Option<Child>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Arc<Mutex<String>>,
    read_error: Option<String>,
}

impl RemoteStream for SshStream {
    fn next_line(&mut self) -> Option<OutputLine> {
        let reader = self.stdout.as_mut()?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                self.stdout = None;
                None
            }
            Ok(_) => Some(OutputLine(buf)),
            Err(e) => {
                self.read_error = Some(e.to_string());
                self.stdout = None;
                None
            }
        }
    }

    fn finish(&mut self) -> StreamEnd {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return StreamEnd::SessionLost("stream already finished".into());
        };
        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => return StreamEnd::SessionLost(format!("cannot wait for ssh: {}", e)),
        };
        if let Some(err) = self.read_error.take() {
            return StreamEnd::SessionLost(err);
        }
        match status.code() {
            Some(SSH_FAILURE) => {
                let stderr = self.stderr.lock().map(|s| s.clone()).unwrap_or_default();
                match classify_failure(&self.host, &stderr, false) {
                    SessionError::HostUnreachable { reason, .. } => {
                        StreamEnd::HostUnreachable(reason)
                    }
                    other => StreamEnd::SessionLost(other.to_string()),
                }
            }
            Some(code) => StreamEnd::Exited(code),
            None => StreamEnd::SessionLost("ssh killed by signal".into()),
        }
    }
}

impl Drop for SshStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{MockRunner, ProcessOutput};

    fn transport(runner: Arc<MockRunner>) -> SshTransport {
        let config = SshConfig {
            control_dir: Some(std::env::temp_dir().join("fleetlab-ssh-test")),
            ..SshConfig::default()
        };
        SshTransport::new(config, runner)
    }

    #[test]
    fn classify_unreachable_vs_refused() {
        let e = classify_failure("h", "ssh: connect to host h port 22: No route to host", true);
        assert!(matches!(e, SessionError::HostUnreachable { .. }));
        let e = classify_failure("h", "ssh: connect to host h port 22: Connection refused", true);
        assert!(matches!(e, SessionError::Connect { .. }));
        let e = classify_failure("h", "client_loop: send disconnect: Broken pipe", false);
        assert!(matches!(e, SessionError::SessionLost { .. }));
    }

    #[test]
    fn connect_starts_a_master() {
        let runner = Arc::new(MockRunner::new());
        let t = transport(runner.clone());
        let conn = t.connect("10.0.0.9").unwrap();
        let cmds = runner.executed_commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].0, "ssh");
        let args = &cmds[0].1;
        assert!(args.contains(&"ControlMaster=yes".to_string()));
        assert!(args.contains(&"-fN".to_string()));
        assert_eq!(args.last().unwrap(), "ubuntu@10.0.0.9");
        assert_eq!(conn.host, "10.0.0.9");
    }

    #[test]
    fn connect_failure_is_classified() {
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(ProcessOutput::failed(
            255,
            "ssh: connect to host 10.0.0.9 port 22: Connection timed out",
        ))]));
        let t = transport(runner);
        let err = t.connect("10.0.0.9").unwrap_err();
        assert!(matches!(err, SessionError::HostUnreachable { .. }));
    }

    #[test]
    fn exec_args_reuse_the_control_socket() {
        let runner = Arc::new(MockRunner::new());
        let t = transport(runner.clone());
        let conn = t.connect("h").unwrap();
        let exec = t.exec_args(&conn, "cat fleetlab/setup.log");
        let master = &runner.executed_commands()[0].1;
        let path = master.iter().find(|a| a.starts_with("ControlPath=")).unwrap();
        assert!(exec.contains(path));
        assert_eq!(exec.last().unwrap(), "cat fleetlab/setup.log");
    }

    #[test]
    fn disconnect_sends_exit() {
        let runner = Arc::new(MockRunner::new());
        let t = transport(runner.clone());
        let conn = t.connect("h").unwrap();
        t.disconnect(&conn);
        let cmds = runner.executed_commands();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[1].1.windows(2).any(|w| w[0] == "-O" && w[1] == "exit"));
    }
}
