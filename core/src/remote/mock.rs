//! Scripted transport for tests.
//!
//! Replies are produced by a responder closure keyed on `(host, command)`.
//! Connect failures can be queued per host. Every connection, command and
//! disconnect is recorded so tests can check that sessions were closed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::SessionError;

use super::session::{split_lines, Connection, OutputLine, RemoteStream, StreamEnd, Transport};

/// What a scripted command produces.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub lines: Vec<OutputLine>,
    pub end: StreamEnd,
}

impl MockReply {
    pub fn output(text: &str, code: i32) -> Self {
        MockReply {
            lines: split_lines(text.as_bytes()),
            end: StreamEnd::Exited(code),
        }
    }

    /// Some output, then the session drops.
    pub fn lost(text: &str, reason: &str) -> Self {
        MockReply {
            lines: split_lines(text.as_bytes()),
            end: StreamEnd::SessionLost(reason.to_string()),
        }
    }

    pub fn unreachable(reason: &str) -> Self {
        MockReply {
            lines: Vec::new(),
            end: StreamEnd::HostUnreachable(reason.to_string()),
        }
    }
}

type Responder = Box<dyn FnMut(&str, &str) -> MockReply + Send>;
type FailureFactory = Box<dyn Fn(&str) -> SessionError + Send>;

pub struct MockTransport {
    responder: Mutex<Responder>,
    connect_failures: Mutex<HashMap<String, (u32, FailureFactory)>>,
    connect_attempts: Mutex<HashMap<String, u32>>,
    executed: Mutex<Vec<(String, String)>>,
    open: Mutex<HashSet<u64>>,
    disconnects: AtomicU64,
    next_token: AtomicU64,
}

impl MockTransport {
    /// A transport where every host connects and every command exits 0
    /// with no output.
    pub fn new() -> Self {
        MockTransport {
            responder: Mutex::new(Box::new(|_, _| MockReply::output("", 0))),
            connect_failures: Mutex::new(HashMap::new()),
            connect_attempts: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            open: Mutex::new(HashSet::new()),
            disconnects: AtomicU64::new(0),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn on_exec(&self, responder: impl FnMut(&str, &str) -> MockReply + Send + 'static) {
        if let Ok(mut r) = self.responder.lock() {
            *r = Box::new(responder);
        }
    }

    /// Make the next `count` connects to `host` fail with `make(host)`.
    pub fn fail_connects(
        &self,
        host: &str,
        count: u32,
        make: impl Fn(&str) -> SessionError + Send + 'static,
    ) {
        if let Ok(mut f) = self.connect_failures.lock() {
            f.insert(host.to_string(), (count, Box::new(make)));
        }
    }

    pub fn connect_attempts(&self, host: &str) -> u32 {
        self.connect_attempts
            .lock()
            .map(|a| a.get(host).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Commands run so far as `(host, command)`.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        self.open.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn connect(&self, host: &str) -> Result<Connection, SessionError> {
        if let Ok(mut attempts) = self.connect_attempts.lock() {
            *attempts.entry(host.to_string()).or_insert(0) += 1;
        }
        if let Ok(mut failures) = self.connect_failures.lock() {
            if let Some((remaining, make)) = failures.get_mut(host) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(make(host));
                }
            }
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut open) = self.open.lock() {
            open.insert(token);
        }
        Ok(Connection {
            host: host.to_string(),
            token,
        })
    }

    fn exec(&self, conn: &Connection, command: &str) -> Result<Box<dyn RemoteStream>, SessionError> {
        let is_open = self.open.lock().map(|o| o.contains(&conn.token)).unwrap_or(false);
        if !is_open {
            return Err(SessionError::SessionLost {
                host: conn.host.clone(),
                reason: "mock connection not open".into(),
            });
        }
        if let Ok(mut executed) = self.executed.lock() {
            executed.push((conn.host.clone(), command.to_string()));
        }
        let reply = match self.responder.lock() {
            Ok(mut responder) => responder(&conn.host, command),
            Err(_) => MockReply::lost("", "mock responder poisoned"),
        };
        Ok(Box::new(MockStream {
            lines: reply.lines.into(),
            end: reply.end,
        }))
    }

    fn disconnect(&self, conn: &Connection) {
        if let Ok(mut open) = self.open.lock() {
            open.remove(&conn.token);
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockStream {
    lines: VecDeque<OutputLine>,
    end: StreamEnd,
}

impl RemoteStream for MockStream {
    fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.pop_front()
    }

    fn finish(&mut self) -> StreamEnd {
        self.lines.clear();
        self.end.clone()
    }
}
