//! Remote shell sessions.
//!
//! A [`Session`] is one connection to one host, owned by whoever opened it and
//! closed on drop. Commands run through it yield output lazily via a
//! [`CommandHandle`]. How a stream ends is reported as a [`StreamEnd`], which
//! keeps "the command exited", "this session dropped" and "the host is gone"
//! apart.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SessionError;
use crate::retry::RetryPolicy;


// ---------------------------------------------------------------------------
// Output and stream ends
// ---------------------------------------------------------------------------

/// One line of remote output, raw bytes including the trailing newline. The
/// last line of a stream may be incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine(pub Vec<u8>);

impl OutputLine {
    pub fn is_complete(&self) -> bool {
        self.0.last() == Some(&b'\n')
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy text without the line terminator.
    pub fn text(&self) -> String {
        let trimmed = self.0.strip_suffix(b"\n").unwrap_or(&self.0);
        let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
        String::from_utf8_lossy(trimmed).into_owned()
    }
}

/// Split raw bytes into lines, keeping terminators.
pub fn split_lines(bytes: &[u8]) -> Vec<OutputLine> {
    bytes
        .split_inclusive(|&b| b == b'\n')
        .map(|chunk| OutputLine(chunk.to_vec()))
        .collect()
}

/// How a remote command stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The command finished with this exit code.
    Exited(i32),
    /// This session went away. Says nothing about the host.
    SessionLost(String),
    /// The host could not be reached at the network level.
    HostUnreachable(String),
}


// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// An established connection, as handed out by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    /// Transport-specific handle (control socket id, mock slot).
    pub token: u64,
}

/// A running remote command. Dropping an unfinished stream abandons the
/// command.
pub trait RemoteStream: Send {
    /// The next line of output, `None` once the stream has ended.
    fn next_line(&mut self) -> Option<OutputLine>;
    /// Wait for the command and report how it ended.
    fn finish(&mut self) -> StreamEnd;
}

/// The mechanism that actually reaches hosts.
pub trait Transport: Send + Sync {
    fn connect(&self, host: &str) -> Result<Connection, SessionError>;
    fn exec(&self, conn: &Connection, command: &str) -> Result<Box<dyn RemoteStream>, SessionError>;
    /// Tear the connection down. Must tolerate being called on a connection
    /// that already broke.
    fn disconnect(&self, conn: &Connection);
}


// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    transport: Arc<dyn Transport>,
    conn: Connection,
    closed: bool,
}

/// Collected output of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

impl Session {
    pub fn open(transport: Arc<dyn Transport>, host: &str) -> Result<Session, SessionError> {
        let conn = transport.connect(host)?;
        debug!(host, token = conn.token, "session opened");
        Ok(Session {
            transport,
            conn,
            closed: false,
        })
    }

    /// Open, retrying connectivity failures according to `policy`.
    pub fn open_with_retry(
        transport: Arc<dyn Transport>,
        host: &str,
        policy: &RetryPolicy,
    ) -> Result<Session, SessionError> {
        policy.run(
            |attempt| {
                if attempt > 0 {
                    debug!(host, attempt, "reconnecting");
                }
                Session::open(Arc::clone(&transport), host)
            },
            |e| e.is_connectivity_failure(),
        )
    }

    pub fn host(&self) -> &str {
        &self.conn.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Prepare `command`. Nothing is sent until the handle is first read.
    pub fn run(&self, command: &str) -> Result<CommandHandle<'_>, SessionError> {
        if self.closed {
            return Err(SessionError::Closed {
                host: self.conn.host.clone(),
            });
        }
        Ok(CommandHandle {
            session: self,
            command: command.to_string(),
            stream: None,
            end: None,
        })
    }

    /// Run `command` and collect all of its output. A dropped session or an
    /// unreachable host is an error; a nonzero exit is not.
    pub fn run_to_end(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut handle = self.run(command)?;
        let mut stdout = Vec::new();
        for line in handle.by_ref() {
            stdout.extend_from_slice(&line.0);
        }
        match handle.finish() {
            StreamEnd::Exited(exit_code) => Ok(CommandOutput { stdout, exit_code }),
            StreamEnd::SessionLost(reason) => Err(SessionError::SessionLost {
                host: self.conn.host.clone(),
                reason,
            }),
            StreamEnd::HostUnreachable(reason) => Err(SessionError::HostUnreachable {
                host: self.conn.host.clone(),
                reason,
            }),
        }
    }

    /// Close the session. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transport.disconnect(&self.conn);
        debug!(host = %self.conn.host, token = self.conn.token, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}


// ---------------------------------------------------------------------------
// CommandHandle
// ---------------------------------------------------------------------------

/// Lazy output of one command. Iterating yields lines until the command ends
/// or the session drops; [`CommandHandle::restart`] replays from the start by
/// running the command again.
pub struct CommandHandle<'s> {
    session: &'s Session,
    command: String,
    stream: Option<Box<dyn RemoteStream>>,
    end: Option<StreamEnd>,
}

impl<'s> CommandHandle<'s> {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// How the stream ended, once it has.
    pub fn end(&self) -> Option<&StreamEnd> {
        self.end.as_ref()
    }

    /// Forget the current stream. The next read runs the command again.
    pub fn restart(&mut self) {
        self.stream = None;
        self.end = None;
    }

    /// Drain what is left and report how the stream ended.
    pub fn finish(&mut self) -> StreamEnd {
        while self.next().is_some() {}
        self.end
            .clone()
            .unwrap_or_else(|| StreamEnd::SessionLost("stream ended without status".into()))
    }

    fn start(&mut self) -> bool {
        if self.session.closed {
            self.end = Some(StreamEnd::SessionLost("session closed".into()));
            return false;
        }
        match self.session.transport.exec(&self.session.conn, &self.command) {
            Ok(stream) => {
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                warn!(host = %self.session.conn.host, error = %e, "remote exec failed");
                self.end = Some(match e {
                    SessionError::Connect { reason, .. }
                    | SessionError::HostUnreachable { reason, .. } => {
                        StreamEnd::HostUnreachable(reason)
                    }
                    SessionError::SessionLost { reason, .. } => StreamEnd::SessionLost(reason),
                    SessionError::Closed { .. } => StreamEnd::SessionLost("session closed".into()),
                });
                false
            }
        }
    }
}

impl Iterator for CommandHandle<'_> {
    type Item = OutputLine;

    fn next(&mut self) -> Option<OutputLine> {
        if self.end.is_some() {
            return None;
        }
        if self.stream.is_none() && !self.start() {
            return None;
        }
        let stream = self.stream.as_mut()?;
        match stream.next_line() {
            Some(line) => Some(line),
            None => {
                self.end = Some(stream.finish());
                None
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
