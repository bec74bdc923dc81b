//! Remote execution: ssh coordinates, sessions, and connection health.
//!
//! `session` defines the transport-agnostic [`Session`] and the
//! [`Transport`] seam; `ssh` implements it with OpenSSH control masters and
//! `mock` with scripted replies. `connection` tracks per-machine reachability.

pub mod config;
pub mod connection;
pub mod mock;
pub mod session;
pub mod ssh;

pub use config::SshConfig;
pub use connection::{ConnState, ConnectionHealth};
pub use session::{
    CommandHandle, CommandOutput, Connection, OutputLine, RemoteStream, Session, StreamEnd,
    Transport,
};
pub use ssh::SshTransport;
