//! fleetlab core: the engine behind the `fleetlab` CLI.
//!
//! Launches short-lived experiment machines, tracks each one through its
//! lifecycle, and monitors the whole fleet concurrently while mirroring remote
//! logs to local disk.
//!
//! Layout follows the flow of a machine's life:
//!
//! - [`naming`] and [`plan`] are pure: a name from the word pool, and the
//!   slot/run blueprint plus the remote script rendered from it.
//! - [`control`] and [`remote`] are the two side-effecting seams (cloud
//!   control plane, shell sessions), each behind a trait with a production
//!   adapter built on [`infrastructure::runner`] and an in-crate test double.
//! - [`lifecycle`] drives a launch from `Requested` to `Setup`.
//! - [`monitor`] takes over afterwards, polling every machine independently
//!   and feeding [`logsync`].

pub mod control;
pub mod error;
pub mod infrastructure;
pub mod lifecycle;
pub mod logsync;
pub mod monitor;
pub mod naming;
pub mod plan;
pub mod remote;
pub mod retry;
pub mod types;

pub use error::{ErrorCategory, FleetError};
