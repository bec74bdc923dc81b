//! Error taxonomy.
//!
//! Every subsystem owns a small error enum. `FleetError` wraps them all so the
//! CLI can classify any failure into an [`ErrorCategory`] and pick a process
//! exit code from it.

use std::error::Error as StdError;
use std::path::PathBuf;

use crate::types::machine::LifecycleState;


// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Coarse classification used for operator-facing exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad plan parameters, settings, or operator input. Raised before any
    /// remote side effect.
    Configuration,
    /// Cloud API failures: throttling, permissions, limits, missing instances.
    ControlPlane,
    /// Shell session failures and remote commands that could not run.
    RemoteExecution,
    /// Local filesystem trouble (log mirror, lock files).
    Local,
}

impl ErrorCategory {
    /// Process exit code for this category.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Local => 1,
            ErrorCategory::Configuration => 2,
            ErrorCategory::ControlPlane => 3,
            ErrorCategory::RemoteExecution => 4,
        }
    }
}


// ---------------------------------------------------------------------------
// Subsystem errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("invalid plan: {reason}")]
    InvalidPlan { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamingError {
    #[error("all {pool_size} machine names are already in use")]
    Exhausted { pool_size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlPlaneError {
    /// The provider rejected or failed the call. Usually retryable by the
    /// operator (throttling, transient outage).
    #[error("control plane call `{operation}` failed: {message}")]
    Api { operation: String, message: String },
    /// Another live instance already carries this name.
    #[error("name '{name}' is already registered to instance {holder}")]
    NameTaken { name: String, holder: String },
    #[error("no instance with id '{id}'")]
    NotFound { id: String },
    #[error("unexpected response from `{operation}`: {detail}")]
    Malformed { operation: String, detail: String },
}

/// Provider error codes that clear up on their own.
const TRANSIENT_API_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "InternalError",
    "ServiceUnavailable",
    "Unavailable",
];

impl ControlPlaneError {
    /// Throttling or a provider-side hiccup: the same call may succeed if
    /// repeated a moment later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControlPlaneError::Api { message, .. } => {
                TRANSIENT_API_CODES.iter().any(|code| message.contains(code))
            }
            _ => false,
        }
    }
}

/// Failures of a remote shell session.
///
/// `SessionLost` only says this session is gone; the host may be fine.
/// `HostUnreachable` is a network-level diagnosis the monitor escalates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },
    #[error("session to {host} lost: {reason}")]
    SessionLost { host: String, reason: String },
    #[error("{host} is unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },
    #[error("session to {host} is closed")]
    Closed { host: String },
}

impl SessionError {
    /// Whether this failure says something about reaching the host at all,
    /// as opposed to a single dropped session.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Connect { .. } | SessionError::HostUnreachable { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("stream {stream} has a gap: {persisted} bytes persisted, chunk starts at {offset}")]
    Gap {
        stream: String,
        persisted: u64,
        offset: u64,
    },
    #[error("log I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot lock {path}: {reason}")]
    Lock { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal lifecycle transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Naming(#[from] NamingError),
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// The instance never became reachable. It is left running so it can be
    /// inspected by hand.
    #[error("machine '{name}' ({instance_id}) not reachable after {waited_secs}s; left running for inspection")]
    ProvisioningTimeout {
        name: String,
        instance_id: String,
        waited_secs: u64,
    },
    /// The payload or script never made it to the machine.
    #[error("upload to '{name}' failed: {reason} (instance terminated: {terminated})")]
    Upload {
        name: String,
        reason: String,
        terminated: bool,
    },
    /// The instance exists but the launch could not carry on with it.
    #[error("launch of '{name}' ({instance_id}) abandoned (instance terminated: {terminated})")]
    Abandoned {
        name: String,
        instance_id: String,
        terminated: bool,
        #[source]
        source: Box<LaunchError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}


// ---------------------------------------------------------------------------
// FleetError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Naming(#[from] NamingError),
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("no managed machine named '{0}'")]
    UnknownMachine(String),
    #[error("remote command on {host} exited with status {code}")]
    RemoteCommand { host: String, code: i32 },
}

impl FleetError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FleetError::Plan(_)
            | FleetError::Naming(_)
            | FleetError::Settings(_)
            | FleetError::UnknownMachine(_) => ErrorCategory::Configuration,
            FleetError::ControlPlane(_) => ErrorCategory::ControlPlane,
            FleetError::Session(_) | FleetError::RemoteCommand { .. } => {
                ErrorCategory::RemoteExecution
            }
            FleetError::Sync(_) => ErrorCategory::Local,
            FleetError::Launch(e) => e.category(),
        }
    }
}

impl LaunchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LaunchError::Plan(_) | LaunchError::Naming(_) => ErrorCategory::Configuration,
            LaunchError::ControlPlane(_) | LaunchError::ProvisioningTimeout { .. } => {
                ErrorCategory::ControlPlane
            }
            LaunchError::Session(_) | LaunchError::Upload { .. } => {
                ErrorCategory::RemoteExecution
            }
            LaunchError::Transition(_) => ErrorCategory::Local,
            LaunchError::Abandoned { source, .. } => source.category(),
        }
    }
}

/// Find the category of the first fleetlab error anywhere in a source chain.
pub fn categorize(err: &(dyn StdError + 'static)) -> Option<ErrorCategory> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(fe) = e.downcast_ref::<FleetError>() {
            return Some(fe.category());
        }
        if let Some(le) = e.downcast_ref::<LaunchError>() {
            return Some(le.category());
        }
        if e.is::<PlanError>() || e.is::<NamingError>() || e.is::<SettingsError>() {
            return Some(ErrorCategory::Configuration);
        }
        if e.is::<ControlPlaneError>() {
            return Some(ErrorCategory::ControlPlane);
        }
        if e.is::<SessionError>() {
            return Some(ErrorCategory::RemoteExecution);
        }
        if e.is::<SyncError>() {
            return Some(ErrorCategory::Local);
        }
        current = e.source();
    }
    None
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
