//! Per-machine connection health.
//!
//! `ConnectionHealth` remembers how the last attempts to reach one machine
//! went and counts consecutive connectivity failures. The monitor compares
//! that count against its threshold to diagnose `Unreachable`. No network
//! calls happen here.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;


// ---------------------------------------------------------------------------
// ConnState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    /// Nothing attempted yet.
    Unknown,
    Connected {
        since_ms: u64,
    },
    /// The last session dropped; the host itself answered recently.
    Dropped {
        reason: String,
        at_ms: u64,
    },
    /// The last attempt could not reach the host.
    Failed {
        reason: String,
        at_ms: u64,
    },
}


// ---------------------------------------------------------------------------
// ConnectionHealth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub state: ConnState,
    /// Total attempts, successful or not.
    pub attempts: u32,
    /// Connectivity failures since the last success.
    pub consecutive_failures: u32,
    pub last_success_ms: Option<u64>,
    pub last_failure_ms: Option<u64>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        ConnectionHealth {
            state: ConnState::Unknown,
            attempts: 0,
            consecutive_failures: 0,
            last_success_ms: None,
            last_failure_ms: None,
        }
    }

    pub fn record_success(&mut self, now_ms: u64) {
        self.attempts += 1;
        self.consecutive_failures = 0;
        self.last_success_ms = Some(now_ms);
        self.state = ConnState::Connected { since_ms: now_ms };
    }

    /// Record a failed attempt. Only connectivity failures count toward the
    /// consecutive total; a dropped session is noted and otherwise ignored.
    /// Returns the consecutive failure count.
    pub fn record_failure(&mut self, err: &SessionError, now_ms: u64) -> u32 {
        self.attempts += 1;
        self.last_failure_ms = Some(now_ms);
        if err.is_connectivity_failure() {
            self.consecutive_failures += 1;
            self.state = ConnState::Failed {
                reason: err.to_string(),
                at_ms: now_ms,
            };
        } else {
            self.state = ConnState::Dropped {
                reason: err.to_string(),
                at_ms: now_ms,
            };
        }
        self.consecutive_failures
    }

    /// Whether `threshold` consecutive polls have failed to reach the host.
    pub fn exceeds(&self, threshold: u32) -> bool {
        self.consecutive_failures >= threshold
    }

    /// Last failure reason, if the latest attempt failed.
    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            ConnState::Dropped { reason, .. } | ConnState::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> SessionError {
        SessionError::Connect {
            host: "h".into(),
            reason: "refused".into(),
        }
    }

    fn dropped() -> SessionError {
        SessionError::SessionLost {
            host: "h".into(),
            reason: "reset".into(),
        }
    }

    #[test]
    fn starts_unknown() {
        let h = ConnectionHealth::new();
        assert_eq!(h.state, ConnState::Unknown);
        assert!(!h.exceeds(1));
    }

    #[test]
    fn consecutive_failures_reach_threshold() {
        let mut h = ConnectionHealth::new();
        assert_eq!(h.record_failure(&refused(), 1), 1);
        assert_eq!(h.record_failure(&refused(), 2), 2);
        assert!(!h.exceeds(3));
        assert_eq!(h.record_failure(&refused(), 3), 3);
        assert!(h.exceeds(3));
        assert_eq!(h.attempts, 3);
        assert!(h.last_error().unwrap().contains("refused"));
    }

    #[test]
    fn success_resets_the_count() {
        let mut h = ConnectionHealth::new();
        h.record_failure(&refused(), 1);
        h.record_failure(&refused(), 2);
        h.record_success(3);
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.state, ConnState::Connected { since_ms: 3 });
        assert_eq!(h.last_success_ms, Some(3));
        assert!(h.last_error().is_none());
    }

    #[test]
    fn dropped_sessions_do_not_count() {
        let mut h = ConnectionHealth::new();
        h.record_failure(&refused(), 1);
        assert_eq!(h.record_failure(&dropped(), 2), 1);
        assert!(matches!(h.state, ConnState::Dropped { .. }));
        assert_eq!(h.last_failure_ms, Some(2));
    }
}
