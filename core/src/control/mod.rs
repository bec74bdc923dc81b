//! The cloud control plane seam.
//!
//! [`ControlPlane`] is everything fleetlab asks of the provider: create an
//! instance, claim a name for it, describe it, list the managed fleet, and
//! terminate. `aws` implements it over the AWS CLI; `mock` keeps instances in
//! memory for tests.

pub mod aws;
pub mod mock;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControlPlaneError;

/// Instance tag keys.
pub mod tags {
    pub const NAME: &str = "Name";
    pub const OWNER: &str = "Owner";
    pub const GROUP: &str = "Group";
    /// Marks instances this tool launched.
    pub const MANAGED: &str = "fleetlab:managed";
    pub const REPEATS: &str = "fleetlab:repeats";
    pub const PARALLELISM: &str = "fleetlab:parallelism";
    pub const COMMAND: &str = "fleetlab:command";
}


// ---------------------------------------------------------------------------
// Instance model
// ---------------------------------------------------------------------------

/// Provider-side instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    /// Being terminated (EC2 `shutting-down`).
    ShuttingDown,
    Terminated,
}

impl InstanceStatus {
    pub fn from_ec2(name: &str) -> Option<InstanceStatus> {
        match name {
            "pending" => Some(InstanceStatus::Pending),
            "running" => Some(InstanceStatus::Running),
            "stopping" => Some(InstanceStatus::Stopping),
            "stopped" => Some(InstanceStatus::Stopped),
            "shutting-down" => Some(InstanceStatus::ShuttingDown),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }

    pub fn as_ec2(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::ShuttingDown => "shutting-down",
            InstanceStatus::Terminated => "terminated",
        }
    }

    /// The host has stopped or is on its way down.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopping | InstanceStatus::Stopped | InstanceStatus::ShuttingDown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl InstanceInfo {
    pub fn name(&self) -> Option<&str> {
        self.tags.get(tags::NAME).map(String::as_str)
    }

    pub fn address(&self, prefer_public: bool) -> Option<&str> {
        if prefer_public {
            self.public_ip.as_deref().or(self.private_ip.as_deref())
        } else {
            self.private_ip.as_deref().or(self.public_ip.as_deref())
        }
    }
}

/// Everything needed to create one instance. The name is claimed separately
/// through [`ControlPlane::register_name`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub instance_type: String,
    pub image_id: String,
    pub security_group: Option<String>,
    pub key_name: Option<String>,
    pub tags: Vec<(String, String)>,
}

/// Which managed instances to list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetFilter {
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl FleetFilter {
    pub fn matches(&self, info: &InstanceInfo) -> bool {
        let tag_is = |key: &str, want: &Option<String>| match want {
            Some(v) => info.tags.get(key) == Some(v),
            None => true,
        };
        info.tags.contains_key(tags::MANAGED)
            && tag_is(tags::OWNER, &self.owner)
            && tag_is(tags::GROUP, &self.group)
    }
}


// ---------------------------------------------------------------------------
// ControlPlane
// ---------------------------------------------------------------------------

pub trait ControlPlane: Send + Sync {
    /// Create one instance. Returns its id.
    fn request_instance(&self, request: &LaunchRequest) -> Result<String, ControlPlaneError>;

    /// Tag `instance_id` with `name`. Fails with `NameTaken` if another live
    /// managed instance carries the same name.
    fn register_name(&self, instance_id: &str, name: &str) -> Result<(), ControlPlaneError>;

    /// Current view of one instance, `None` once the provider forgot it.
    fn describe(&self, instance_id: &str) -> Result<Option<InstanceInfo>, ControlPlaneError>;

    /// Managed instances that are not terminated.
    fn list_managed(&self, filter: &FleetFilter) -> Result<Vec<InstanceInfo>, ControlPlaneError>;

    fn terminate(&self, instance_id: &str) -> Result<(), ControlPlaneError>;

    /// Look a managed instance up by name.
    fn find_by_name(
        &self,
        filter: &FleetFilter,
        name: &str,
    ) -> Result<Option<InstanceInfo>, ControlPlaneError> {
        let mut found: Vec<InstanceInfo> = self
            .list_managed(filter)?
            .into_iter()
            .filter(|i| i.name() == Some(name))
            .collect();
        if found.len() > 1 {
            return Err(ControlPlaneError::Malformed {
                operation: "find-by-name".into(),
                detail: format!("{} instances are named '{}'", found.len(), name),
            });
        }
        Ok(found.pop())
    }
}
