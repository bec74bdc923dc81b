//! EC2 through the AWS CLI.
//!
//! Every call is one `aws ec2 ...` invocation through a [`CommandRunner`],
//! asking for JSON output and decoding only the fields fleetlab reads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ControlPlaneError;
use crate::infrastructure::CommandRunner;

use super::{tags, ControlPlane, FleetFilter, InstanceInfo, InstanceStatus, LaunchRequest};

/// States that still hold a name.
const LIVE_STATES: &str = "pending,running,stopping,stopped,shutting-down";


// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeResponse {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    state: Ec2State,
    private_ip_address: Option<String>,
    public_ip_address: Option<String>,
    launch_time: Option<String>,
    #[serde(default)]
    tags: Vec<Ec2Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2State {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunResponse {
    instances: Vec<RunInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstance {
    instance_id: String,
}

impl Ec2Instance {
    fn into_info(self, operation: &str) -> Result<InstanceInfo, ControlPlaneError> {
        let status =
            InstanceStatus::from_ec2(&self.state.name).ok_or_else(|| ControlPlaneError::Malformed {
                operation: operation.to_string(),
                detail: format!("unknown instance state '{}'", self.state.name),
            })?;
        let launch_time = self
            .launch_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(InstanceInfo {
            instance_id: self.instance_id,
            status,
            private_ip: self.private_ip_address,
            public_ip: self.public_ip_address,
            launch_time,
            tags: self.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        })
    }
}


// ---------------------------------------------------------------------------
// AwsCliControlPlane
// ---------------------------------------------------------------------------

pub struct AwsCliControlPlane {
    runner: Arc<dyn CommandRunner>,
    region: String,
}

impl AwsCliControlPlane {
    pub fn new(runner: Arc<dyn CommandRunner>, region: &str) -> Self {
        AwsCliControlPlane {
            runner,
            region: region.to_string(),
        }
    }

    /// Run `aws ec2 <operation> <args>` and return stdout.
    fn call(&self, operation: &str, args: Vec<String>) -> Result<String, ControlPlaneError> {
        let mut full = vec![
            "ec2".to_string(),
            operation.to_string(),
            "--region".to_string(),
            self.region.clone(),
            "--output".to_string(),
            "json".to_string(),
        ];
        full.extend(args);
        debug!(operation, "aws call");
        let output = self
            .runner
            .run("aws", &full)
            .map_err(|e| ControlPlaneError::Api {
                operation: operation.to_string(),
                message: format!("cannot run aws cli: {}", e),
            })?;
        if !output.success() {
            return Err(ControlPlaneError::Api {
                operation: operation.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout_text())
    }

    fn describe_with(
        &self,
        args: Vec<String>,
    ) -> Result<Vec<InstanceInfo>, ControlPlaneError> {
        let operation = "describe-instances";
        let stdout = self.call(operation, args)?;
        let parsed: DescribeResponse =
            serde_json::from_str(&stdout).map_err(|e| ControlPlaneError::Malformed {
                operation: operation.to_string(),
                detail: e.to_string(),
            })?;
        parsed
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(|i| i.into_info(operation))
            .collect()
    }

    /// Live managed instances other than `instance_id` named `name`.
    fn name_holders(&self, instance_id: &str, name: &str) -> Result<Vec<String>, ControlPlaneError> {
        let holders = self.describe_with(vec![
            "--filters".to_string(),
            format!("Name=tag:{},Values={}", tags::NAME, name),
            format!("Name=tag-key,Values={}", tags::MANAGED),
            format!("Name=instance-state-name,Values={}", LIVE_STATES),
        ])?;
        Ok(holders
            .into_iter()
            .map(|i| i.instance_id)
            .filter(|id| id != instance_id)
            .collect())
    }
}

/// The `--tag-specifications` JSON for run-instances.
pub fn tag_specifications(tag_list: &[(String, String)]) -> String {
    let tag_values: Vec<serde_json::Value> = tag_list
        .iter()
        .map(|(k, v)| serde_json::json!({ "Key": k, "Value": v }))
        .collect();
    serde_json::json!([{ "ResourceType": "instance", "Tags": tag_values }]).to_string()
}

impl ControlPlane for AwsCliControlPlane {
    fn request_instance(&self, request: &LaunchRequest) -> Result<String, ControlPlaneError> {
        let operation = "run-instances";
        let mut args = vec![
            "--image-id".to_string(),
            request.image_id.clone(),
            "--instance-type".to_string(),
            request.instance_type.clone(),
            "--count".to_string(),
            "1".to_string(),
            "--instance-initiated-shutdown-behavior".to_string(),
            "terminate".to_string(),
            "--tag-specifications".to_string(),
            tag_specifications(&request.tags),
        ];
        if let Some(ref sg) = request.security_group {
            args.push("--security-group-ids".to_string());
            args.push(sg.clone());
        }
        if let Some(ref key) = request.key_name {
            args.push("--key-name".to_string());
            args.push(key.clone());
        }
        let stdout = self.call(operation, args)?;
        let parsed: RunResponse =
            serde_json::from_str(&stdout).map_err(|e| ControlPlaneError::Malformed {
                operation: operation.to_string(),
                detail: e.to_string(),
            })?;
        let id = parsed
            .instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| ControlPlaneError::Malformed {
                operation: operation.to_string(),
                detail: "no instance in response".into(),
            })?;
        info!(instance_id = %id, "instance requested");
        Ok(id)
    }

    fn register_name(&self, instance_id: &str, name: &str) -> Result<(), ControlPlaneError> {
        if let Some(holder) = self.name_holders(instance_id, name)?.into_iter().next() {
            return Err(ControlPlaneError::NameTaken {
                name: name.to_string(),
                holder,
            });
        }
        self.call(
            "create-tags",
            vec![
                "--resources".to_string(),
                instance_id.to_string(),
                "--tags".to_string(),
                format!("Key={},Value={}", tags::NAME, name),
            ],
        )?;

        // Two launches may have tagged at the same time. The lowest instance
        // id keeps the name.
        let rivals = self.name_holders(instance_id, name)?;
        if let Some(holder) = rivals.into_iter().filter(|id| id.as_str() < instance_id).min() {
            warn!(name, instance_id, %holder, "name collision, releasing");
            self.call(
                "delete-tags",
                vec![
                    "--resources".to_string(),
                    instance_id.to_string(),
                    "--tags".to_string(),
                    format!("Key={}", tags::NAME),
                ],
            )?;
            return Err(ControlPlaneError::NameTaken {
                name: name.to_string(),
                holder,
            });
        }
        Ok(())
    }

    fn describe(&self, instance_id: &str) -> Result<Option<InstanceInfo>, ControlPlaneError> {
        let result = self.describe_with(vec!["--instance-ids".to_string(), instance_id.to_string()]);
        match result {
            Ok(mut found) => Ok(found.pop()),
            Err(ControlPlaneError::Api { ref message, .. })
                if message.contains("InvalidInstanceID.NotFound") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn list_managed(&self, filter: &FleetFilter) -> Result<Vec<InstanceInfo>, ControlPlaneError> {
        let mut filters = vec![
            format!("Name=tag-key,Values={}", tags::MANAGED),
            format!("Name=instance-state-name,Values={}", LIVE_STATES),
        ];
        if let Some(ref owner) = filter.owner {
            filters.push(format!("Name=tag:{},Values={}", tags::OWNER, owner));
        }
        if let Some(ref group) = filter.group {
            filters.push(format!("Name=tag:{},Values={}", tags::GROUP, group));
        }
        let mut args = vec!["--filters".to_string()];
        args.extend(filters);
        let found = self.describe_with(args)?;
        Ok(found.into_iter().filter(|i| filter.matches(i)).collect())
    }

    fn terminate(&self, instance_id: &str) -> Result<(), ControlPlaneError> {
        self.call(
            "terminate-instances",
            vec!["--instance-ids".to_string(), instance_id.to_string()],
        )?;
        info!(instance_id, "termination requested");
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
