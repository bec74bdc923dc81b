//! In-memory control plane for tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;

use crate::error::ControlPlaneError;

use super::{tags, ControlPlane, FleetFilter, InstanceInfo, InstanceStatus, LaunchRequest};

#[derive(Default)]
struct State {
    instances: BTreeMap<String, InstanceInfo>,
    next_id: u64,
    /// Queued failures as `(operation, error)`; the first matching one fires.
    failures: VecDeque<(String, ControlPlaneError)>,
    /// Pretend this many `register_name` calls lose a race.
    name_conflicts: u32,
    calls: Vec<String>,
    /// Status new instances start in.
    initial_status: Option<InstanceStatus>,
}

/// A control plane that keeps instances in a map. New instances start
/// `Running` with a private address unless told otherwise.
pub struct MockControlPlane {
    state: Mutex<State>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        MockControlPlane {
            state: Mutex::new(State::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn insert(&self, info: InstanceInfo) {
        self.with_state(|s| {
            s.instances.insert(info.instance_id.clone(), info);
        });
    }

    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        self.with_state(|s| {
            if let Some(info) = s.instances.get_mut(instance_id) {
                info.status = status;
            }
        });
    }

    /// Drop an instance entirely, as the provider eventually does.
    pub fn forget(&self, instance_id: &str) {
        self.with_state(|s| {
            s.instances.remove(instance_id);
        });
    }

    pub fn set_initial_status(&self, status: InstanceStatus) {
        self.with_state(|s| s.initial_status = Some(status));
    }

    pub fn fail_next(&self, operation: &str, err: ControlPlaneError) {
        self.with_state(|s| s.failures.push_back((operation.to_string(), err)));
    }

    pub fn force_name_conflicts(&self, count: u32) {
        self.with_state(|s| s.name_conflicts = count);
    }

    pub fn get(&self, instance_id: &str) -> Option<InstanceInfo> {
        self.with_state(|s| s.instances.get(instance_id).cloned())
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    fn enter(&self, operation: &str) -> Result<(), ControlPlaneError> {
        self.with_state(|s| {
            s.calls.push(operation.to_string());
            match s.failures.iter().position(|(op, _)| op == operation) {
                Some(i) => match s.failures.remove(i) {
                    Some((_, err)) => Err(err),
                    None => Ok(()),
                },
                None => Ok(()),
            }
        })
    }
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlane for MockControlPlane {
    fn request_instance(&self, request: &LaunchRequest) -> Result<String, ControlPlaneError> {
        self.enter("run-instances")?;
        Ok(self.with_state(|s| {
            s.next_id += 1;
            let id = format!("i-{:04}", s.next_id);
            let status = s.initial_status.unwrap_or(InstanceStatus::Running);
            s.instances.insert(
                id.clone(),
                InstanceInfo {
                    instance_id: id.clone(),
                    status,
                    private_ip: Some(format!("10.0.0.{}", s.next_id)),
                    public_ip: None,
                    launch_time: Some(Utc::now()),
                    tags: request.tags.iter().cloned().collect(),
                },
            );
            id
        }))
    }

    fn register_name(&self, instance_id: &str, name: &str) -> Result<(), ControlPlaneError> {
        self.enter("create-tags")?;
        self.with_state(|s| {
            if s.name_conflicts > 0 {
                s.name_conflicts -= 1;
                return Err(ControlPlaneError::NameTaken {
                    name: name.to_string(),
                    holder: "i-rival".into(),
                });
            }
            let holder = s
                .instances
                .values()
                .find(|i| {
                    i.instance_id != instance_id
                        && i.status != InstanceStatus::Terminated
                        && i.name() == Some(name)
                })
                .map(|i| i.instance_id.clone());
            if let Some(holder) = holder {
                return Err(ControlPlaneError::NameTaken {
                    name: name.to_string(),
                    holder,
                });
            }
            match s.instances.get_mut(instance_id) {
                Some(info) => {
                    info.tags.insert(tags::NAME.to_string(), name.to_string());
                    Ok(())
                }
                None => Err(ControlPlaneError::NotFound {
                    id: instance_id.to_string(),
                }),
            }
        })
    }

    fn describe(&self, instance_id: &str) -> Result<Option<InstanceInfo>, ControlPlaneError> {
        self.enter("describe-instances")?;
        Ok(self.get(instance_id))
    }

    fn list_managed(&self, filter: &FleetFilter) -> Result<Vec<InstanceInfo>, ControlPlaneError> {
        self.enter("list-instances")?;
        Ok(self.with_state(|s| {
            s.instances
                .values()
                .filter(|i| i.status != InstanceStatus::Terminated && filter.matches(i))
                .cloned()
                .collect()
        }))
    }

    fn terminate(&self, instance_id: &str) -> Result<(), ControlPlaneError> {
        self.enter("terminate-instances")?;
        self.with_state(|s| match s.instances.get_mut(instance_id) {
            Some(info) => {
                info.status = InstanceStatus::Terminated;
                Ok(())
            }
            None => Err(ControlPlaneError::NotFound {
                id: instance_id.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LaunchRequest {
        LaunchRequest {
            instance_type: "t3.micro".into(),
            image_id: "ami-1".into(),
            security_group: None,
            key_name: None,
            tags: vec![(tags::MANAGED.to_string(), "true".to_string())],
        }
    }

    #[test]
    fn names_are_unique_among_live_instances() {
        let cp = MockControlPlane::new();
        let a = cp.request_instance(&request()).unwrap();
        let b = cp.request_instance(&request()).unwrap();
        cp.register_name(&a, "otter").unwrap();
        assert!(matches!(
            cp.register_name(&b, "otter"),
            Err(ControlPlaneError::NameTaken { .. })
        ));
        cp.terminate(&a).unwrap();
        cp.register_name(&b, "otter").unwrap();
    }

    #[test]
    fn queued_failures_fire_once() {
        let cp = MockControlPlane::new();
        cp.fail_next(
            "run-instances",
            ControlPlaneError::Api {
                operation: "run-instances".into(),
                message: "InstanceLimitExceeded".into(),
            },
        );
        assert!(cp.request_instance(&request()).is_err());
        assert!(cp.request_instance(&request()).is_ok());
    }

    #[test]
    fn find_by_name_uses_the_filter() {
        let cp = MockControlPlane::new();
        let id = cp.request_instance(&request()).unwrap();
        cp.register_name(&id, "heron").unwrap();
        let found = cp.find_by_name(&FleetFilter::default(), "heron").unwrap();
        assert_eq!(found.map(|i| i.instance_id), Some(id));
        assert!(cp.find_by_name(&FleetFilter::default(), "wren").unwrap().is_none());
    }
}
