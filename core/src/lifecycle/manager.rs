//! The launch sequence.
//!
//! `LifecycleManager::launch` owns a machine from the request until its
//! script is confirmed running:
//!
//! 1. Allocate a name and request a tagged instance.
//! 2. Claim the name on the instance (one re-allocation on a tie).
//! 3. Wait for the control plane to report it running: `Provisioning`.
//! 4. Open a session, upload the project, transmit the script, start it.
//! 5. Confirm the start marker by a round trip: `Setup`.
//!
//! An instance that never becomes reachable is left running for inspection.
//! Any other failure once the instance exists terminates it.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::control::{tags, ControlPlane, FleetFilter, InstanceStatus, LaunchRequest};
use crate::error::{ControlPlaneError, LaunchError, SessionError};
use crate::naming::NameRegistry;
use crate::plan::{render_script, ExecutionPlan, RemoteLayout, ScriptOptions};
use crate::remote::{Session, Transport};
use crate::types::config::{CloudConfig, LaunchConfig};
use crate::types::machine::{LifecycleState, Machine};

use super::package::Packager;

const HEREDOC_END: &str = "FLEETLAB_EOF";


// ---------------------------------------------------------------------------
// MachineSpec
// ---------------------------------------------------------------------------

/// What kind of machine to launch and who it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSpec {
    pub instance_type: String,
    pub image_id: String,
    pub security_group: Option<String>,
    pub key_name: Option<String>,
    pub owner: String,
    pub group: String,
    pub use_public_address: bool,
}

impl MachineSpec {
    pub fn from_cloud(cloud: &CloudConfig) -> Self {
        MachineSpec {
            instance_type: cloud.instance_type.clone(),
            image_id: cloud.image_id.clone(),
            security_group: cloud.security_group.clone(),
            key_name: cloud.key_name.clone(),
            owner: cloud.owner.clone(),
            group: cloud.group.clone(),
            use_public_address: cloud.use_public_address,
        }
    }

    fn launch_request(&self, plan: &ExecutionPlan) -> LaunchRequest {
        let mut tag_list = vec![
            (tags::MANAGED.to_string(), "true".to_string()),
            (tags::OWNER.to_string(), self.owner.clone()),
            (tags::GROUP.to_string(), self.group.clone()),
        ];
        tag_list.extend(plan.to_tags());
        LaunchRequest {
            instance_type: self.instance_type.clone(),
            image_id: self.image_id.clone(),
            security_group: self.security_group.clone(),
            key_name: self.key_name.clone(),
            tags: tag_list,
        }
    }
}


// ---------------------------------------------------------------------------
// LifecycleManager
// ---------------------------------------------------------------------------

pub struct LifecycleManager {
    control: Arc<dyn ControlPlane>,
    transport: Arc<dyn Transport>,
    packager: Arc<dyn Packager>,
    names: NameRegistry,
    config: LaunchConfig,
}

impl LifecycleManager {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        transport: Arc<dyn Transport>,
        packager: Arc<dyn Packager>,
        config: LaunchConfig,
    ) -> Self {
        LifecycleManager {
            control,
            transport,
            packager,
            names: NameRegistry::new(),
            config,
        }
    }

    pub fn with_names(mut self, names: NameRegistry) -> Self {
        self.names = names;
        self
    }

    pub fn script_options(&self) -> ScriptOptions {
        ScriptOptions::from(&self.config)
    }

    /// Launch one machine for `plan`. Returns once the remote script is
    /// confirmed started, with the machine in `Setup`.
    pub fn launch(&self, plan: &ExecutionPlan, spec: &MachineSpec) -> Result<Machine, LaunchError> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.provisioning_timeout_secs);

        let mut existing: HashSet<String> = self
            .control
            .list_managed(&FleetFilter::default())?
            .iter()
            .filter_map(|i| i.name().map(str::to_string))
            .collect();
        let first_name = self.names.allocate_name(&existing)?;

        let instance_id = self.control.request_instance(&spec.launch_request(plan))?;
        info!(instance_id = %instance_id, name = %first_name, "instance requested");

        let name = match self.claim_name(&instance_id, first_name, &mut existing) {
            Ok(name) => name,
            Err(e) => {
                self.terminate_quietly(&instance_id);
                return Err(e);
            }
        };
        let mut machine = Machine::new(&name, &instance_id, Utc::now(), plan.clone());

        match self.bring_up(&mut machine, plan, spec, deadline, started) {
            Ok(()) => {
                info!(machine = %name, "script started");
                Ok(machine)
            }
            Err(e @ (LaunchError::ProvisioningTimeout { .. } | LaunchError::Upload { .. })) => Err(e),
            Err(e) => {
                warn!(machine = %name, error = %e, "launch failed after the instance was created");
                let terminated = self.terminate_quietly(&instance_id);
                Err(LaunchError::Abandoned {
                    name,
                    instance_id,
                    terminated,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Everything after the instance exists: wait for it, reach it, hand it
    /// the work. Upload failures terminate the instance here; a timeout
    /// leaves it running.
    fn bring_up(
        &self,
        machine: &mut Machine,
        plan: &ExecutionPlan,
        spec: &MachineSpec,
        deadline: Instant,
        started: Instant,
    ) -> Result<(), LaunchError> {
        let address = self.wait_until_running(machine, spec, deadline, started)?;
        machine.address = Some(address.clone());
        machine.transition(LifecycleState::Provisioning)?;
        info!(machine = %machine.name, %address, "provisioning");

        let session = self.open_until(machine, &address, deadline, started)?;
        if let Err(reason) = self.hand_over_work(&session, plan) {
            drop(session);
            let terminated = self.terminate_quietly(&machine.instance_id);
            return Err(LaunchError::Upload {
                name: machine.name.clone(),
                reason,
                terminated,
            });
        }
        drop(session);

        machine.transition(LifecycleState::Setup)?;
        Ok(())
    }

    /// Tag the instance with `name`. On a tie, allocate once more.
    fn claim_name(
        &self,
        instance_id: &str,
        name: String,
        existing: &mut HashSet<String>,
    ) -> Result<String, LaunchError> {
        match self.control.register_name(instance_id, &name) {
            Ok(()) => return Ok(name),
            Err(ControlPlaneError::NameTaken { holder, .. }) => {
                warn!(%name, %holder, "name taken, allocating another");
                existing.insert(name);
            }
            Err(e) => return Err(e.into()),
        }
        let retry = self.names.allocate_name(existing)?;
        self.control.register_name(instance_id, &retry)?;
        Ok(retry)
    }

    /// Poll the control plane until the instance runs and has an address.
    fn wait_until_running(
        &self,
        machine: &Machine,
        spec: &MachineSpec,
        deadline: Instant,
        started: Instant,
    ) -> Result<String, LaunchError> {
        loop {
            let described = match self.control.describe(&machine.instance_id) {
                Ok(described) => described,
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    debug!(machine = %machine.name, error = %e, "describe throttled, retrying");
                    thread::sleep(Duration::from_millis(self.config.provisioning_poll_ms));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match described {
                Some(info) if info.status == InstanceStatus::Running => {
                    if let Some(addr) = info.address(spec.use_public_address) {
                        return Ok(addr.to_string());
                    }
                }
                Some(info) if info.status == InstanceStatus::Pending => {}
                Some(info) => {
                    return Err(ControlPlaneError::Api {
                        operation: "describe-instances".into(),
                        message: format!(
                            "instance {} is {} before it started work",
                            machine.instance_id,
                            info.status.as_ec2()
                        ),
                    }
                    .into());
                }
                None => {
                    return Err(ControlPlaneError::NotFound {
                        id: machine.instance_id.clone(),
                    }
                    .into())
                }
            }
            if Instant::now() >= deadline {
                return Err(self.timeout(machine, started));
            }
            thread::sleep(Duration::from_millis(self.config.provisioning_poll_ms));
        }
    }

    /// Keep trying to open a session until the deadline. sshd comes up some
    /// time after the control plane reports the instance running.
    fn open_until(
        &self,
        machine: &Machine,
        address: &str,
        deadline: Instant,
        started: Instant,
    ) -> Result<Session, LaunchError> {
        loop {
            match Session::open(Arc::clone(&self.transport), address) {
                Ok(session) => return Ok(session),
                Err(e) if e.is_connectivity_failure() || matches!(e, SessionError::SessionLost { .. }) => {
                    debug!(machine = %machine.name, error = %e, "not reachable yet");
                }
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(self.timeout(machine, started));
            }
            thread::sleep(Duration::from_millis(self.config.provisioning_poll_ms));
        }
    }

    fn timeout(&self, machine: &Machine, started: Instant) -> LaunchError {
        warn!(machine = %machine.name, instance_id = %machine.instance_id, "provisioning timed out, leaving instance running");
        LaunchError::ProvisioningTimeout {
            name: machine.name.clone(),
            instance_id: machine.instance_id.clone(),
            waited_secs: started.elapsed().as_secs(),
        }
    }

    /// Upload, transmit and start the script, then confirm it started.
    fn hand_over_work(&self, session: &Session, plan: &ExecutionPlan) -> Result<(), String> {
        let layout = RemoteLayout::new(&self.config.remote_workdir);
        self.packager.upload(session.host(), &layout.project())?;

        let script = render_script(plan, &self.script_options());
        let command = start_command(&layout, &script)?;
        let out = session.run_to_end(&command).map_err(describe_session_error)?;
        if out.exit_code != 0 {
            return Err(format!("starting the script exited with {}", out.exit_code));
        }

        let probe = format!("test -f {} && echo started", layout.started_marker());
        for attempt in 0..self.config.start_confirm_attempts.max(1) {
            let out = session.run_to_end(&probe).map_err(describe_session_error)?;
            if out.text().contains("started") {
                return Ok(());
            }
            debug!(attempt, "start marker not there yet");
            thread::sleep(Duration::from_millis(self.config.start_confirm_delay_ms));
        }
        Err("the script never wrote its start marker".into())
    }

    fn terminate_quietly(&self, instance_id: &str) -> bool {
        match self.control.terminate(instance_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(instance_id, error = %e, "cannot terminate instance after failed launch");
                false
            }
        }
    }
}

/// The remote command that writes the script and starts it detached.
pub fn start_command(layout: &RemoteLayout, script: &str) -> Result<String, String> {
    if script.lines().any(|l| l == HEREDOC_END) {
        return Err(format!("script contains the line '{}'", HEREDOC_END));
    }
    Ok(format!(
        "mkdir -p {wd} && cat > {path} <<'{end}'\n{script}{end}\nchmod +x {path} && nohup {path} > {wd}/run.out 2>&1 < /dev/null &",
        wd = layout.workdir(),
        path = layout.script(),
        end = HEREDOC_END,
        script = script,
    ))
}

fn describe_session_error(e: SessionError) -> String {
    e.to_string()
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::mock::MockControlPlane;
    use crate::lifecycle::package::MockPackager;
    use crate::plan;
    use crate::remote::mock::{MockReply, MockTransport};

    struct Rig {
        control: Arc<MockControlPlane>,
        transport: Arc<MockTransport>,
        packager: Arc<MockPackager>,
    }

    fn rig(packager: MockPackager) -> Rig {
        let transport = Arc::new(MockTransport::new());
        transport.on_exec(|_, cmd| {
            if cmd.contains("echo started") {
                MockReply::output("started\n", 0)
            } else {
                MockReply::output("", 0)
            }
        });
        Rig {
            control: Arc::new(MockControlPlane::new()),
            transport,
            packager: Arc::new(packager),
        }
    }

    fn config() -> LaunchConfig {
        LaunchConfig {
            provisioning_timeout_secs: 0,
            provisioning_poll_ms: 0,
            start_confirm_attempts: 2,
            start_confirm_delay_ms: 0,
            ..LaunchConfig::default()
        }
    }

    fn manager(r: &Rig) -> LifecycleManager {
        LifecycleManager::new(r.control.clone(), r.transport.clone(), r.packager.clone(), config())
            .with_names(NameRegistry::with_pool(&["otter", "heron", "wren"], 0))
    }

    fn spec() -> MachineSpec {
        MachineSpec::from_cloud(&CloudConfig {
            image_id: "ami-1".into(),
            owner: "jara".into(),
            ..CloudConfig::default()
        })
    }

    #[test]
    fn launch_reaches_setup() {
        let r = rig(MockPackager::new());
        let plan = plan::build("echo hi", 3, 2).unwrap();
        let machine = manager(&r).launch(&plan, &spec()).unwrap();

        assert_eq!(machine.state(), LifecycleState::Setup);
        assert_eq!(machine.name, "otter");
        let info = r.control.get(&machine.instance_id).unwrap();
        assert_eq!(info.name(), Some("otter"));
        assert_eq!(info.tags.get(tags::OWNER).map(String::as_str), Some("jara"));
        assert_eq!(info.tags.get(tags::REPEATS).map(String::as_str), Some("3"));

        assert_eq!(r.packager.uploads()[0].1, "fleetlab/project");
        let cmds = r.transport.executed();
        assert!(cmds[0].1.contains("cat > fleetlab/run.sh <<'FLEETLAB_EOF'"));
        assert!(cmds[0].1.contains("nohup fleetlab/run.sh"));
        assert!(cmds[1].1.contains("test -f fleetlab/started"));
        assert_eq!(r.transport.open_connections(), 0);
    }

    #[test]
    fn name_tie_triggers_one_reallocation() {
        let r = rig(MockPackager::new());
        r.control.force_name_conflicts(1);
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let machine = manager(&r).launch(&plan, &spec()).unwrap();
        assert_eq!(machine.name, "heron");
    }

    #[test]
    fn second_tie_fails_and_cleans_up() {
        let r = rig(MockPackager::new());
        r.control.force_name_conflicts(2);
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        assert!(matches!(
            err,
            LaunchError::ControlPlane(ControlPlaneError::NameTaken { .. })
        ));
        assert_eq!(
            r.control.get("i-0001").unwrap().status,
            InstanceStatus::Terminated
        );
    }

    #[test]
    fn upload_failure_terminates_instance() {
        let r = rig(MockPackager::failing("rsync exited with 12"));
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        match err {
            LaunchError::Upload {
                terminated, reason, ..
            } => {
                assert!(terminated);
                assert!(reason.contains("rsync"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            r.control.get("i-0001").unwrap().status,
            InstanceStatus::Terminated
        );
        assert_eq!(r.transport.open_connections(), 0);
    }

    #[test]
    fn unreachable_instance_times_out_and_stays_running() {
        let r = rig(MockPackager::new());
        r.transport.fail_connects("10.0.0.1", 100, |host| SessionError::HostUnreachable {
            host: host.into(),
            reason: "no route".into(),
        });
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        assert!(matches!(err, LaunchError::ProvisioningTimeout { .. }));
        assert_eq!(
            r.control.get("i-0001").unwrap().status,
            InstanceStatus::Running
        );
        assert!(!r.control.calls().contains(&"terminate-instances".to_string()));
        assert!(r.packager.uploads().is_empty());
    }

    #[test]
    fn instance_stuck_pending_times_out() {
        let r = rig(MockPackager::new());
        r.control.set_initial_status(InstanceStatus::Pending);
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        assert!(matches!(err, LaunchError::ProvisioningTimeout { .. }));
    }

    #[test]
    fn control_plane_failure_creates_nothing() {
        let r = rig(MockPackager::new());
        r.control.fail_next(
            "run-instances",
            ControlPlaneError::Api {
                operation: "run-instances".into(),
                message: "InstanceLimitExceeded".into(),
            },
        );
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::ControlPlane);
        assert!(r.control.get("i-0001").is_none());
    }

    fn throttled() -> ControlPlaneError {
        ControlPlaneError::Api {
            operation: "describe-instances".into(),
            message: "An error occurred (RequestLimitExceeded) when calling DescribeInstances".into(),
        }
    }

    #[test]
    fn throttled_describe_is_retried_until_the_deadline() {
        let r = rig(MockPackager::new());
        r.control.fail_next("describe-instances", throttled());
        let patient = LaunchConfig {
            provisioning_timeout_secs: 30,
            ..config()
        };
        let manager = LifecycleManager::new(r.control.clone(), r.transport.clone(), r.packager.clone(), patient)
            .with_names(NameRegistry::with_pool(&["otter"], 0));
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let machine = manager.launch(&plan, &spec()).unwrap();
        assert_eq!(machine.state(), LifecycleState::Setup);
    }

    #[test]
    fn control_plane_failure_after_request_terminates_instance() {
        let r = rig(MockPackager::new());
        r.control.fail_next("describe-instances", throttled());
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        match &err {
            LaunchError::Abandoned {
                instance_id,
                terminated,
                source,
                ..
            } => {
                assert_eq!(instance_id, "i-0001");
                assert!(*terminated);
                assert!(matches!(**source, LaunchError::ControlPlane(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.category(), crate::ErrorCategory::ControlPlane);
        assert_eq!(
            r.control.get("i-0001").unwrap().status,
            InstanceStatus::Terminated
        );
        assert!(r.packager.uploads().is_empty());
    }

    #[test]
    fn instance_gone_before_start_is_cleaned_up() {
        let r = rig(MockPackager::new());
        r.control.set_initial_status(InstanceStatus::Stopped);
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        assert!(matches!(err, LaunchError::Abandoned { terminated: true, .. }));
        assert!(r.control.calls().contains(&"terminate-instances".to_string()));
    }

    #[test]
    fn unconfirmed_start_terminates_instance() {
        let r = rig(MockPackager::new());
        r.transport.on_exec(|_, _| MockReply::output("", 0));
        let plan = plan::build("echo hi", 1, 1).unwrap();
        let err = manager(&r).launch(&plan, &spec()).unwrap_err();
        assert!(matches!(err, LaunchError::Upload { terminated: true, .. }));
    }

    #[test]
    fn start_command_embeds_script_verbatim() {
        let layout = RemoteLayout::new("fleetlab");
        let cmd = start_command(&layout, "echo $HOME\n").unwrap();
        assert!(cmd.contains("<<'FLEETLAB_EOF'\necho $HOME\nFLEETLAB_EOF\n"));
        assert!(start_command(&layout, "x\nFLEETLAB_EOF\n").is_err());
    }
}
