use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::plan::DEFAULT_SETUP_COMMAND;
use crate::remote::config::SshConfig;
use crate::retry::RetryPolicy;

/// Remote working directory, relative to the remote user's home.
pub const DEFAULT_WORKDIR: &str = "fleetlab";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

/// What the remote script does when the setup step exits nonzero. Either way
/// the monitor reports the machine as `ShuttingDown` with a setup failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SetupFailurePolicy {
    /// Power off and let normal termination take over.
    #[default]
    PowerOff,
    /// Stay up so an operator can log in; `fleetlab kill` ends it.
    KeepForDebugging,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CloudConfig {
    pub region: String,
    pub instance_type: String,
    pub image_id: String,
    pub security_group: Option<String>,
    pub key_name: Option<String>,
    pub owner: String,
    pub group: String,
    /// Connect over the public address instead of the private one.
    pub use_public_address: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            region: "us-east-1".into(),
            instance_type: "p2.xlarge".into(),
            image_id: String::new(),
            security_group: None,
            key_name: None,
            owner: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
            group: "default".into(),
            use_public_address: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// How long to wait for a new instance to accept a session.
    pub provisioning_timeout_secs: u64,
    /// Delay between provisioning checks.
    pub provisioning_poll_ms: u64,
    /// How many round trips to try while confirming the script started.
    pub start_confirm_attempts: u32,
    pub start_confirm_delay_ms: u64,
    /// Dependency installation, run once before any slot starts.
    pub setup_command: String,
    pub setup_failure: SetupFailurePolicy,
    /// Append a power-off to the script. Disabled only for hand-held hosts.
    pub power_off: bool,
    #[serde(skip)]
    pub remote_workdir: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            provisioning_timeout_secs: 600,
            provisioning_poll_ms: 5000,
            start_confirm_attempts: 5,
            start_confirm_delay_ms: 1000,
            setup_command: DEFAULT_SETUP_COMMAND.into(),
            setup_failure: SetupFailurePolicy::PowerOff,
            power_off: true,
            remote_workdir: DEFAULT_WORKDIR.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// How often the control plane is asked for newly launched machines.
    pub discovery_interval_ms: u64,
    /// Consecutive failed polls before a machine is diagnosed `Unreachable`.
    pub unreachable_after: u32,
    /// Reconnect-with-backoff inside a single poll.
    pub connect_retry: RetryPolicy,
    /// Bounded retries for the last log pull of a finished machine.
    pub final_sync_retry: RetryPolicy,
    pub logs_root: PathBuf,
    #[serde(skip)]
    pub remote_workdir: String,
    /// Mirrors `launch.setup_failure` so a failed setup is read the way the
    /// script handled it.
    #[serde(skip)]
    pub setup_failure: SetupFailurePolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            poll_interval_ms: 5000,
            discovery_interval_ms: 15_000,
            unreachable_after: 3,
            connect_retry: RetryPolicy::new(1, BackoffStrategy::Fixed, 2000),
            final_sync_retry: RetryPolicy::new(2, BackoffStrategy::Exponential, 1000),
            logs_root: PathBuf::from("logs"),
            remote_workdir: DEFAULT_WORKDIR.into(),
            setup_failure: SetupFailurePolicy::PowerOff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    /// Local project directory mirrored to the machine.
    pub project_dir: PathBuf,
    pub excludes: Vec<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        PackageConfig {
            project_dir: PathBuf::from("."),
            excludes: vec![
                ".git".into(),
                "__pycache__".into(),
                "*.pyc".into(),
                "target/".into(),
                "logs/".into(),
            ],
        }
    }
}

/// Everything the operator can configure, one section per component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub remote_workdir: Option<String>,
    pub ssh: SshConfig,
    pub cloud: CloudConfig,
    pub launch: LaunchConfig,
    pub monitor: MonitorConfig,
    pub package: PackageConfig,
}

impl Settings {
    /// Load settings from a YAML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Settings, SettingsError> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Settings =
            serde_yaml::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.expand_home();
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.monitor.unreachable_after == 0 {
            return Err(SettingsError::Invalid {
                key: "monitor.unreachable_after".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(SettingsError::Invalid {
                key: "monitor.poll_interval_ms".into(),
                reason: "must be positive".into(),
            });
        }
        let workdir = self.workdir();
        if workdir.is_empty() || workdir.starts_with('/') || workdir.contains("..") {
            return Err(SettingsError::Invalid {
                key: "remote_workdir".into(),
                reason: "must be a relative path inside the remote home".into(),
            });
        }
        // The path is pasted unquoted into remote shell commands.
        if let Some(bad) = workdir.chars().find(|c| !is_plain_path_char(*c)) {
            return Err(SettingsError::Invalid {
                key: "remote_workdir".into(),
                reason: format!("'{}' is not allowed; use letters, digits, '.', '_', '-' and '/'", bad),
            });
        }
        Ok(())
    }

    /// Fail before any side effect if a launch cannot possibly work.
    pub fn validate_for_launch(&self) -> Result<(), SettingsError> {
        if self.cloud.image_id.is_empty() {
            return Err(SettingsError::Invalid {
                key: "cloud.image_id".into(),
                reason: "no machine image configured".into(),
            });
        }
        Ok(())
    }

    pub fn workdir(&self) -> &str {
        self.remote_workdir.as_deref().unwrap_or(DEFAULT_WORKDIR)
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            remote_workdir: self.workdir().to_string(),
            ..self.launch.clone()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            remote_workdir: self.workdir().to_string(),
            setup_failure: self.launch.setup_failure,
            ..self.monitor.clone()
        }
    }

    fn expand_home(&mut self) {
        if let Some(key) = self.ssh.key_file.take() {
            self.ssh.key_file = Some(expand_tilde(&key));
        }
        self.package.project_dir = expand_tilde(&self.package.project_dir);
        self.monitor.logs_root = expand_tilde(&self.monitor.logs_root);
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Ok(rest), Ok(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn is_plain_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')
}
