//! SSH coordinates shared by every machine in the fleet.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How to reach a machine over ssh. The host itself comes from the control
/// plane; everything else is common to the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    /// Private key, if not using the agent or the default identity.
    pub key_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Fresh instances have unknown host keys; checking is off by default.
    pub strict_host_key_checking: bool,
    /// Where control sockets live. Defaults to the system temp directory.
    pub control_dir: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: "ubuntu".into(),
            port: 22,
            key_file: None,
            connect_timeout_secs: 10,
            strict_host_key_checking: false,
            control_dir: None,
        }
    }
}

impl SshConfig {
    /// Build the `user@host` string used in ssh/rsync commands.
    pub fn user_at_host(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    /// Base ssh options (port, timeouts, key) without a destination.
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if self.strict_host_key_checking { "yes" } else { "no" }
            ),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ];
        if let Some(ref key) = self.key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    /// The `-e` value for rsync, so transfers use the same options.
    pub fn rsync_shell(&self) -> String {
        let mut cmd = String::from("ssh");
        for arg in self.base_args() {
            cmd.push(' ');
            cmd.push_str(&arg);
        }
        cmd
    }

    pub fn control_dir(&self) -> PathBuf {
        self.control_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("fleetlab-ssh"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_include_port_and_timeout() {
        let cfg = SshConfig {
            port: 2222,
            connect_timeout_secs: 7,
            ..SshConfig::default()
        };
        let args = cfg.base_args();
        assert_eq!(&args[..2], &["-p".to_string(), "2222".to_string()]);
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn key_file_is_passed() {
        let cfg = SshConfig {
            key_file: Some(PathBuf::from("/home/me/.ssh/exp.pem")),
            ..SshConfig::default()
        };
        let args = cfg.base_args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/me/.ssh/exp.pem");
        assert!(cfg.rsync_shell().ends_with("-i /home/me/.ssh/exp.pem"));
    }

    #[test]
    fn user_at_host() {
        assert_eq!(SshConfig::default().user_at_host("10.0.0.5"), "ubuntu@10.0.0.5");
    }
}
