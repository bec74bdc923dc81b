//! Project upload.
//!
//! The project directory is mirrored to the machine with rsync over the same
//! ssh options the sessions use. `Packager` is the seam the launch sequence
//! calls; `MockPackager` records uploads for tests.

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::infrastructure::CommandRunner;
use crate::remote::SshConfig;
use crate::types::config::PackageConfig;

pub trait Packager: Send + Sync {
    /// Copy the project to `remote_dir` on `host`, creating it if needed.
    fn upload(&self, host: &str, remote_dir: &str) -> Result<(), String>;
}


// ---------------------------------------------------------------------------
// RsyncPackager
// ---------------------------------------------------------------------------

pub struct RsyncPackager {
    ssh: SshConfig,
    package: PackageConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RsyncPackager {
    pub fn new(ssh: SshConfig, package: PackageConfig, runner: Arc<dyn CommandRunner>) -> Self {
        RsyncPackager {
            ssh,
            package,
            runner,
        }
    }

    /// The rsync argument vector for one upload.
    pub fn build_rsync_args(&self, host: &str, remote_dir: &str) -> Vec<String> {
        let mut args = vec![
            "-az".to_string(),
            "--delete".to_string(),
            "--partial".to_string(),
            format!("--rsync-path=mkdir -p {} && rsync", remote_dir),
            "-e".to_string(),
            self.ssh.rsync_shell(),
        ];
        for pattern in &self.package.excludes {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        args.push(ensure_trailing_slash(
            &self.package.project_dir.display().to_string(),
        ));
        args.push(format!(
            "{}:{}",
            self.ssh.user_at_host(host),
            ensure_trailing_slash(remote_dir)
        ));
        args
    }
}

impl Packager for RsyncPackager {
    fn upload(&self, host: &str, remote_dir: &str) -> Result<(), String> {
        info!(host, project = %self.package.project_dir.display(), "uploading project");
        let output = self
            .runner
            .run("rsync", &self.build_rsync_args(host, remote_dir))
            .map_err(|e| format!("cannot run rsync: {}", e))?;
        if output.success() {
            Ok(())
        } else {
            Err(format!(
                "rsync exited with {}: {}",
                output
                    .status
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "a signal".into()),
                output.stderr.trim()
            ))
        }
    }
}

/// Ensure a path ends with `/` (rsync convention for syncing directory contents).
fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}


// ---------------------------------------------------------------------------
// MockPackager
// ---------------------------------------------------------------------------

/// Records uploads; fails every upload when built with [`MockPackager::failing`].
#[derive(Default)]
pub struct MockPackager {
    failure: Option<String>,
    uploads: Mutex<Vec<(String, String)>>,
}

impl MockPackager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        MockPackager {
            failure: Some(reason.to_string()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Uploads so far as `(host, remote_dir)`.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

impl Packager for MockPackager {
    fn upload(&self, host: &str, remote_dir: &str) -> Result<(), String> {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push((host.to_string(), remote_dir.to_string()));
        }
        match &self.failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{MockRunner, ProcessOutput};
    use std::path::PathBuf;

    fn packager(runner: Arc<MockRunner>) -> RsyncPackager {
        let package = PackageConfig {
            project_dir: PathBuf::from("/home/me/exp"),
            excludes: vec![".git".into(), "logs/".into()],
        };
        RsyncPackager::new(SshConfig::default(), package, runner)
    }

    #[test]
    fn rsync_args_mirror_project_into_remote_dir() {
        let p = packager(Arc::new(MockRunner::new()));
        let args = p.build_rsync_args("10.0.0.7", "fleetlab/project");
        assert_eq!(args[0], "-az");
        assert!(args.contains(&"--rsync-path=mkdir -p fleetlab/project && rsync".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--exclude" && w[1] == "logs/"));
        let n = args.len();
        assert_eq!(args[n - 2], "/home/me/exp/");
        assert_eq!(args[n - 1], "ubuntu@10.0.0.7:fleetlab/project/");
        let e = args.iter().position(|a| a == "-e").unwrap();
        assert!(args[e + 1].starts_with("ssh -p 22"));
    }

    #[test]
    fn upload_failure_carries_stderr() {
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(ProcessOutput::failed(
            12,
            "rsync: connection unexpectedly closed",
        ))]));
        let err = packager(runner).upload("h", "fleetlab/project").unwrap_err();
        assert!(err.contains("12"));
        assert!(err.contains("connection unexpectedly closed"));
    }

    #[test]
    fn upload_runs_rsync() {
        let runner = Arc::new(MockRunner::new());
        packager(runner.clone()).upload("h", "fleetlab/project").unwrap();
        assert_eq!(runner.executed_commands()[0].0, "rsync");
    }

    #[test]
    fn trailing_slash() {
        assert_eq!(ensure_trailing_slash("a"), "a/");
        assert_eq!(ensure_trailing_slash("a/"), "a/");
    }
}
