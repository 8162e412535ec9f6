use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::util::errors::{Error, Result, StdError};

/// Runs the engine's cluster bring-up and bring-down jobs.
#[async_trait]
pub trait ClusterLauncher: Send + Sync {
    /// Bring the head up from `bootstrap`. `restart` restarts engine processes that already run.
    async fn up(&self, bootstrap: &Path, restart: bool) -> Result<()>;

    async fn down(&self, bootstrap: &Path) -> Result<()>;
}

/// Drives the `ray` cluster launcher CLI.
#[derive(Clone, Debug)]
pub struct RayLauncher {
    binary: String,
    timeout: Duration,
}

impl RayLauncher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "ray".to_string(),
            timeout,
        }
    }

    fn up_args(bootstrap: &Path, restart: bool) -> Vec<String> {
        let mut args = vec![
            "up".to_string(),
            "-y".to_string(),
            bootstrap.display().to_string(),
            "--disable-usage-stats".to_string(),
            "--no-config-cache".to_string(),
        ];
        if !restart {
            args.push("--no-restart".to_string());
        }
        args
    }

    fn down_args(bootstrap: &Path) -> Vec<String> {
        vec![
            "down".to_string(),
            "-y".to_string(),
            bootstrap.display().to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>, bootstrap: &Path) -> Result<()> {
        info!("running {} {}", self.binary, args.join(" "));
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // the launcher reads its node state from $TMPDIR/ray/cluster-<name>.state
        if let Some(dir) = bootstrap.parent() {
            command.current_dir(dir).env("TMPDIR", dir);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                Error::StdError(StdError::CommandFailed(format!(
                    "{} {} timed out after {:?}",
                    self.binary, args[0], self.timeout
                )))
            })?
            .map_err(|e| Error::StdError(StdError::IoError(e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        warn!("{} {} failed: {}", self.binary, args[0], tail.join("\n"));
        Err(Error::StdError(StdError::CommandFailed(format!(
            "{} {} exited with {:?}: {}",
            self.binary,
            args[0],
            output.status.code(),
            tail.join("\n")
        ))))
    }
}

#[async_trait]
impl ClusterLauncher for RayLauncher {
    async fn up(&self, bootstrap: &Path, restart: bool) -> Result<()> {
        self.run(Self::up_args(bootstrap, restart), bootstrap).await
    }

    async fn down(&self, bootstrap: &Path) -> Result<()> {
        self.run(Self::down_args(bootstrap), bootstrap).await
    }
}
