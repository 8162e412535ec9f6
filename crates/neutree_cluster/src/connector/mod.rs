//! Remote command execution for the SSH provider.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::util::errors::Result;

pub mod docker;
pub mod launcher;
pub mod ssh;

pub use docker::{DockerCommandRunner, RunOptions, RunTarget, ENGINE_CONTAINER_NAME};
pub use launcher::{ClusterLauncher, RayLauncher};
pub use ssh::SshCommandRunner;

/// Wrap `value` in single quotes for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Executes shell commands on one host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Address of the host
    fn host(&self) -> &str;

    /// Run `command` through the remote login shell and return its stdout.
    ///
    /// Transport failures are `RemoteUnavailable`, a non-zero exit is `CommandFailed`.
    async fn execute(&self, command: &str, stdin: Option<&str>, tty: bool) -> Result<String>;
}

/// How to reach the hosts of one cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct SshTarget {
    pub user: String,
    pub private_key: PathBuf,
}

/// Hands out a runner per node address.
pub trait RunnerFactory: Send + Sync {
    fn runner(&self, target: &SshTarget, ip: &str) -> Arc<dyn CommandRunner>;
}

/// Builds [`SshCommandRunner`]s sharing one command timeout.
#[derive(Clone, Debug)]
pub struct SshRunnerFactory {
    pub command_timeout: Duration,
}

impl RunnerFactory for SshRunnerFactory {
    fn runner(&self, target: &SshTarget, ip: &str) -> Arc<dyn CommandRunner> {
        Arc::new(SshCommandRunner::new(
            ip,
            &target.user,
            target.private_key.clone(),
            self.command_timeout,
        ))
    }
}
