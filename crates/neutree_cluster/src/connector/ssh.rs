use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{shell_quote, CommandRunner};
use crate::util::errors::{Error, Result, StdError};

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Runs commands over the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshCommandRunner {
    ip: String,
    user: String,
    private_key: PathBuf,
    timeout: Duration,
}

impl SshCommandRunner {
    pub fn new(ip: &str, user: &str, private_key: PathBuf, timeout: Duration) -> Self {
        Self {
            ip: ip.to_string(),
            user: user.to_string(),
            private_key,
            timeout,
        }
    }

    fn args(&self, command: &str, tty: bool) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.private_key.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10s".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=5".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if tty {
            args.push("-tt".to_string());
        }
        args.push(format!("{}@{}", self.user, self.ip));
        args.push(format!("bash --login -c -i {}", shell_quote(command)));
        args
    }
}

/// Failure message of a command. The command line is left out since it may carry secrets.
fn exit_message(ip: &str, code: Option<i32>, stderr: &str) -> String {
    match code {
        Some(code) => format!("command on {ip} exited with {code}: {stderr}"),
        None => format!("command on {ip} was killed by a signal: {stderr}"),
    }
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    fn host(&self) -> &str {
        &self.ip
    }

    async fn execute(&self, command: &str, stdin: Option<&str>, tty: bool) -> Result<String> {
        debug!("ssh {}: running command", self.ip);
        let mut child = Command::new("ssh")
            .args(self.args(command, tty))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::StdError(StdError::IoError(e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| Error::StdError(StdError::IoError(e)))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!("ssh {} timed out after {:?}", self.ip, self.timeout);
                Error::StdError(StdError::RemoteUnavailable(format!(
                    "command on {} timed out after {:?}",
                    self.ip, self.timeout
                )))
            })?
            .map_err(|e| Error::StdError(StdError::IoError(e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(SSH_CONNECTION_FAILURE) => Err(Error::StdError(StdError::RemoteUnavailable(
                format!("ssh {}@{}: {}", self.user, self.ip, stderr),
            ))),
            code => Err(Error::StdError(StdError::CommandFailed(exit_message(&self.ip, code, &stderr)))),
        }
    }
}
