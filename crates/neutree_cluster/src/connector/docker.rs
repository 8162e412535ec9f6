use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{shell_quote, CommandRunner};
use crate::util::errors::{Result, StdError};

/// Name of the engine container on every node.
pub const ENGINE_CONTAINER_NAME: &str = "ray_container";

/// Where a command runs on the node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunTarget {
    #[default]
    Host,
    Docker,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Return the command's stdout instead of discarding it
    pub with_output: bool,
    pub stdin: Option<String>,
    pub tty: bool,
    pub env: BTreeMap<String, String>,
    pub target: RunTarget,
}

impl RunOptions {
    pub fn host() -> Self {
        Self::default()
    }

    pub fn docker() -> Self {
        Self {
            target: RunTarget::Docker,
            ..Default::default()
        }
    }

    pub fn with_output(mut self) -> Self {
        self.with_output = true;
        self
    }

    /// Feed `input` to the command's stdin.
    pub fn stdin(mut self, input: &str) -> Self {
        self.stdin = Some(input.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// Runs commands on a node either on the host or inside the engine container.
#[derive(Clone)]
pub struct DockerCommandRunner {
    runner: Arc<dyn CommandRunner>,
    container_name: String,
}

impl DockerCommandRunner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            container_name: ENGINE_CONTAINER_NAME.to_string(),
        }
    }

    pub fn host(&self) -> &str {
        self.runner.host()
    }

    pub fn inner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn wrap(&self, command: &str, options: &RunOptions) -> String {
        let exports: String = options
            .env
            .iter()
            .map(|(k, v)| format!("export {}={}; ", k, shell_quote(v)))
            .collect();
        let command = format!("{exports}{command}");
        match options.target {
            RunTarget::Host => command,
            RunTarget::Docker => format!(
                "docker exec {} {} /bin/bash -lc {}",
                if options.tty { "-it" } else { "-i" },
                self.container_name,
                shell_quote(&command)
            ),
        }
    }

    pub async fn run(&self, command: &str, options: RunOptions) -> Result<String> {
        let wrapped = self.wrap(command, &options);
        let output = self
            .runner
            .execute(&wrapped, options.stdin.as_deref(), options.tty)
            .await?;
        if options.with_output {
            Ok(output)
        } else {
            Ok(String::new())
        }
    }

    pub async fn check_docker_installed(&self) -> Result<bool> {
        match self
            .run("command -v docker", RunOptions::host().with_output())
            .await
        {
            Ok(output) => Ok(!output.trim().is_empty()),
            Err(e) if matches!(e.inner().root(), StdError::CommandFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the engine container is running.
    pub async fn check_container_status(&self) -> Result<bool> {
        let output = self
            .run(
                &format!(
                    "docker inspect -f '{{{{.State.Running}}}}' {} 2>/dev/null || true",
                    self.container_name
                ),
                RunOptions::host().with_output(),
            )
            .await?;
        Ok(output.trim() == "true")
    }

    async fn container_image(&self) -> Result<String> {
        let output = self
            .run(
                &format!(
                    "docker inspect -f '{{{{.Config.Image}}}}' {} 2>/dev/null || true",
                    self.container_name
                ),
                RunOptions::host().with_output(),
            )
            .await?;
        Ok(output.trim().to_string())
    }

    /// Start the engine container from `image`, replacing one running another image.
    ///
    /// Returns `false` when docker refused to start the container; transport
    /// failures are errors.
    pub async fn run_init(
        &self,
        image: &str,
        run_options: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<bool> {
        if !self.check_docker_installed().await? {
            warn!("docker is not installed on {}", self.host());
            return Ok(false);
        }

        if self.check_container_status().await? {
            if self.container_image().await? == image {
                info!("container {} already running {} on {}", self.container_name, image, self.host());
                return Ok(true);
            }
            info!("replacing container {} on {}", self.container_name, self.host());
            self.run(
                &format!(
                    "docker stop {0} && docker rm -f {0}",
                    self.container_name
                ),
                RunOptions::host(),
            )
            .await?;
        }

        let env_options: String = env
            .iter()
            .map(|(k, v)| format!(" -e {}={}", k, shell_quote(v)))
            .collect();
        let start = format!(
            "docker pull {image} && docker run --rm --name {name} -d -it {options}{env_options} --net=host {image} bash",
            name = self.container_name,
            options = run_options.join(" "),
        );
        match self.run(&start, RunOptions::host()).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.inner().root(), StdError::CommandFailed(_)) => {
                warn!("failed to start container on {}: {}", self.host(), e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
