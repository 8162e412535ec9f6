//! Worker node planning and the start / stop operations run on each host.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{info, warn};

use super::EngineLaunch;
use crate::api::v1::NodeProvisionRecord;
use crate::connector::{shell_quote, DockerCommandRunner, RunOptions, ENGINE_CONTAINER_NAME};
use crate::util::errors::{Result, StdError};
use crate::util::registry::RegistryLogin;
use crate::workload::NodeSummary;

/// Port of the engine's global control store on the head.
pub const ENGINE_PORT: u16 = 6379;
pub const DRAIN_REASON: &str = "DRAIN_NODE_REASON_PREEMPTION";
pub const DRAIN_MESSAGE: &str = "stop node";
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(600);

/// Which workers to start, which to stop and which to leave alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerPlan {
    pub to_start: Vec<String>,
    pub to_stop: Vec<String>,
    pub skip: Vec<String>,
}

/// Plan one pass from the declared workers, the nodes the engine reports and
/// the persisted provision records.
pub fn plan_workers(
    head_ip: &str,
    desired: &[String],
    live: &BTreeMap<String, NodeSummary>,
    records: &BTreeMap<String, NodeProvisionRecord>,
    window: Duration,
    now: DateTime<Utc>,
) -> WorkerPlan {
    let mut plan = WorkerPlan::default();
    for ip in desired {
        let alive = live.get(ip).is_some_and(NodeSummary::is_alive);
        let start = match records.get(ip) {
            None => true,
            Some(record) if !record.is_provisioned() => true,
            Some(record) => !alive && !record.within(window, now),
        };
        if start {
            plan.to_start.push(ip.clone());
        } else {
            plan.skip.push(ip.clone());
        }
    }

    let desired: BTreeSet<&String> = desired.iter().collect();
    plan.to_stop = records
        .iter()
        .filter(|(ip, record)| ip.as_str() != head_ip && !record.is_head && !desired.contains(ip))
        .map(|(ip, _)| ip.clone())
        .collect();
    plan
}

/// Log the host's docker daemon into the image registry. The password goes through stdin.
pub async fn docker_login(runner: &DockerCommandRunner, login: &RegistryLogin) -> Result<()> {
    runner
        .run(&login.command(), RunOptions::host().stdin(&login.password))
        .await
        .map(|_| ())
}

/// Run the initialization commands, start the engine container and join the worker to the head.
pub async fn start_worker(runner: &DockerCommandRunner, launch: &EngineLaunch) -> Result<()> {
    info!("starting worker {}", runner.host());
    if let Some(login) = &launch.login {
        docker_login(runner, login).await?;
    }
    for command in &launch.initialization_commands {
        runner
            .run(command, RunOptions::host().env("RAY_HEAD_IP", &launch.head_ip))
            .await?;
    }

    if !runner.run_init(&launch.image, &launch.run_options, &launch.env).await? {
        return Err(StdError::CommandFailed(format!(
            "engine container did not start on {}",
            runner.host()
        ))
        .into());
    }

    for command in launch.worker_start_commands() {
        runner
            .run(&command, RunOptions::docker().env("RAY_HEAD_IP", &launch.head_ip))
            .await?;
    }
    info!("worker {} started", runner.host());
    Ok(())
}

pub fn drain_command(head_ip: &str, node_id: &str) -> String {
    format!(
        "ray drain-node --address={head_ip}:{ENGINE_PORT} --node-id={node_id} --reason={DRAIN_REASON} --reason-message={} --deadline-remaining-seconds={}",
        shell_quote(DRAIN_MESSAGE),
        DRAIN_DEADLINE.as_secs()
    )
}

/// Ask the head to move work off `node`. A node the engine does not know, or
/// no longer considers alive, needs no drain.
pub async fn drain(head: &DockerCommandRunner, head_ip: &str, node: Option<&NodeSummary>) -> Result<()> {
    let Some(node) = node.filter(|n| n.is_alive()) else {
        return Ok(());
    };
    info!("draining {} ({})", node.ip, node.raylet.node_id);
    head.run(&drain_command(head_ip, &node.raylet.node_id), RunOptions::docker())
        .await
        .map(|_| ())
}

/// Drain, then stop the engine and its container. Draining is best effort.
pub async fn stop_worker(
    runner: &DockerCommandRunner,
    head: &DockerCommandRunner,
    head_ip: &str,
    live: Option<&NodeSummary>,
) -> Result<()> {
    info!("stopping worker {}", runner.host());
    if let Err(e) = drain(head, head_ip, live).await {
        warn!("failed to drain {}: {}", runner.host(), e);
    }
    if runner.check_container_status().await? {
        runner.run("ray stop", RunOptions::docker()).await?;
        runner
            .run(&format!("docker stop {ENGINE_CONTAINER_NAME}"), RunOptions::host())
            .await?;
    }
    info!("worker {} stopped", runner.host());
    Ok(())
}
