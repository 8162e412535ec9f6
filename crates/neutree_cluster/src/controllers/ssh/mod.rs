//! Clusters on static hosts reached over SSH.
//!
//! The head is brought up with the engine's cluster launcher from a
//! bootstrap file rendered into a scratch directory each pass. Workers are
//! started and stopped by the reconciler itself, one task per host, and
//! their progress is kept in `status.nodeProvisionStatus` so that a restart
//! of the controller neither loses nor re-runs work.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::*;

use super::{resolve_registry, ClusterReconciler, Context};
use crate::accelerator::RuntimeConfig;
use crate::api::v1::{Cluster, ImageRegistry, NodeProvisionRecord, NodeResourceInfo};
use crate::config::SshClusterConfig;
use crate::connector::{shell_quote, DockerCommandRunner, RunnerFactory, SshTarget, ENGINE_CONTAINER_NAME};
use crate::resources::{aggregate, resource_status, subtract_resources};
use crate::util::cluster_status::ClusterStatusManager;
use crate::util::errors::{Error, Result, StdError};
use crate::util::registry::{image_prefix, registry_login, RegistryLogin};
use crate::workload::{NodeSummary, WorkloadClient};

mod node;
mod scratch;

pub use node::{drain_command, plan_workers, WorkerPlan, ENGINE_PORT};
use node::{docker_login, start_worker, stop_worker};
use scratch::{BootstrapAuth, BootstrapConfig, BootstrapDocker, BootstrapProvider, ScratchDir};

pub const DASHBOARD_PORT: u16 = 8265;
const ENGINE_IMAGE: &str = "neutree-serve";
const ENGINE_CPU_KEY: &str = "CPU";
const ENGINE_MEMORY_KEY: &str = "memory";

/// Everything needed to start the engine container on a host.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineLaunch {
    pub head_ip: String,
    pub image: String,
    pub run_options: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Registry login run on every host before the image is pulled
    pub login: Option<RegistryLogin>,
    /// Run on the host before the container starts
    pub initialization_commands: Vec<String>,
    /// Run inside the container before the engine starts
    pub start_prefix: Vec<String>,
}

impl EngineLaunch {
    /// `docker run` options with the environment folded in, as the launcher expects them.
    pub fn container_options(&self) -> Vec<String> {
        self.run_options
            .iter()
            .cloned()
            .chain(self.env.iter().map(|(k, v)| format!("-e {k}={}", shell_quote(v))))
            .collect()
    }

    pub fn head_start_commands(&self) -> Vec<String> {
        let mut commands = self.start_prefix.clone();
        commands.push("ray stop".to_string());
        commands.push(format!(
            "ulimit -n 65536; ray start --head --port={ENGINE_PORT} --dashboard-host=0.0.0.0 --dashboard-port={DASHBOARD_PORT} --disable-usage-stats --autoscaling-config=~/ray_bootstrap_config.yaml"
        ));
        commands
    }

    pub fn worker_start_commands(&self) -> Vec<String> {
        let mut commands = self.start_prefix.clone();
        commands.push("ray stop".to_string());
        commands.push(format!(
            "ray start --address={}:{ENGINE_PORT} --disable-usage-stats",
            self.head_ip
        ));
        commands
    }
}

/// Connections of one reconcile pass.
struct Session {
    scratch: ScratchDir,
    target: SshTarget,
    runners: Arc<dyn RunnerFactory>,
    workload: Arc<dyn WorkloadClient>,
    dashboard_url: String,
}

impl Session {
    fn runner(&self, ip: &str) -> DockerCommandRunner {
        DockerCommandRunner::new(self.runners.runner(&self.target, ip))
    }
}

fn live_nodes(nodes: Vec<NodeSummary>) -> BTreeMap<String, NodeSummary> {
    nodes.into_iter().map(|n| (n.ip.clone(), n)).collect()
}

pub struct SshReconciler {
    config: SshClusterConfig,
}

impl SshReconciler {
    pub fn new(config: SshClusterConfig) -> Self {
        Self { config }
    }

    fn head_ip(&self) -> &str {
        &self.config.provider.head_ip
    }

    async fn session(&self, cluster: &Cluster, ctx: &Context) -> Result<Session> {
        let scratch = ScratchDir::create(&cluster.name_any(), &self.config.private_key()?, self.head_ip()).await?;
        let target = SshTarget {
            user: self.config.auth.ssh_user.clone(),
            private_key: scratch.key_path(),
        };
        let dashboard_url = format!("http://{}:{DASHBOARD_PORT}", self.head_ip());
        Ok(Session {
            workload: ctx.workload.client(&dashboard_url),
            runners: ctx.runners.clone(),
            scratch,
            target,
            dashboard_url,
        })
    }

    /// The configured family, else the one found earlier, else whatever the hosts report.
    async fn detect_accelerator(
        &self,
        session: &Session,
        status: &ClusterStatusManager,
        ctx: &Context,
    ) -> Result<String> {
        if !self.config.accelerator_type.is_empty() {
            return Ok(self.config.accelerator_type.clone());
        }
        if !status.status().accelerator_type.is_empty() {
            return Ok(status.status().accelerator_type.clone());
        }

        let ips = self.config.all_ips();
        let probes = ips.iter().map(|ip| {
            let runner = session.runners.runner(&session.target, ip);
            async move { ctx.accelerators.detect(runner.as_ref()).await }
        });
        let mut families = BTreeSet::new();
        for (ip, result) in ips.iter().zip(join_all(probes).await) {
            match result {
                Ok(family) if !family.is_empty() => {
                    debug!("{ip} carries {family}");
                    families.insert(family);
                }
                Ok(_) => {}
                Err(e) if ip == self.head_ip() => return Err(e),
                Err(e) => warn!("failed to detect accelerators on {ip}: {e}"),
            }
        }
        if families.len() > 1 {
            return Err(StdError::HeterogeneousAccelerators(format!(
                "nodes carry {}",
                families.into_iter().collect::<Vec<_>>().join(", ")
            ))
            .into());
        }
        Ok(families.into_iter().next().unwrap_or_default())
    }

    fn engine_launch(
        &self,
        prefix: &str,
        version: &str,
        runtime: &RuntimeConfig,
        login: Option<RegistryLogin>,
    ) -> EngineLaunch {
        let mut run_options = self.config.docker_run_options.clone();
        run_options.extend(runtime.docker_run_options());

        let mut initialization_commands = Vec::new();
        let mut start_prefix = Vec::new();
        for cache in &self.config.model_caches {
            let Some(host_path) = &cache.host_path else {
                warn!(
                    "model cache {} uses a {} backing, which static hosts do not support",
                    cache.name,
                    cache.backing()
                );
                continue;
            };
            let mount = cache.container_mount_path();
            run_options.push(format!("--volume {}:{}", host_path.path, mount));
            initialization_commands.push(format!(
                "mkdir -p {0} && chmod 755 {0}",
                shell_quote(&host_path.path)
            ));
            start_prefix.push(format!("sudo chown -R $(id -u):$(id -g) {}", shell_quote(&mount)));
        }
        initialization_commands.extend(self.config.initialization_commands.iter().cloned());

        EngineLaunch {
            head_ip: self.head_ip().to_string(),
            image: format!("{prefix}/{ENGINE_IMAGE}:{version}{}", runtime.image_suffix),
            run_options,
            env: runtime.env.clone(),
            login,
            initialization_commands,
            start_prefix,
        }
    }

    fn bootstrap(&self, cluster: &Cluster, session: &Session, launch: &EngineLaunch) -> BootstrapConfig {
        BootstrapConfig {
            cluster_name: cluster.name_any(),
            provider: BootstrapProvider {
                type_: "local".to_string(),
                head_ip: self.head_ip().to_string(),
                worker_ips: Vec::new(),
            },
            auth: BootstrapAuth {
                ssh_user: self.config.auth.ssh_user.clone(),
                ssh_private_key: session.target.private_key.display().to_string(),
            },
            docker: BootstrapDocker {
                image: launch.image.clone(),
                container_name: ENGINE_CONTAINER_NAME.to_string(),
                pull_before_run: true,
                run_options: launch.container_options(),
            },
            initialization_commands: launch.initialization_commands.clone(),
            head_start_ray_commands: launch.head_start_commands(),
            worker_start_ray_commands: launch.worker_start_commands(),
        }
    }

    /// Render the bootstrap file for `registry`, which may be unknown during teardown.
    async fn write_bootstrap(
        &self,
        cluster: &Cluster,
        session: &Session,
        registry: Option<&ImageRegistry>,
        runtime: &RuntimeConfig,
    ) -> Result<(EngineLaunch, PathBuf)> {
        let (prefix, login) = match registry {
            Some(registry) => (image_prefix(registry.spec()?)?, registry_login(registry)?),
            None => (String::new(), None),
        };
        let launch = self.engine_launch(&prefix, &cluster.spec()?.version, runtime, login);
        let path = session
            .scratch
            .write_bootstrap(&self.bootstrap(cluster, session, &launch))
            .await?;
        Ok((launch, path))
    }

    /// Make sure the head answers, bringing it up unless that happened moments ago.
    async fn ensure_head(
        &self,
        session: &Session,
        launch: &EngineLaunch,
        bootstrap: &Path,
        status: &mut ClusterStatusManager,
        ctx: &Context,
    ) -> Result<()> {
        if session.workload.get_cluster_metadata().await.is_ok() {
            debug!("head {} is healthy", self.head_ip());
            return Ok(());
        }

        let head_ip = self.head_ip().to_string();
        let window = ctx.config.provisioning_wait_window;
        let record = status.provision_record(&head_ip).cloned();
        if let Some(record) = &record {
            if record.within(window, Utc::now()) {
                return Err(Error::just_provisioned(
                    format!(
                        "head {head_ip} was provisioned at {}, waiting for it to come up",
                        record.last_provision_time.to_rfc3339()
                    ),
                    window,
                ));
            }
        }

        info!("bringing up head {head_ip}");
        if let Err(e) = self.bring_up_head(session, launch, bootstrap, record.is_none(), ctx).await {
            status
                .set_provision_record(&head_ip, NodeProvisionRecord::provisioning(Utc::now(), true))
                .await?;
            return Err(e);
        }
        status
            .set_provision_record(&head_ip, NodeProvisionRecord::provisioned(Utc::now(), true))
            .await?;

        for attempt in 1..=ctx.config.head_health_retries {
            match session.workload.get_cluster_metadata().await {
                Ok(metadata) => {
                    info!("head {head_ip} is up, engine {}", metadata.ray_version);
                    return Ok(());
                }
                Err(e) => {
                    warn!("head {head_ip} not healthy yet (attempt {attempt}): {e}");
                    if attempt < ctx.config.head_health_retries {
                        tokio::time::sleep(ctx.config.head_health_retry_interval).await;
                    }
                }
            }
        }
        Err(StdError::RemoteUnavailable(format!("head {head_ip} is not healthy after bring-up")).into())
    }

    async fn bring_up_head(
        &self,
        session: &Session,
        launch: &EngineLaunch,
        bootstrap: &Path,
        restart: bool,
        ctx: &Context,
    ) -> Result<()> {
        if let Some(login) = &launch.login {
            docker_login(&session.runner(self.head_ip()), login).await?;
        }
        ctx.launcher.up(bootstrap, restart).await
    }

    /// Start and stop workers in parallel and record the outcome. Returns the failures.
    async fn converge_workers(
        &self,
        session: &Session,
        launch: &EngineLaunch,
        status: &mut ClusterStatusManager,
        ctx: &Context,
    ) -> Result<Vec<Error>> {
        let live = live_nodes(session.workload.list_nodes().await?);
        let plan = plan_workers(
            self.head_ip(),
            &self.config.provider.worker_ips,
            &live,
            &status.status().node_provision_status,
            ctx.config.provisioning_wait_window,
            Utc::now(),
        );
        debug!(?plan, "planned workers");
        if plan.to_start.is_empty() && plan.to_stop.is_empty() {
            return Ok(Vec::new());
        }

        let head = session.runner(self.head_ip());
        let starts = plan.to_start.iter().map(|ip| {
            let runner = session.runner(ip);
            async move { (ip.clone(), start_worker(&runner, launch).await) }
        });
        let stops = plan.to_stop.iter().map(|ip| {
            let runner = session.runner(ip);
            let head = &head;
            let live = live.get(ip);
            async move { (ip.clone(), stop_worker(&runner, head, self.head_ip(), live).await) }
        });
        let (started, stopped) = futures::join!(join_all(starts), join_all(stops));

        let now = Utc::now();
        let mut errors = Vec::new();
        let records = &mut status.status_mut().node_provision_status;
        for (ip, result) in started {
            match result {
                Ok(()) => {
                    records.insert(ip, NodeProvisionRecord::provisioned(now, false));
                }
                Err(e) => {
                    warn!("failed to start worker {ip}: {e}");
                    records.insert(ip.clone(), NodeProvisionRecord::provisioning(now, false));
                    errors.push(e.with_key(ip));
                }
            }
        }
        for (ip, result) in stopped {
            match result {
                Ok(()) => {
                    records.remove(&ip);
                }
                Err(e) => {
                    warn!("failed to stop worker {ip}: {e}");
                    errors.push(e.with_key(ip));
                }
            }
        }
        status.persist().await?;
        Ok(errors)
    }

    async fn sync_resources(&self, session: &Session, status: &mut ClusterStatusManager, ctx: &Context) -> Result<()> {
        let nodes = session.workload.list_nodes().await?;
        let mut node_resources = BTreeMap::new();
        for node in nodes.iter().filter(|n| n.is_alive()) {
            let allocatable = &node.raylet.resources;
            let available = subtract_resources(allocatable, &node.used_resources());
            node_resources.insert(
                node.ip.clone(),
                NodeResourceInfo {
                    allocatable: resource_status(
                        allocatable,
                        ENGINE_CPU_KEY,
                        ENGINE_MEMORY_KEY,
                        &ctx.accelerators.parse_engine_resources(allocatable),
                    ),
                    available: resource_status(
                        &available,
                        ENGINE_CPU_KEY,
                        ENGINE_MEMORY_KEY,
                        &ctx.accelerators.parse_engine_resources(&available),
                    ),
                },
            );
        }

        match session.workload.get_cluster_autoscale_status().await {
            Ok(autoscale) => info!(
                active = autoscale.active_nodes.values().sum::<i64>(),
                pending = autoscale.pending_nodes.len(),
                failed = autoscale.failed_nodes.len(),
                "autoscaler status"
            ),
            Err(e) => debug!("autoscaler status unavailable: {e}"),
        }

        let s = status.status_mut();
        s.desired_nodes = (1 + self.config.provider.worker_ips.len()) as i32;
        s.ready_nodes = node_resources.len() as i32;
        s.resource_info = Some(aggregate(node_resources));
        status.persist().await
    }
}

#[async_trait]
impl ClusterReconciler for SshReconciler {
    async fn reconcile(&self, cluster: &Cluster, status: &mut ClusterStatusManager, ctx: &Context) -> Result<()> {
        let registry = resolve_registry(ctx.storage.as_ref(), cluster).await?;
        let session = self.session(cluster, ctx).await?;

        let family = self.detect_accelerator(&session, status, ctx).await?;
        if status.status().accelerator_type != family {
            info!("cluster {} accelerator type is {family:?}", cluster.key());
            status.status_mut().accelerator_type = family.clone();
            status.persist().await?;
        }
        let runtime = ctx.accelerators.runtime_config(&family)?;
        let (launch, bootstrap) = self.write_bootstrap(cluster, &session, Some(&registry), &runtime).await?;

        self.ensure_head(&session, &launch, &bootstrap, status, ctx).await?;
        let s = status.status_mut();
        s.dashboard_url = session.dashboard_url.clone();
        s.version = cluster.spec()?.version.clone();
        status.persist().await?;
        status.mark_initialized().await?;

        let errors = self.converge_workers(&session, &launch, status, ctx).await?;
        self.sync_resources(&session, status, ctx).await?;

        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(StdError::CommandFailed(messages.join("; ")).into());
        }
        Ok(())
    }

    async fn reconcile_delete(
        &self,
        cluster: &Cluster,
        status: &mut ClusterStatusManager,
        ctx: &Context,
    ) -> Result<()> {
        let registry = match resolve_registry(ctx.storage.as_ref(), cluster).await {
            Ok(registry) => Some(registry),
            Err(e) => {
                warn!("tearing down {} without its image registry: {e}", cluster.key());
                None
            }
        };
        let session = self.session(cluster, ctx).await?;
        let family = if self.config.accelerator_type.is_empty() {
            status.status().accelerator_type.clone()
        } else {
            self.config.accelerator_type.clone()
        };
        let runtime = ctx.accelerators.runtime_config(&family).unwrap_or_default();
        let (_, bootstrap) = self.write_bootstrap(cluster, &session, registry.as_ref(), &runtime).await?;

        let live = match session.workload.list_nodes().await {
            Ok(nodes) => live_nodes(nodes),
            Err(e) => {
                debug!("engine unreachable during teardown: {e}");
                BTreeMap::new()
            }
        };
        let workers: BTreeSet<String> = self
            .config
            .provider
            .worker_ips
            .iter()
            .cloned()
            .chain(
                status
                    .status()
                    .node_provision_status
                    .iter()
                    .filter(|(_, record)| !record.is_head)
                    .map(|(ip, _)| ip.clone()),
            )
            .filter(|ip| ip != self.head_ip())
            .collect();

        let head = session.runner(self.head_ip());
        let stops = workers.iter().map(|ip| {
            let runner = session.runner(ip);
            let head = &head;
            let live = live.get(ip);
            async move {
                if let Err(e) = stop_worker(&runner, head, self.head_ip(), live).await {
                    warn!("failed to stop worker {ip}: {e}");
                }
            }
        });
        join_all(stops).await;

        info!("bringing down {}", cluster.key());
        ctx.launcher.down(&bootstrap).await
    }
}
