//! Per-cluster reconcilers and the context they share.

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::accelerator::{AcceleratorManager, PluginAcceleratorManager};
use crate::api::v1::{Cluster, ImageRegistry};
use crate::applier::{KubeObjectStore, ObjectStore};
use crate::config::{parse_cluster_config, ControllerConfig, KubernetesClusterConfig, ProviderConfig};
use crate::connector::{ClusterLauncher, RayLauncher, RunnerFactory, SshRunnerFactory};
use crate::storage::{get_image_registry, Storage};
use crate::util::cluster_status::ClusterStatusManager;
use crate::util::errors::{Error, Result, StdError};
use crate::util::metrics::Metrics;
use crate::workload::{DashboardClientFactory, WorkloadClientFactory};

pub mod cluster_controller;
pub mod kubernetes;
pub mod ssh;

pub use cluster_controller::{reconcile, run, Action, Diagnostics, State};
pub use kubernetes::KubernetesReconciler;
pub use ssh::SshReconciler;

const DASHBOARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a Kubernetes provider config into a handle on the host's object tree.
#[async_trait]
pub trait HostConnector: Send + Sync {
    async fn connect(&self, config: &KubernetesClusterConfig) -> Result<Arc<dyn ObjectStore>>;
}

/// [`HostConnector`] building a kube client from the embedded kubeconfig.
#[derive(Clone, Debug, Default)]
pub struct KubeconfigConnector;

impl KubeconfigConnector {
    async fn client(kubeconfig: Kubeconfig) -> Result<Client> {
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| StdError::ConfigError(format!("kubeconfig cannot be loaded: {e}")))?;
        Client::try_from(config).map_err(|e| Error::StdError(StdError::KubeError(e)))
    }
}

#[async_trait]
impl HostConnector for KubeconfigConnector {
    async fn connect(&self, config: &KubernetesClusterConfig) -> Result<Arc<dyn ObjectStore>> {
        let client = Self::client(config.decoded_kubeconfig()?).await?;
        Ok(Arc::new(KubeObjectStore::new(client)))
    }
}

/// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    pub storage: Arc<dyn Storage>,
    pub config: ControllerConfig,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub runners: Arc<dyn RunnerFactory>,
    pub launcher: Arc<dyn ClusterLauncher>,
    pub workload: Arc<dyn WorkloadClientFactory>,
    pub accelerators: Arc<dyn AcceleratorManager>,
    pub hosts: Arc<dyn HostConnector>,
}

impl Context {
    /// Context backed by ssh, the `ray` CLI, the engine dashboard and kubeconfig clients.
    pub fn new(
        storage: Arc<dyn Storage>,
        config: ControllerConfig,
        metrics: Metrics,
        diagnostics: Arc<RwLock<Diagnostics>>,
    ) -> Self {
        Self {
            storage,
            runners: Arc::new(SshRunnerFactory {
                command_timeout: config.command_timeout,
            }),
            launcher: Arc::new(RayLauncher::new(config.launcher_timeout)),
            workload: Arc::new(DashboardClientFactory {
                timeout: DASHBOARD_TIMEOUT,
            }),
            accelerators: Arc::new(PluginAcceleratorManager::default()),
            hosts: Arc::new(KubeconfigConnector),
            config,
            metrics,
            diagnostics,
        }
    }

    pub fn with_runners(mut self, runners: Arc<dyn RunnerFactory>) -> Self {
        self.runners = runners;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ClusterLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_workload(mut self, workload: Arc<dyn WorkloadClientFactory>) -> Self {
        self.workload = workload;
        self
    }

    pub fn with_accelerators(mut self, accelerators: Arc<dyn AcceleratorManager>) -> Self {
        self.accelerators = accelerators;
        self
    }

    pub fn with_hosts(mut self, hosts: Arc<dyn HostConnector>) -> Self {
        self.hosts = hosts;
        self
    }
}

/// The two entry points every provider implements.
#[async_trait]
pub trait ClusterReconciler: Send + Sync {
    /// Drive the cluster towards its declared state.
    async fn reconcile(&self, cluster: &Cluster, status: &mut ClusterStatusManager, ctx: &Context) -> Result<()>;

    /// Tear down everything the cluster owns. `Ok` once nothing is left.
    async fn reconcile_delete(
        &self,
        cluster: &Cluster,
        status: &mut ClusterStatusManager,
        ctx: &Context,
    ) -> Result<()>;
}

/// The reconciler for `spec.type`, configured from `spec.config`.
pub fn provider_reconciler(cluster: &Cluster) -> Result<Box<dyn ClusterReconciler>> {
    Ok(match parse_cluster_config(cluster)? {
        ProviderConfig::Ssh(config) => Box::new(SshReconciler::new(config)),
        ProviderConfig::Kubernetes(config) => Box::new(KubernetesReconciler::new(config)),
    })
}

/// The cluster's image registry, which must exist and be connected.
pub(crate) async fn resolve_registry(storage: &dyn Storage, cluster: &Cluster) -> Result<ImageRegistry> {
    let spec = cluster.spec()?;
    let workspace = cluster.workspace();
    let registry = get_image_registry(storage, &spec.image_registry, &workspace)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                Error::StdError(StdError::DependencyNotReady(format!(
                    "image registry {workspace}/{} not found",
                    spec.image_registry
                )))
            } else {
                e
            }
        })?;
    if !registry.is_connected() {
        return Err(StdError::DependencyNotReady(format!(
            "image registry {workspace}/{} is not connected",
            spec.image_registry
        ))
        .into());
    }
    Ok(registry)
}
