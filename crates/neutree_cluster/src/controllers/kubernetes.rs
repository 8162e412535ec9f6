//! Installs and keeps converged the per-cluster workloads on a Kubernetes host.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::*;

use super::{resolve_registry, ClusterReconciler, Context};
use crate::api::v1::{Cluster, ImageRegistry, NodeResourceInfo};
use crate::applier::{
    decode_snapshot, is_cluster_scoped, last_applied_annotation, Applier, DesiredObject, ObjectKey, ObjectStore,
};
use crate::components::{check_health, default_components, route_endpoint, RenderVars, SubComponent};
use crate::config::KubernetesClusterConfig;
use crate::resources::{aggregate, parse_quantity, resource_status, subtract_resources};
use crate::util::cluster_status::ClusterStatusManager;
use crate::util::errors::{Error, Result, StdError};
use crate::util::hash::short_hash;
use crate::util::registry::{docker_config_json, image_prefix};

pub const IMAGE_PULL_SECRET_NAME: &str = "image-pull-secret";

pub struct KubernetesReconciler {
    config: KubernetesClusterConfig,
    components: Vec<Box<dyn SubComponent>>,
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))
}

fn quantities(map: Option<&BTreeMap<String, Quantity>>) -> Result<BTreeMap<String, f64>> {
    map.into_iter()
        .flatten()
        .map(|(name, quantity)| Ok((name.clone(), parse_quantity(&quantity.0)?)))
        .collect()
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

fn schedulable(node: &Node) -> bool {
    !node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false)
}

/// Requests of a pod that still holds its node's capacity.
fn pod_requests(pod: &Pod) -> Result<Option<(String, BTreeMap<String, f64>)>> {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or_default();
    if phase != "Running" && phase != "Pending" {
        return Ok(None);
    }
    let Some(spec) = &pod.spec else { return Ok(None) };
    let Some(node) = spec.node_name.clone() else { return Ok(None) };
    let mut requests = BTreeMap::new();
    for container in &spec.containers {
        let container_requests = quantities(container.resources.as_ref().and_then(|r| r.requests.as_ref()))?;
        for (name, quantity) in container_requests {
            *requests.entry(name).or_insert(0.0) += quantity;
        }
    }
    Ok(Some((node, requests)))
}

impl KubernetesReconciler {
    pub fn new(config: KubernetesClusterConfig) -> Self {
        Self {
            config,
            components: default_components(),
        }
    }

    /// Namespace and image pull secret, written before any sub-component and
    /// patched only when the live objects drifted.
    async fn install(
        &self,
        store: Arc<dyn ObjectStore>,
        namespace: &str,
        cluster: &Cluster,
        registry: &ImageRegistry,
        ctx: &Context,
    ) -> Result<()> {
        let labels: BTreeMap<String, String> = [
            ("cluster".to_string(), cluster.name_any()),
            ("workspace".to_string(), cluster.workspace()),
        ]
        .into();
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(IMAGE_PULL_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            data: Some(
                [(
                    ".dockerconfigjson".to_string(),
                    ByteString(docker_config_json(registry)?.into_bytes()),
                )]
                .into(),
            ),
            ..Default::default()
        };

        let applier = Applier::new(store, namespace, Vec::new(), Vec::new()).with_metrics(ctx.metrics.clone());
        for object in [DesiredObject::from_typed(&ns)?, DesiredObject::from_typed(&secret)?] {
            let key = object.identity_key();
            applier.ensure(&object).await.map_err(|e| e.with_key(key))?;
        }
        Ok(())
    }

    /// Node counts and per-node resources of the host.
    async fn sync_resources(
        &self,
        store: &dyn ObjectStore,
        status: &mut ClusterStatusManager,
        ctx: &Context,
    ) -> Result<()> {
        let nodes: Vec<Node> = store
            .list("v1", "Node", "")
            .await?
            .into_iter()
            .map(decode)
            .collect::<Result<_>>()?;
        let pods: Vec<Pod> = store
            .list("v1", "Pod", "")
            .await?
            .into_iter()
            .map(decode)
            .collect::<Result<_>>()?;

        let mut used: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for pod in &pods {
            if let Some((node, requests)) = pod_requests(pod)? {
                let node_used = used.entry(node).or_default();
                for (name, quantity) in requests {
                    *node_used.entry(name).or_insert(0.0) += quantity;
                }
            }
        }

        let mut desired_nodes = 0;
        let mut ready_nodes = 0;
        let mut node_resources = BTreeMap::new();
        for node in nodes.iter().filter(|n| schedulable(n)) {
            desired_nodes += 1;
            if node_ready(node) {
                ready_nodes += 1;
            }
            let name = node.metadata.name.clone().unwrap_or_default();
            let labels = node.metadata.labels.clone().unwrap_or_default();
            let allocatable = quantities(node.status.as_ref().and_then(|s| s.allocatable.as_ref()))?;
            let available = subtract_resources(&allocatable, used.get(&name).unwrap_or(&BTreeMap::new()));
            let info = NodeResourceInfo {
                allocatable: resource_status(
                    &allocatable,
                    "cpu",
                    "memory",
                    &ctx.accelerators.parse_kubernetes_resources(&allocatable, &labels),
                ),
                available: resource_status(
                    &available,
                    "cpu",
                    "memory",
                    &ctx.accelerators.parse_kubernetes_resources(&available, &labels),
                ),
            };
            node_resources.insert(name, info);
        }

        let resources = aggregate(node_resources);
        let current = status.status_mut();
        current.desired_nodes = desired_nodes;
        current.ready_nodes = ready_nodes;
        let families: Vec<&String> = resources.allocatable.accelerator_groups.keys().collect();
        if let [family] = families.as_slice() {
            current.accelerator_type = family.to_string();
        }
        current.resource_info = Some(resources);
        status.persist().await
    }

    fn render_vars(
        &self,
        cluster: &Cluster,
        namespace: &str,
        registry: &ImageRegistry,
        ctx: &Context,
    ) -> Result<RenderVars> {
        Ok(RenderVars {
            cluster_name: cluster.name_any(),
            workspace: cluster.workspace(),
            namespace: namespace.to_string(),
            image_prefix: image_prefix(registry.spec()?)?,
            image_pull_secret: IMAGE_PULL_SECRET_NAME.to_string(),
            version: cluster.spec()?.version.clone(),
            hash_suffix: short_hash(&cluster.key()),
            metrics_remote_write_url: ctx.config.metrics_remote_write_url.clone(),
            metrics: self.config.metrics.clone(),
            router: self.config.router.clone(),
        })
    }

    fn last_applied(status: &ClusterStatusManager, tag: &str) -> Result<Vec<DesiredObject>> {
        match status.annotation(&last_applied_annotation(tag)) {
            Some(raw) => decode_snapshot(raw),
            None => Ok(Vec::new()),
        }
    }

    /// Converge one sub-component, persisting its snapshot when anything changed.
    async fn apply_component(
        &self,
        component: &dyn SubComponent,
        store: Arc<dyn ObjectStore>,
        vars: &RenderVars,
        status: &mut ClusterStatusManager,
        ctx: &Context,
    ) -> Result<usize> {
        let applier = Applier::new(
            store,
            &vars.namespace,
            component.render(vars)?,
            Self::last_applied(status, component.tag())?,
        )
        .with_metrics(ctx.metrics.clone());
        let applied = applier.apply().await?;
        if applied.changed > 0 {
            info!("{} objects of {} changed", applied.changed, component.tag());
            status
                .set_annotation(&last_applied_annotation(component.tag()), applier.snapshot(&applied)?)
                .await?;
        }
        Ok(applied.changed)
    }
}

#[async_trait]
impl ClusterReconciler for KubernetesReconciler {
    async fn reconcile(&self, cluster: &Cluster, status: &mut ClusterStatusManager, ctx: &Context) -> Result<()> {
        let registry = resolve_registry(ctx.storage.as_ref(), cluster).await?;
        let store = ctx.hosts.connect(&self.config).await?;
        let namespace = cluster.installation_namespace();

        self.install(store.clone(), &namespace, cluster, &registry, ctx).await?;
        self.sync_resources(store.as_ref(), status, ctx).await?;

        let vars = self.render_vars(cluster, &namespace, &registry, ctx)?;
        for component in &self.components {
            self.apply_component(component.as_ref(), store.clone(), &vars, status, ctx)
                .await?;
        }

        let mut pending = Vec::new();
        for component in &self.components {
            let health = check_health(store.as_ref(), &namespace, component.as_ref()).await?;
            if !health.is_ready() {
                pending.push(health.to_string());
            }
        }
        if !pending.is_empty() {
            return Err(Error::not_ready(pending.join("; ")));
        }

        let endpoint = route_endpoint(store.as_ref(), &namespace).await?;
        let current = status.status_mut();
        if let Some(endpoint) = endpoint {
            current.dashboard_url = endpoint;
        }
        current.version = cluster.spec()?.version.clone();
        status.persist().await?;
        // no engine dashboard runs on the host; readiness of every component
        // stands in for the metadata check
        status.mark_initialized().await
    }

    async fn reconcile_delete(
        &self,
        cluster: &Cluster,
        status: &mut ClusterStatusManager,
        ctx: &Context,
    ) -> Result<()> {
        let store = ctx.hosts.connect(&self.config).await?;
        let namespace = cluster.installation_namespace();

        // cluster scoped objects are not collected with the namespace
        let mut remaining = false;
        for component in &self.components {
            let cluster_scoped: Vec<DesiredObject> = Self::last_applied(status, component.tag())?
                .into_iter()
                .filter(|o| is_cluster_scoped(o.kind()))
                .collect();
            if cluster_scoped.is_empty() {
                continue;
            }
            let applier = Applier::new(store.clone(), &namespace, Vec::new(), cluster_scoped)
                .with_metrics(ctx.metrics.clone());
            if !applier.delete().await? {
                remaining = true;
            }
        }

        let key = ObjectKey::new("v1", "Namespace", "", &namespace);
        match store.get(&key).await.map_err(|e| e.with_key(key.to_string()))? {
            None if !remaining => {
                info!("namespace {} is gone", namespace);
                return Ok(());
            }
            None => {}
            Some(live) => {
                if !live.pointer("/metadata/deletionTimestamp").is_some_and(|t| !t.is_null()) {
                    store.delete(&key).await.map_err(|e| e.with_key(key.to_string()))?;
                    info!("deleting namespace {}", namespace);
                }
            }
        }
        Err(Error::not_ready(format!("namespace {namespace} is terminating")))
    }
}
