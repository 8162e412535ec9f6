//! Readiness of installed sub-components.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use std::fmt;

use super::SubComponent;
use crate::applier::{ObjectKey, ObjectStore};
use crate::util::errors::{Error, Result, StdError};

/// Whether the rollout of `deployment` has fully completed.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let (Some(spec), Some(status)) = (&deployment.spec, &deployment.status) else {
        return false;
    };
    let replicas = spec.replicas.unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or_default();
    if status.observed_generation.unwrap_or_default() < generation {
        return false;
    }
    if status.updated_replicas.unwrap_or_default() != replicas
        || status.ready_replicas.unwrap_or_default() != replicas
        || status.available_replicas.unwrap_or_default() != replicas
    {
        return false;
    }
    let condition_true = |type_: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == type_ && c.status == "True")
    };
    condition_true("Progressing") && condition_true("Available")
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Reasons the containers of `pod` are stuck waiting.
fn pod_errors(pod: &Pod) -> Vec<String> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|cs| {
            let waiting = cs.state.as_ref()?.waiting.as_ref()?;
            let reason = waiting.reason.clone().unwrap_or_default();
            if reason.is_empty() || reason == "ContainerCreating" {
                return None;
            }
            Some(match &waiting.message {
                Some(message) if !message.is_empty() => format!("{name}/{}: {reason}: {message}", cs.name),
                _ => format!("{name}/{}: {reason}", cs.name),
            })
        })
        .collect()
}

/// Human readable health of one sub-component.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentHealth {
    pub component: String,
    pub ready_deployments: usize,
    pub total_deployments: usize,
    pub ready_pods: usize,
    pub total_pods: usize,
    pub errors: Vec<String>,
}

impl ComponentHealth {
    pub fn is_ready(&self) -> bool {
        self.ready_deployments == self.total_deployments
    }
}

impl fmt::Display for ComponentHealth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} deployments ready, {}/{} pods ready",
            self.component, self.ready_deployments, self.total_deployments, self.ready_pods, self.total_pods
        )?;
        if !self.errors.is_empty() {
            write!(f, ", errors: {}", self.errors.join("; "))?;
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))
}

/// Inspect the deployments of `component` and the pods they own.
pub async fn check_health(
    store: &dyn ObjectStore,
    namespace: &str,
    component: &dyn SubComponent,
) -> Result<ComponentHealth> {
    let mut health = ComponentHealth {
        component: component.tag().to_string(),
        ..Default::default()
    };
    let pods: Vec<Pod> = store
        .list("v1", "Pod", namespace)
        .await?
        .into_iter()
        .map(decode)
        .collect::<Result<_>>()?;

    for name in component.deployments() {
        health.total_deployments += 1;
        let key = ObjectKey::new("apps/v1", "Deployment", namespace, name);
        let live = store.get(&key).await.map_err(|e| e.with_key(key.to_string()))?;
        let Some(live) = live else {
            health.errors.push(format!("deployment {name} not found"));
            continue;
        };
        let deployment: Deployment = decode(live)?;
        if deployment_ready(&deployment) {
            health.ready_deployments += 1;
        }

        for pod in pods.iter().filter(|p| {
            p.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("app"))
                .is_some_and(|app| app == name)
        }) {
            health.total_pods += 1;
            if pod_ready(pod) {
                health.ready_pods += 1;
            }
            health.errors.extend(pod_errors(pod));
        }
    }
    Ok(health)
}
