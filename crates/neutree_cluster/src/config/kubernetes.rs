use base64::{engine::general_purpose::STANDARD, Engine as _};
use kube::config::Kubeconfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::model_cache::{validate_model_caches, ModelCache};
use crate::util::errors::{Result, StdError};

/// Provider configuration of a cluster installed onto a user supplied Kubernetes host.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClusterConfig {
    /// base64 encoded kubeconfig of the host cluster
    pub kubeconfig: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_caches: Vec<ModelCache>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub metrics: MetricsAgentConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default = "default_router_replicas")]
    pub replicas: i32,
    #[serde(default = "default_router_service_type")]
    pub service_type: String,
    #[serde(default = "default_router_resources")]
    pub resources: ResourceHints,
}

fn default_router_replicas() -> i32 {
    1
}
fn default_router_service_type() -> String {
    "LoadBalancer".to_string()
}
fn default_router_resources() -> ResourceHints {
    ResourceHints {
        cpu: "1".to_string(),
        memory: "2Gi".to_string(),
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            replicas: default_router_replicas(),
            service_type: default_router_service_type(),
            resources: default_router_resources(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAgentConfig {
    #[serde(default = "default_metrics_resources")]
    pub resources: ResourceHints,
    /// Grant node level metrics access through a ClusterRole
    #[serde(default)]
    pub node_metrics: bool,
}

fn default_metrics_resources() -> ResourceHints {
    ResourceHints {
        cpu: "200m".to_string(),
        memory: "256Mi".to_string(),
    }
}

impl Default for MetricsAgentConfig {
    fn default() -> Self {
        Self {
            resources: default_metrics_resources(),
            node_metrics: false,
        }
    }
}

/// Requests and limits are set to the same values.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceHints {
    pub cpu: String,
    pub memory: String,
}

impl KubernetesClusterConfig {
    pub fn validate(&self) -> Result<()> {
        self.decoded_kubeconfig()?;
        if self.router.replicas < 1 {
            return Err(StdError::ConfigError("router.replicas must be at least 1".into()).into());
        }
        if !matches!(
            self.router.service_type.as_str(),
            "LoadBalancer" | "NodePort" | "ClusterIP"
        ) {
            return Err(StdError::ConfigError(format!(
                "router.serviceType {:?} is not supported",
                self.router.service_type
            ))
            .into());
        }
        for hints in [&self.router.resources, &self.metrics.resources] {
            crate::resources::parse_quantity(&hints.cpu)?;
            crate::resources::parse_quantity(&hints.memory)?;
        }
        validate_model_caches(&self.model_caches)
    }

    /// Decode and parse the embedded kubeconfig.
    pub fn decoded_kubeconfig(&self) -> Result<Kubeconfig> {
        if self.kubeconfig.is_empty() {
            return Err(StdError::ConfigError("kubeconfig is required".into()).into());
        }
        let raw = STANDARD
            .decode(self.kubeconfig.trim())
            .map_err(|e| StdError::ConfigError(format!("kubeconfig is not base64: {e}")))?;
        let raw = String::from_utf8(raw)
            .map_err(|_| StdError::ConfigError("kubeconfig is not valid utf-8".into()))?;
        Kubeconfig::from_yaml(&raw)
            .map_err(|e| StdError::ConfigError(format!("kubeconfig is malformed: {e}")).into())
    }
}
