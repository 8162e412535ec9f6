//! Workloads installed into the installation namespace of a Kubernetes host.
//!
//! A sub-component is a pure render function plus a tag; the reconciler owns
//! the applier and persists each component's snapshot under its tag.

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

use crate::applier::DesiredObject;
use crate::config::{MetricsAgentConfig, ResourceHints, RouterConfig};
use crate::resources::parse_quantity;
use crate::util::errors::Result;

pub mod metrics_agent;
pub mod readiness;
pub mod router;

pub use metrics_agent::MetricsAgent;
pub use readiness::{check_health, deployment_ready, ComponentHealth};
pub use router::{route_endpoint, Router};

/// Everything a sub-component renders from.
#[derive(Clone, Debug, Default)]
pub struct RenderVars {
    pub cluster_name: String,
    pub workspace: String,
    pub namespace: String,
    pub image_prefix: String,
    pub image_pull_secret: String,
    pub version: String,
    /// Short hash of the cluster key, for cluster scoped object names
    pub hash_suffix: String,
    pub metrics_remote_write_url: String,
    pub metrics: MetricsAgentConfig,
    pub router: RouterConfig,
}

impl RenderVars {
    /// Labels stamped on every object of component `app`.
    pub fn labels(&self, app: &str) -> BTreeMap<String, String> {
        [
            ("app".to_string(), app.to_string()),
            ("cluster".to_string(), self.cluster_name.clone()),
            ("workspace".to_string(), self.workspace.clone()),
        ]
        .into()
    }

    pub fn image(&self, name: &str) -> String {
        format!("{}/{}:{}", self.image_prefix, name, self.version)
    }
}

pub trait SubComponent: Send + Sync {
    /// Key of the component's snapshot annotation
    fn tag(&self) -> &'static str;

    fn render(&self, vars: &RenderVars) -> Result<Vec<DesiredObject>>;

    /// Deployments that must be ready for the component to be ready
    fn deployments(&self) -> Vec<&'static str>;
}

/// The components installed on every Kubernetes host, in install order.
pub fn default_components() -> Vec<Box<dyn SubComponent>> {
    vec![Box::new(MetricsAgent), Box::new(Router)]
}

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ei", 1152921504606846976.0),
    ("Pi", 1125899906842624.0),
    ("Ti", 1099511627776.0),
    ("Gi", 1073741824.0),
    ("Mi", 1048576.0),
    ("Ki", 1024.0),
];

/// Cpu in the form the API server stores it, `1` or `500m`.
pub fn canonical_cpu(raw: &str) -> Result<String> {
    let cores = parse_quantity(raw)?;
    if cores.fract() == 0.0 {
        Ok(format!("{}", cores as i64))
    } else {
        Ok(format!("{}m", (cores * 1000.0).round() as i64))
    }
}

/// Memory in the form the API server stores it. Binary quantities are
/// rewritten with the largest exact suffix, `2048Mi` becoming `2Gi`.
pub fn canonical_memory(raw: &str) -> Result<String> {
    let bytes = parse_quantity(raw)?;
    if !raw.trim().ends_with('i') {
        return Ok(raw.trim().to_string());
    }
    for (suffix, unit) in BINARY_SUFFIXES {
        if bytes >= unit && (bytes / unit).fract() == 0.0 {
            return Ok(format!("{}{}", (bytes / unit) as i64, suffix));
        }
    }
    Ok(format!("{}", bytes as i64))
}

/// Requests and limits both set to the hints.
pub fn resource_requirements(hints: &ResourceHints) -> Result<ResourceRequirements> {
    let quantities: BTreeMap<String, Quantity> = [
        ("cpu".to_string(), Quantity(canonical_cpu(&hints.cpu)?)),
        ("memory".to_string(), Quantity(canonical_memory(&hints.memory)?)),
    ]
    .into();
    Ok(ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    })
}
