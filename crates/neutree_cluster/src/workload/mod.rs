//! Client of the workload engine's admin HTTP surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::util::errors::Result;

pub mod client;

pub use client::{DashboardClient, DashboardClientFactory};

pub const ALIVE: &str = "ALIVE";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub raylet: Raylet,
    #[serde(default)]
    pub core_workers_stats: Vec<CoreWorkerStats>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Raylet {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub is_head_node: bool,
    /// Total resources of the node; memory in bytes
    #[serde(default, alias = "resourcesTotal")]
    pub resources: BTreeMap<String, f64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoreWorkerStats {
    #[serde(default)]
    pub used_resources: BTreeMap<String, ResourceAllocations>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocations {
    #[serde(default)]
    pub resource_slots: Vec<ResourceSlot>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ResourceSlot {
    #[serde(default)]
    pub slot: i64,
    #[serde(default)]
    pub allocation: f64,
}

impl NodeSummary {
    pub fn is_alive(&self) -> bool {
        self.raylet.state.eq_ignore_ascii_case(ALIVE)
    }

    /// Sum of every core worker's slot allocations per resource.
    pub fn used_resources(&self) -> BTreeMap<String, f64> {
        let mut used = BTreeMap::new();
        for worker in &self.core_workers_stats {
            for (resource, allocations) in &worker.used_resources {
                let total: f64 = allocations.resource_slots.iter().map(|s| s.allocation).sum();
                *used.entry(resource.clone()).or_insert(0.0) += total;
            }
        }
        used
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscaleStatus {
    #[serde(default)]
    pub active_nodes: BTreeMap<String, i64>,
    #[serde(default)]
    pub pending_nodes: Vec<Value>,
    #[serde(default)]
    pub pending_launches: BTreeMap<String, i64>,
    #[serde(default)]
    pub failed_nodes: Vec<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    #[serde(default)]
    pub python_version: String,
    #[serde(default)]
    pub ray_version: String,
}

#[async_trait]
pub trait WorkloadClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeSummary>>;

    async fn get_cluster_autoscale_status(&self) -> Result<AutoscaleStatus>;

    async fn get_cluster_metadata(&self) -> Result<ClusterMetadata>;

    async fn update_serve_applications(&self, config: &Value) -> Result<()>;

    async fn get_serve_applications(&self) -> Result<Value>;
}

/// Builds a client for the dashboard at a given URL.
pub trait WorkloadClientFactory: Send + Sync {
    fn client(&self, dashboard_url: &str) -> Arc<dyn WorkloadClient>;
}
