use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::api::v1::Metadata;
use crate::util::errors::{Result, StdError};
use crate::util::hash;

pub const CLUSTER_KIND: &str = "Cluster";
pub const SSH_CLUSTER_TYPE: &str = "ssh";
pub const KUBERNETES_CLUSTER_TYPE: &str = "kubernetes";

/// A declared inference-serving cluster as persisted by the storage gateway.
///
/// Every top-level field is optional so the same type doubles as the partial
/// document sent on update: absent fields are left untouched by storage.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ClusterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

fn is_zero(id: &i64) -> bool {
    *id == 0
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Provisioning target, `ssh` or `kubernetes`
    #[serde(rename = "type")]
    pub type_: String,
    /// Workload engine version deployed on the cluster
    #[serde(default)]
    pub version: String,
    /// Name of the image registry in the cluster's workspace
    #[serde(default)]
    pub image_registry: String,
    /// Provider specific configuration, parsed by `crate::config`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClusterPhase {
    Initializing,
    Running,
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClusterPhase::Initializing => write!(f, "Initializing"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// The status object of `Cluster`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,
    #[serde(rename = "dashboardURL", default, skip_serializing_if = "String::is_empty")]
    pub dashboard_url: String,
    #[serde(default)]
    pub desired_nodes: i32,
    #[serde(default)]
    pub ready_nodes: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_info: Option<ClusterResources>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accelerator_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_provision_status: BTreeMap<String, NodeProvisionRecord>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionStatus {
    Provisioning,
    Provisioned,
}

/// Per-node bring-up state of an SSH cluster, keyed by node IP in the status.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeProvisionRecord {
    pub status: ProvisionStatus,
    #[serde(with = "rfc3339_nanos")]
    #[schemars(with = "String")]
    pub last_provision_time: DateTime<Utc>,
    #[serde(default)]
    pub is_head: bool,
}

impl NodeProvisionRecord {
    pub fn provisioned(at: DateTime<Utc>, is_head: bool) -> Self {
        Self {
            status: ProvisionStatus::Provisioned,
            last_provision_time: at,
            is_head,
        }
    }

    pub fn provisioning(at: DateTime<Utc>, is_head: bool) -> Self {
        Self {
            status: ProvisionStatus::Provisioning,
            last_provision_time: at,
            is_head,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        self.status == ProvisionStatus::Provisioned
    }

    /// Whether the last attempt happened less than `window` before `now`.
    pub fn within(&self, window: std::time::Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => now - self.last_provision_time < window,
            Err(_) => true,
        }
    }
}

mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Cpu in cores, memory in GiB, accelerators grouped by family.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accelerator_groups: BTreeMap<String, AcceleratorGroup>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorGroup {
    #[serde(default)]
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub product_groups: BTreeMap<String, f64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceInfo {
    pub allocatable: ResourceStatus,
    pub available: ResourceStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResources {
    pub allocatable: ResourceStatus,
    pub available: ResourceStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_resources: BTreeMap<String, NodeResourceInfo>,
}

impl Cluster {
    pub fn metadata(&self) -> Result<&Metadata> {
        self.metadata.as_ref().ok_or_else(|| {
            StdError::ConfigError(format!("cluster {} has no metadata", self.id)).into()
        })
    }

    pub fn spec(&self) -> Result<&ClusterSpec> {
        self.spec.as_ref().ok_or_else(|| {
            StdError::ConfigError(format!("cluster {} has no spec", self.name_any())).into()
        })
    }

    pub fn name_any(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default()
    }

    pub fn workspace(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.workspace.clone())
            .unwrap_or_default()
    }

    /// `workspace/name`, unique across the fleet.
    pub fn key(&self) -> String {
        format!("{}/{}", self.workspace(), self.name_any())
    }

    /// Deterministic namespace that holds everything installed for this cluster.
    pub fn installation_namespace(&self) -> String {
        hash::installation_namespace(&self.name_any(), &self.workspace())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|m| m.deletion_timestamp.is_some())
    }

    pub fn status_or_default(&self) -> ClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.annotations.get(key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_provision_record_uses_nanosecond_timestamps() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = NodeProvisionRecord::provisioned(at, true);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "provisioned",
                "lastProvisionTime": "2024-05-01T12:00:00.000000000Z",
                "isHead": true
            })
        );
        let back: NodeProvisionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_provision_record_window() {
        let now = Utc::now();
        let record = NodeProvisionRecord::provisioned(now - chrono::Duration::seconds(10), false);
        assert!(record.within(std::time::Duration::from_secs(30), now));
        assert!(!record.within(std::time::Duration::from_secs(5), now));
    }

    #[test]
    fn test_status_field_names() {
        let mut status = ClusterStatus {
            phase: Some(ClusterPhase::Running),
            dashboard_url: "http://10.0.0.9:8265".to_string(),
            ready_nodes: 3,
            ..Default::default()
        };
        status.node_provision_status.insert(
            "10.0.0.9".to_string(),
            NodeProvisionRecord::provisioned(Utc::now(), true),
        );
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["dashboardURL"], "http://10.0.0.9:8265");
        assert_eq!(value["readyNodes"], 3);
        assert_eq!(value["phase"], "Running");
        assert!(value["nodeProvisionStatus"]["10.0.0.9"]["isHead"].as_bool().unwrap());
    }

    #[test]
    fn test_partial_cluster_omits_absent_fields() {
        let update = Cluster {
            id: 7,
            status: Some(ClusterStatus::default()),
            ..Default::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        assert!(value.get("spec").is_none());
        assert!(value.get("metadata").is_none());
        assert!(value.get("status").is_some());
    }
}
