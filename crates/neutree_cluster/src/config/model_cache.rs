use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::util::errors::{Result, StdError};

/// Root under which caches are mounted inside workload containers.
pub const MODEL_CACHE_MOUNT_ROOT: &str = "/home/ray/.neutree/models-cache";

/// A model cache declared on a cluster. Exactly one backing is set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelCache {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_registry_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NfsSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HostPathSource {
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NfsSource {
    pub server: String,
    pub path: String,
}

impl ModelCache {
    pub fn container_mount_path(&self) -> String {
        format!("{}/{}", MODEL_CACHE_MOUNT_ROOT, self.name)
    }

    pub fn backing(&self) -> &'static str {
        if self.host_path.is_some() {
            "hostPath"
        } else if self.nfs.is_some() {
            "nfs"
        } else if self.pvc.is_some() {
            "pvc"
        } else {
            "none"
        }
    }
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

pub fn validate_model_caches(caches: &[ModelCache]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for cache in caches {
        if !is_dns_label(&cache.name) {
            return Err(StdError::ConfigError(format!(
                "model cache name {:?} must be a lowercase DNS label",
                cache.name
            ))
            .into());
        }
        if !seen.insert(cache.name.as_str()) {
            return Err(StdError::ConfigError(format!("duplicate model cache {:?}", cache.name)).into());
        }
        let backings = [cache.host_path.is_some(), cache.nfs.is_some(), cache.pvc.is_some()]
            .into_iter()
            .filter(|set| *set)
            .count();
        if backings != 1 {
            return Err(StdError::ConfigError(format!(
                "model cache {:?} must set exactly one of hostPath, nfs, pvc",
                cache.name
            ))
            .into());
        }
        if let Some(host_path) = &cache.host_path {
            if !host_path.path.starts_with('/') {
                return Err(StdError::ConfigError(format!(
                    "model cache {:?} hostPath must be absolute",
                    cache.name
                ))
                .into());
            }
        }
        if let Some(nfs) = &cache.nfs {
            if nfs.server.is_empty() || nfs.path.is_empty() {
                return Err(StdError::ConfigError(format!(
                    "model cache {:?} nfs requires server and path",
                    cache.name
                ))
                .into());
            }
        }
    }
    Ok(())
}
