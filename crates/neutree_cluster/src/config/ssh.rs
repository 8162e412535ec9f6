use base64::{engine::general_purpose::STANDARD, Engine as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

use super::model_cache::{validate_model_caches, ModelCache};
use crate::util::errors::{Result, StdError};

/// Provider configuration of a cluster running on static SSH hosts.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshClusterConfig {
    pub provider: SshProvider,
    pub auth: SshAuth,
    /// Accelerator family of every node, detected when unset
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accelerator_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_caches: Vec<ModelCache>,
    /// Extra `docker run` options for the workload container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker_run_options: Vec<String>,
    /// Commands run on every host before the workload container starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initialization_commands: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SshProvider {
    #[serde(rename = "headIP")]
    pub head_ip: String,
    #[serde(rename = "workerIPs", default)]
    pub worker_ips: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshAuth {
    pub ssh_user: String,
    /// base64 encoded private key
    pub ssh_private_key: String,
}

impl SshClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.provider.head_ip.is_empty() {
            return Err(StdError::ConfigError("provider.headIP is required".into()).into());
        }
        parse_ip(&self.provider.head_ip)?;

        let mut workers = BTreeSet::new();
        for ip in &self.provider.worker_ips {
            parse_ip(ip)?;
            if ip == &self.provider.head_ip {
                return Err(StdError::ConfigError(format!("worker {ip} is also the head node")).into());
            }
            if !workers.insert(ip.as_str()) {
                return Err(StdError::ConfigError(format!("duplicate worker ip {ip}")).into());
            }
        }

        if self.auth.ssh_user.is_empty() {
            return Err(StdError::ConfigError("auth.sshUser is required".into()).into());
        }
        self.private_key()?;

        validate_model_caches(&self.model_caches)
    }

    /// The decoded private key.
    pub fn private_key(&self) -> Result<Vec<u8>> {
        if self.auth.ssh_private_key.is_empty() {
            return Err(StdError::ConfigError("auth.sshPrivateKey is required".into()).into());
        }
        STANDARD
            .decode(self.auth.ssh_private_key.trim())
            .map_err(|e| StdError::ConfigError(format!("auth.sshPrivateKey is not base64: {e}")).into())
    }

    /// Head first, then workers in declaration order.
    pub fn all_ips(&self) -> Vec<String> {
        std::iter::once(self.provider.head_ip.clone())
            .chain(self.provider.worker_ips.iter().cloned())
            .collect()
    }
}

fn parse_ip(raw: &str) -> Result<IpAddr> {
    raw.parse::<IpAddr>()
        .map_err(|_| StdError::ConfigError(format!("{raw:?} is not an IP address")).into())
}
