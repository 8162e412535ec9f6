use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

use crate::api::v1::{Cluster, KUBERNETES_CLUSTER_TYPE, SSH_CLUSTER_TYPE};
use crate::util::errors::{Result, StdError};

pub mod kubernetes;
pub mod model_cache;
pub mod ssh;

pub use kubernetes::{KubernetesClusterConfig, MetricsAgentConfig, ResourceHints, RouterConfig};
pub use model_cache::{HostPathSource, ModelCache, NfsSource};
pub use ssh::{SshAuth, SshClusterConfig, SshProvider};

pub const PROVISIONING_WAIT_TIME_ENV: &str = "PROVISIONING_WAIT_TIME";
pub const DEFAULT_PROVISIONING_WAIT_WINDOW: Duration = Duration::from_secs(30);

/// Process wide settings injected into every reconciler.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Debounce after a node's last provision attempt
    pub provisioning_wait_window: Duration,
    /// Where the metrics agent remote-writes scraped samples
    pub metrics_remote_write_url: String,
    /// Metadata probes after a head bring-up before the pass fails
    pub head_health_retries: u32,
    pub head_health_retry_interval: Duration,
    /// Upper bound of any single remote command
    pub command_timeout: Duration,
    /// Upper bound of a bring-up or bring-down job
    pub launcher_timeout: Duration,
    /// Delay before a converged cluster is looked at again
    pub requeue_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            provisioning_wait_window: DEFAULT_PROVISIONING_WAIT_WINDOW,
            metrics_remote_write_url: String::new(),
            head_health_retries: 3,
            head_health_retry_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(300),
            launcher_timeout: Duration::from_secs(1800),
            requeue_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl ControllerConfig {
    /// Defaults with the debounce window taken from `PROVISIONING_WAIT_TIME`.
    pub fn from_env() -> Self {
        let raw = std::env::var(PROVISIONING_WAIT_TIME_ENV).ok();
        Self {
            provisioning_wait_window: parse_wait_window(raw.as_deref()),
            ..Default::default()
        }
    }
}

/// Parse a Go style duration such as `30s` or `1m30s`, falling back to the default.
pub fn parse_wait_window(raw: Option<&str>) -> Duration {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        None => DEFAULT_PROVISIONING_WAIT_WINDOW,
        Some(raw) => humantime::parse_duration(raw).unwrap_or_else(|e| {
            warn!(
                "invalid {} {:?}: {}, using {:?}",
                PROVISIONING_WAIT_TIME_ENV, raw, e, DEFAULT_PROVISIONING_WAIT_WINDOW
            );
            DEFAULT_PROVISIONING_WAIT_WINDOW
        }),
    }
}

/// Typed provider configuration of a cluster.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderConfig {
    Ssh(SshClusterConfig),
    Kubernetes(KubernetesClusterConfig),
}

fn decode<T: DeserializeOwned>(cluster: &Cluster) -> Result<T> {
    let raw = cluster.spec()?.config.clone().ok_or_else(|| {
        StdError::ConfigError(format!("cluster {} has no provider config", cluster.name_any()))
    })?;
    serde_json::from_value(raw).map_err(|e| {
        StdError::ConfigError(format!(
            "cluster {} has a malformed provider config: {e}",
            cluster.name_any()
        ))
        .into()
    })
}

/// Parse and validate `spec.config` according to `spec.type`.
pub fn parse_cluster_config(cluster: &Cluster) -> Result<ProviderConfig> {
    match cluster.spec()?.type_.as_str() {
        SSH_CLUSTER_TYPE => {
            let config: SshClusterConfig = decode(cluster)?;
            config.validate()?;
            Ok(ProviderConfig::Ssh(config))
        }
        KUBERNETES_CLUSTER_TYPE => {
            let config: KubernetesClusterConfig = decode(cluster)?;
            config.validate()?;
            Ok(ProviderConfig::Kubernetes(config))
        }
        other => Err(StdError::Fatal(format!("unknown cluster type {other:?}")).into()),
    }
}
