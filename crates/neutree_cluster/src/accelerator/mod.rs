//! Accelerator classification and container runtime mutations.
//!
//! Each supported family is a plugin. The manager fans every question out to
//! its plugins: which family a host carries, how a container must be started
//! on it, and how engine or Kubernetes resource maps translate into
//! `(family, product, quantity)` readings.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::connector::CommandRunner;
use crate::util::errors::{Result, StdError};

pub mod amd;
pub mod nvidia;

pub use amd::AmdGpuPlugin;
pub use nvidia::NvidiaGpuPlugin;

/// One accelerator reading of a node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcceleratorInfo {
    pub family: String,
    pub product: String,
    pub quantity: f64,
}

/// Changes needed to run the engine container on a given accelerator family.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Appended to the engine image tag
    pub image_suffix: String,
    /// Docker `--runtime`, empty for the default runtime
    pub runtime: String,
    pub env: BTreeMap<String, String>,
    /// Extra `docker run` options
    pub options: Vec<String>,
}

impl RuntimeConfig {
    /// `docker run` options for the runtime. The environment is passed separately.
    pub fn docker_run_options(&self) -> Vec<String> {
        let mut options = Vec::new();
        if !self.runtime.is_empty() {
            options.push(format!("--runtime={}", self.runtime));
        }
        options.extend(self.options.iter().cloned());
        options
    }
}

/// Support for one accelerator family.
#[async_trait]
pub trait AcceleratorPlugin: Send + Sync {
    /// Family name as used in `acceleratorType`
    fn family(&self) -> &'static str;

    /// Whether the host behind `runner` carries this family.
    async fn detect(&self, runner: &dyn CommandRunner) -> Result<bool>;

    fn runtime_config(&self) -> RuntimeConfig;

    /// Reading from an engine node resource map, `None` when the family is absent.
    fn parse_engine_resources(&self, resources: &BTreeMap<String, f64>) -> Option<AcceleratorInfo>;

    /// Reading from a Kubernetes resource map plus the node's labels.
    fn parse_kubernetes_resources(
        &self,
        resources: &BTreeMap<String, f64>,
        labels: &BTreeMap<String, String>,
    ) -> Option<AcceleratorInfo>;
}

#[async_trait]
pub trait AcceleratorManager: Send + Sync {
    /// Family of the host behind `runner`, empty when it carries none.
    async fn detect(&self, runner: &dyn CommandRunner) -> Result<String>;

    /// Runtime mutations for `family`. Empty family means plain cpu.
    fn runtime_config(&self, family: &str) -> Result<RuntimeConfig>;

    fn parse_engine_resources(&self, resources: &BTreeMap<String, f64>) -> Vec<AcceleratorInfo>;

    fn parse_kubernetes_resources(
        &self,
        resources: &BTreeMap<String, f64>,
        labels: &BTreeMap<String, String>,
    ) -> Vec<AcceleratorInfo>;
}

/// Manager dispatching to a fixed list of plugins.
#[derive(Clone)]
pub struct PluginAcceleratorManager {
    plugins: Vec<Arc<dyn AcceleratorPlugin>>,
}

impl Default for PluginAcceleratorManager {
    fn default() -> Self {
        Self::new(vec![Arc::new(NvidiaGpuPlugin), Arc::new(AmdGpuPlugin)])
    }
}

impl PluginAcceleratorManager {
    pub fn new(plugins: Vec<Arc<dyn AcceleratorPlugin>>) -> Self {
        Self { plugins }
    }

    fn plugin(&self, family: &str) -> Option<&Arc<dyn AcceleratorPlugin>> {
        self.plugins.iter().find(|p| p.family() == family)
    }
}

#[async_trait]
impl AcceleratorManager for PluginAcceleratorManager {
    async fn detect(&self, runner: &dyn CommandRunner) -> Result<String> {
        for plugin in &self.plugins {
            if plugin.detect(runner).await? {
                debug!("detected {} on {}", plugin.family(), runner.host());
                return Ok(plugin.family().to_string());
            }
        }
        Ok(String::new())
    }

    fn runtime_config(&self, family: &str) -> Result<RuntimeConfig> {
        if family.is_empty() {
            return Ok(RuntimeConfig::default());
        }
        self.plugin(family)
            .map(|p| p.runtime_config())
            .ok_or_else(|| StdError::ConfigError(format!("unsupported accelerator type {family:?}")).into())
    }

    fn parse_engine_resources(&self, resources: &BTreeMap<String, f64>) -> Vec<AcceleratorInfo> {
        self.plugins
            .iter()
            .filter_map(|p| p.parse_engine_resources(resources))
            .collect()
    }

    fn parse_kubernetes_resources(
        &self,
        resources: &BTreeMap<String, f64>,
        labels: &BTreeMap<String, String>,
    ) -> Vec<AcceleratorInfo> {
        self.plugins
            .iter()
            .filter_map(|p| p.parse_kubernetes_resources(resources, labels))
            .collect()
    }
}

/// Run a probe command, treating a failing command as "not present".
///
/// Transport failures still propagate so an unreachable host is not mistaken
/// for a host without accelerators.
pub(crate) async fn probe(runner: &dyn CommandRunner, command: &str) -> Result<Option<String>> {
    match runner.execute(command, None, false).await {
        Ok(output) => Ok(Some(output)),
        Err(e) if matches!(e.inner().root(), StdError::CommandFailed(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Engine resource key that carries the product of the node's accelerators.
pub(crate) fn engine_product(resources: &BTreeMap<String, f64>) -> Option<String> {
    resources
        .iter()
        .filter(|(_, quantity)| **quantity > 0.0)
        .find_map(|(key, _)| key.strip_prefix("accelerator_type:").map(str::to_string))
}
