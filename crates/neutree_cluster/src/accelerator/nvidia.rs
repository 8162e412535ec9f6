use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{engine_product, probe, AcceleratorInfo, AcceleratorPlugin, RuntimeConfig};
use crate::connector::CommandRunner;
use crate::util::errors::Result;

pub const NVIDIA_GPU: &str = "nvidia_gpu";
pub const NVIDIA_RESOURCE: &str = "nvidia.com/gpu";
pub const NVIDIA_PRODUCT_LABEL: &str = "nvidia.com/gpu.product";

pub struct NvidiaGpuPlugin;

#[async_trait]
impl AcceleratorPlugin for NvidiaGpuPlugin {
    fn family(&self) -> &'static str {
        NVIDIA_GPU
    }

    async fn detect(&self, runner: &dyn CommandRunner) -> Result<bool> {
        let output = probe(runner, "nvidia-smi -L").await?;
        Ok(output.is_some_and(|o| o.lines().any(|line| line.starts_with("GPU "))))
    }

    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            image_suffix: String::new(),
            runtime: "nvidia".to_string(),
            env: [("NVIDIA_VISIBLE_DEVICES".to_string(), "all".to_string())].into(),
            options: vec!["--gpus all".to_string()],
        }
    }

    fn parse_engine_resources(&self, resources: &BTreeMap<String, f64>) -> Option<AcceleratorInfo> {
        let quantity = resources.get("GPU").copied().filter(|q| *q > 0.0)?;
        let product = engine_product(resources).unwrap_or_default();
        if product.starts_with("AMD") {
            return None;
        }
        Some(AcceleratorInfo {
            family: NVIDIA_GPU.to_string(),
            product,
            quantity,
        })
    }

    fn parse_kubernetes_resources(
        &self,
        resources: &BTreeMap<String, f64>,
        labels: &BTreeMap<String, String>,
    ) -> Option<AcceleratorInfo> {
        let quantity = resources.get(NVIDIA_RESOURCE).copied().filter(|q| *q > 0.0)?;
        Some(AcceleratorInfo {
            family: NVIDIA_GPU.to_string(),
            product: labels.get(NVIDIA_PRODUCT_LABEL).cloned().unwrap_or_default(),
            quantity,
        })
    }
}
