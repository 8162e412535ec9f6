use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{engine_product, probe, AcceleratorInfo, AcceleratorPlugin, RuntimeConfig};
use crate::connector::CommandRunner;
use crate::util::errors::Result;

pub const AMD_GPU: &str = "amd_gpu";
pub const AMD_RESOURCE: &str = "amd.com/gpu";
pub const AMD_PRODUCT_LABEL: &str = "amd.com/gpu.product-name";

pub struct AmdGpuPlugin;

#[async_trait]
impl AcceleratorPlugin for AmdGpuPlugin {
    fn family(&self) -> &'static str {
        AMD_GPU
    }

    async fn detect(&self, runner: &dyn CommandRunner) -> Result<bool> {
        let output = probe(runner, "rocm-smi --showproductname --csv").await?;
        // header line plus one line per card
        Ok(output.is_some_and(|o| o.lines().filter(|l| l.starts_with("card")).count() > 0))
    }

    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            image_suffix: "-rocm".to_string(),
            runtime: String::new(),
            env: BTreeMap::new(),
            options: vec![
                "--device=/dev/kfd".to_string(),
                "--device=/dev/dri".to_string(),
                "--group-add=video".to_string(),
            ],
        }
    }

    fn parse_engine_resources(&self, resources: &BTreeMap<String, f64>) -> Option<AcceleratorInfo> {
        let quantity = resources.get("GPU").copied().filter(|q| *q > 0.0)?;
        let product = engine_product(resources).filter(|p| p.starts_with("AMD"))?;
        Some(AcceleratorInfo {
            family: AMD_GPU.to_string(),
            product,
            quantity,
        })
    }

    fn parse_kubernetes_resources(
        &self,
        resources: &BTreeMap<String, f64>,
        labels: &BTreeMap<String, String>,
    ) -> Option<AcceleratorInfo> {
        let quantity = resources.get(AMD_RESOURCE).copied().filter(|q| *q > 0.0)?;
        Some(AcceleratorInfo {
            family: AMD_GPU.to_string(),
            product: labels.get(AMD_PRODUCT_LABEL).cloned().unwrap_or_default(),
            quantity,
        })
    }
}
