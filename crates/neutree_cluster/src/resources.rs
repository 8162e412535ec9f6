//! Resource arithmetic shared by both providers.
//!
//! Cpu is carried in cores, memory in GiB, both rounded to two decimals once a
//! node's figures are final. Accelerators are grouped by family and product.

use std::collections::BTreeMap;

use crate::accelerator::AcceleratorInfo;
use crate::api::v1::{AcceleratorGroup, ClusterResources, NodeResourceInfo, ResourceStatus};
use crate::util::errors::{Result, StdError};

pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Round to two decimals, clamping negatives to zero.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    (value * 100.0).round() / 100.0
}

pub fn bytes_to_gib(bytes: f64) -> f64 {
    round2(bytes / GIB)
}

/// Parse a Kubernetes quantity (`500m`, `4`, `16Gi`, `1e3`, `2.5G`) into a plain number.
pub fn parse_quantity(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let invalid = || StdError::ConfigError(format!("invalid quantity {raw:?}"));
    if raw.is_empty() {
        return Err(invalid().into());
    }

    const SUFFIXES: [(&str, f64); 10] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            return Ok(value * multiplier);
        }
    }
    for (suffix, divisor) in [("n", 1e9), ("u", 1e6), ("m", 1e3)] {
        if let Some(number) = raw.strip_suffix(suffix) {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            return Ok(value / divisor);
        }
    }
    for (suffix, multiplier) in [("P", 1e15), ("E", 1e18)] {
        if let Some(number) = raw.strip_suffix(suffix) {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            return Ok(value * multiplier);
        }
    }

    // plain or exponent notation
    raw.parse::<f64>().map_err(|_| invalid().into())
}

/// Add one accelerator reading into a family keyed group map.
pub fn add_accelerator(groups: &mut BTreeMap<String, AcceleratorGroup>, info: &AcceleratorInfo) {
    if info.quantity <= 0.0 {
        return;
    }
    let group = groups.entry(info.family.clone()).or_default();
    group.quantity += info.quantity;
    if !info.product.is_empty() {
        *group.product_groups.entry(info.product.clone()).or_default() += info.quantity;
    }
}

/// `allocatable - used` per resource key, clamped at zero. Keys only present
/// in `used` are dropped.
pub fn subtract_resources(
    allocatable: &BTreeMap<String, f64>,
    used: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    allocatable
        .iter()
        .map(|(key, quantity)| {
            let used = used.get(key).copied().unwrap_or_default();
            (key.clone(), (quantity - used).max(0.0))
        })
        .collect()
}

/// Figures of one resource map: cpu in cores under `cpu_key`, memory in bytes
/// under `memory_key`, plus the accelerator readings taken from the same map.
pub fn resource_status(
    resources: &BTreeMap<String, f64>,
    cpu_key: &str,
    memory_key: &str,
    accelerators: &[AcceleratorInfo],
) -> ResourceStatus {
    let mut status = ResourceStatus {
        cpu: round2(resources.get(cpu_key).copied().unwrap_or_default()),
        memory: bytes_to_gib(resources.get(memory_key).copied().unwrap_or_default()),
        ..Default::default()
    };
    for info in accelerators {
        add_accelerator(&mut status.accelerator_groups, info);
    }
    status
}

fn merge_groups(into: &mut BTreeMap<String, AcceleratorGroup>, from: &BTreeMap<String, AcceleratorGroup>) {
    for (family, group) in from {
        let target = into.entry(family.clone()).or_default();
        target.quantity += group.quantity;
        for (product, quantity) in &group.product_groups {
            *target.product_groups.entry(product.clone()).or_default() += quantity;
        }
    }
}

fn add_status(into: &mut ResourceStatus, from: &ResourceStatus) {
    into.cpu += from.cpu;
    into.memory += from.memory;
    merge_groups(&mut into.accelerator_groups, &from.accelerator_groups);
}

/// Cluster totals are the sum of the per-node figures.
pub fn aggregate(node_resources: BTreeMap<String, NodeResourceInfo>) -> ClusterResources {
    let mut allocatable = ResourceStatus::default();
    let mut available = ResourceStatus::default();
    for node in node_resources.values() {
        add_status(&mut allocatable, &node.allocatable);
        add_status(&mut available, &node.available);
    }
    allocatable.cpu = round2(allocatable.cpu);
    allocatable.memory = round2(allocatable.memory);
    available.cpu = round2(available.cpu);
    available.memory = round2(available.memory);
    ClusterResources {
        allocatable,
        available,
        node_resources,
    }
}
