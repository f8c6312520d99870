//! The instance-type catalog
//!
//! A static table of EC2 instance types the cluster is willing to run, with
//! their resource vectors and published per-region on-demand prices (USD per
//! hour). Prices are upper bounds used for bidding and the cost cap; actual
//! spot cost is typically far lower.
//!
//! The `disk` dimension is zero here: it is filled in from the cluster's
//! EBS configuration when the runtime [`crate::state::InstanceState`] is
//! built.

use oxbow_core::Resources;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// One catalog row. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_type: String,
    pub resources: Resources,
    pub price_by_region: HashMap<String, f64>,
    pub ebs_optimized: bool,
    /// Whether this type has been verified to run the skiff agent.
    pub verified: bool,
}

impl InstanceConfig {
    /// The hourly price in `region`, or 0 if unpublished there.
    pub fn price(&self, region: &str) -> f64 {
        self.price_by_region.get(region).copied().unwrap_or(0.0)
    }
}

const GIB: f64 = (1u64 << 30) as f64;

fn entry(
    instance_type: &str,
    cpu: f64,
    mem_gib: f64,
    gpu: f64,
    ebs_optimized: bool,
    prices: [(&str, f64); 3],
) -> InstanceConfig {
    let mut resources = Resources::cpu_mem(cpu, mem_gib * GIB).with("disk", 0.0);
    if gpu > 0.0 {
        resources.set("gpu", gpu);
    }
    InstanceConfig {
        instance_type: instance_type.to_string(),
        resources,
        price_by_region: prices.iter().map(|(r, p)| (r.to_string(), *p)).collect(),
        ebs_optimized,
        verified: true,
    }
}

/// All verified instance types, keyed by name.
pub fn instance_types() -> &'static HashMap<String, InstanceConfig> {
    static TYPES: OnceLock<HashMap<String, InstanceConfig>> = OnceLock::new();
    TYPES.get_or_init(|| {
        let rows = vec![
            // General purpose, burstable.
            entry("t3a.medium", 2.0, 4.0, 0.0, false,
                [("us-east-1", 0.0376), ("us-west-2", 0.0376), ("eu-west-1", 0.0408)]),
            entry("t3.medium", 2.0, 4.0, 0.0, false,
                [("us-east-1", 0.0416), ("us-west-2", 0.0416), ("eu-west-1", 0.0456)]),
            // Compute optimized.
            entry("c5.xlarge", 4.0, 8.0, 0.0, true,
                [("us-east-1", 0.17), ("us-west-2", 0.17), ("eu-west-1", 0.192)]),
            entry("c5.2xlarge", 8.0, 16.0, 0.0, true,
                [("us-east-1", 0.34), ("us-west-2", 0.34), ("eu-west-1", 0.384)]),
            entry("c5.4xlarge", 16.0, 32.0, 0.0, true,
                [("us-east-1", 0.68), ("us-west-2", 0.68), ("eu-west-1", 0.768)]),
            entry("c5.9xlarge", 36.0, 72.0, 0.0, true,
                [("us-east-1", 1.53), ("us-west-2", 1.53), ("eu-west-1", 1.728)]),
            entry("c5.18xlarge", 72.0, 144.0, 0.0, true,
                [("us-east-1", 3.06), ("us-west-2", 3.06), ("eu-west-1", 3.456)]),
            // General purpose.
            entry("m5.xlarge", 4.0, 16.0, 0.0, true,
                [("us-east-1", 0.192), ("us-west-2", 0.192), ("eu-west-1", 0.214)]),
            entry("m5.2xlarge", 8.0, 32.0, 0.0, true,
                [("us-east-1", 0.384), ("us-west-2", 0.384), ("eu-west-1", 0.428)]),
            entry("m5.4xlarge", 16.0, 64.0, 0.0, true,
                [("us-east-1", 0.768), ("us-west-2", 0.768), ("eu-west-1", 0.856)]),
            entry("m5.12xlarge", 48.0, 192.0, 0.0, true,
                [("us-east-1", 2.304), ("us-west-2", 2.304), ("eu-west-1", 2.568)]),
            // Memory optimized.
            entry("r5.xlarge", 4.0, 32.0, 0.0, true,
                [("us-east-1", 0.252), ("us-west-2", 0.252), ("eu-west-1", 0.282)]),
            entry("r5.2xlarge", 8.0, 64.0, 0.0, true,
                [("us-east-1", 0.504), ("us-west-2", 0.504), ("eu-west-1", 0.564)]),
            entry("r5.4xlarge", 16.0, 128.0, 0.0, true,
                [("us-east-1", 1.008), ("us-west-2", 1.008), ("eu-west-1", 1.128)]),
            entry("r5a.8xlarge", 32.0, 256.0, 0.0, true,
                [("us-east-1", 1.808), ("us-west-2", 1.808), ("eu-west-1", 2.032)]),
            entry("r5.12xlarge", 48.0, 384.0, 0.0, true,
                [("us-east-1", 3.024), ("us-west-2", 3.024), ("eu-west-1", 3.384)]),
            // High memory.
            entry("x1.32xlarge", 128.0, 1952.0, 0.0, true,
                [("us-east-1", 13.338), ("us-west-2", 13.338), ("eu-west-1", 16.006)]),
            entry("x1e.32xlarge", 128.0, 3904.0, 0.0, true,
                [("us-east-1", 26.688), ("us-west-2", 26.688), ("eu-west-1", 32.0)]),
            // GPU.
            entry("g4dn.xlarge", 4.0, 16.0, 1.0, true,
                [("us-east-1", 0.526), ("us-west-2", 0.526), ("eu-west-1", 0.587)]),
            entry("p3.2xlarge", 8.0, 61.0, 1.0, true,
                [("us-east-1", 3.06), ("us-west-2", 3.06), ("eu-west-1", 3.305)]),
        ];
        rows.into_iter().map(|c| (c.instance_type.clone(), c)).collect()
    })
}

/// Look up one type by name.
pub fn instance_type(name: &str) -> Option<&'static InstanceConfig> {
    instance_types().get(name)
}
