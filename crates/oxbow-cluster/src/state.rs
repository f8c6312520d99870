//! Queryable instance-type state
//!
//! [`InstanceState`] indexes the admissible catalog slice for one region:
//! cheapest/largest lookups, min/max availability queries under spot and
//! price constraints, and TTL-based suppression of types the cloud refused
//! to launch recently.

use crate::advisor::{InterruptProbability, SpotAdvisor, THRESHOLD_LADDER};
use crate::catalog::InstanceConfig;
use oxbow_core::Resources;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// The advisor queries are for the worker OS; skiff runs on Linux.
const ADVISOR_OS: &str = "Linux";

/// Runtime index over the admissible instance types of one region.
pub struct InstanceState {
    /// Sorted by ascending regional price, then ascending resource vector,
    /// so a forward scan finds the cheapest, least over-provisioned match.
    configs: Vec<InstanceConfig>,
    region: String,
    ttl: Duration,
    advisor: Option<Arc<dyn SpotAdvisor>>,
    unavailable_until: Mutex<HashMap<String, Instant>>,
}

impl InstanceState {
    pub fn new(
        mut configs: Vec<InstanceConfig>,
        ttl: Duration,
        region: impl Into<String>,
        advisor: Option<Arc<dyn SpotAdvisor>>,
    ) -> Self {
        let region = region.into();
        configs.sort_by(|a, b| {
            a.price(&region)
                .partial_cmp(&b.price(&region))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.resources.cmp_size(&b.resources))
        });
        Self {
            configs,
            region,
            ttl,
            advisor,
            unavailable_until: Mutex::new(HashMap::new()),
        }
    }

    /// Mark `config`'s type unavailable for the TTL.
    pub fn unavailable(&self, config: &InstanceConfig) {
        debug!(instance_type = %config.instance_type, ttl = ?self.ttl, "marking type unavailable");
        self.unavailable_until
            .lock()
            .unwrap()
            .insert(config.instance_type.clone(), Instant::now() + self.ttl);
    }

    fn is_available(&self, instance_type: &str) -> bool {
        match self.unavailable_until.lock().unwrap().get(instance_type) {
            Some(until) => Instant::now() >= *until,
            None => true,
        }
    }

    /// Whether any catalog entry can accommodate `need` at all. Ignores
    /// transient unavailability: this answers schedulability, not timing.
    pub fn available(&self, need: &Resources) -> bool {
        self.configs.iter().any(|c| c.resources.available(need))
    }

    /// The cheapest type whose resources dominate `need`, whose price is
    /// within `max_price`, which is currently available, and which (for
    /// spot) passes the interruption threshold ladder.
    pub fn min_available(
        &self,
        need: &Resources,
        spot: bool,
        max_price: f64,
    ) -> Option<InstanceConfig> {
        self.query(spot, |threshold| {
            self.configs
                .iter()
                .find(|c| {
                    c.resources.available(need)
                        && c.price(&self.region) <= max_price
                        && self.is_available(&c.instance_type)
                        && self.passes(c, threshold)
                })
                .cloned()
        })
    }

    /// The most resourceful available type dominating `need`, ignoring
    /// price. Used to answer "is this schedulable at all, and on what".
    pub fn max_available(&self, need: &Resources, spot: bool) -> Option<InstanceConfig> {
        self.query(spot, |threshold| {
            self.configs
                .iter()
                .filter(|c| {
                    c.resources.available(need)
                        && self.is_available(&c.instance_type)
                        && self.passes(c, threshold)
                })
                .max_by(|a, b| cmp_capacity(&a.resources, &b.resources))
                .cloned()
        })
    }

    /// The largest type in the catalog slice, regardless of availability.
    pub fn largest(&self) -> Option<InstanceConfig> {
        self.configs
            .iter()
            .max_by(|a, b| cmp_capacity(&a.resources, &b.resources))
            .cloned()
    }

    /// The cheapest type in the catalog slice, regardless of availability.
    pub fn cheapest(&self) -> Option<InstanceConfig> {
        self.configs.first().cloned()
    }

    /// Look up an admissible type by name.
    pub fn config(&self, instance_type: &str) -> Option<InstanceConfig> {
        self.configs.iter().find(|c| c.instance_type == instance_type).cloned()
    }

    /// Run `scan` once per ladder threshold until it yields, or once with no
    /// filtering when the advisor does not apply.
    fn query<F>(&self, spot: bool, scan: F) -> Option<InstanceConfig>
    where
        F: Fn(Option<InterruptProbability>) -> Option<InstanceConfig>,
    {
        if !spot || self.advisor.is_none() {
            return scan(None);
        }
        THRESHOLD_LADDER.iter().find_map(|threshold| scan(Some(*threshold)))
    }

    fn passes(&self, config: &InstanceConfig, threshold: Option<InterruptProbability>) -> bool {
        let Some(threshold) = threshold else { return true };
        let Some(advisor) = &self.advisor else { return true };
        match advisor.max_interrupt_probability(ADVISOR_OS, &self.region, &config.instance_type) {
            Ok(p) => p <= threshold,
            // No data for this type: it only qualifies once the ladder has
            // relaxed all the way.
            Err(_) => threshold == InterruptProbability::Any,
        }
    }
}

/// Capacity order used for "largest" selections: memory-major, since memory
/// is the dimension that most often rules out placements.
fn cmp_capacity(a: &Resources, b: &Resources) -> Ordering {
    for key in ["mem", "cpu", "disk", "gpu"] {
        match a.get(key).partial_cmp(&b.get(key)) {
            Some(Ordering::Equal) | None => continue,
            Some(ord) => return ord,
        }
    }
    Ordering::Equal
}
