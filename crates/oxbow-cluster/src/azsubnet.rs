//! Availability-zone and subnet maps
//!
//! When a cluster is configured with a list of subnets, launches must pick
//! the subnet matching the chosen availability zone. The mapping is stable
//! for the lifetime of a process, so it is computed once per
//! (region, subnet set) and memoized process-wide.

use crate::ec2::Ec2Ops;
use oxbow_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

/// Zone/subnet lookup tables for one (region, subnet set).
#[derive(Debug, Default)]
pub struct AzSubnetMap {
    /// Zone name -> subnet id. Zones with more than one configured subnet
    /// are omitted (which subnet would be used is ambiguous).
    subnet_by_zone: HashMap<String, String>,
    /// Zone id -> zone name. Account-specific but stable over time.
    zone_names: HashMap<String, String>,
}

impl AzSubnetMap {
    /// The configured subnet for `zone_name`, if unambiguous.
    pub fn subnet_for_zone(&self, zone_name: &str) -> Option<&str> {
        self.subnet_by_zone.get(zone_name).map(String::as_str)
    }

    pub fn zone_name(&self, zone_id: &str) -> Option<&str> {
        self.zone_names.get(zone_id).map(String::as_str)
    }

    /// All zone names that have a usable subnet.
    pub fn zones(&self) -> Vec<String> {
        self.subnet_by_zone.keys().cloned().collect()
    }
}

fn cache() -> &'static Mutex<HashMap<(String, Vec<String>), Arc<AzSubnetMap>>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, Vec<String>), Arc<AzSubnetMap>>>> =
        OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The memoized map for (`region`, `subnet_ids`). The first caller computes
/// it; concurrent racers may compute it twice, but the stored value is
/// stable so either result is equivalent.
pub async fn az_subnet_map(
    ec2: &dyn Ec2Ops,
    region: &str,
    subnet_ids: &[String],
) -> Result<Arc<AzSubnetMap>> {
    let mut key_subnets = subnet_ids.to_vec();
    key_subnets.sort();
    let key = (region.to_string(), key_subnets);
    if let Some(found) = cache().lock().unwrap().get(&key) {
        return Ok(found.clone());
    }

    let mut map = AzSubnetMap::default();
    for (zone_id, zone_name) in ec2.availability_zones().await? {
        map.zone_names.insert(zone_id, zone_name);
    }
    let mut by_zone: HashMap<String, Vec<String>> = HashMap::new();
    for (subnet_id, zone_name) in ec2.subnet_zones(subnet_ids).await? {
        by_zone.entry(zone_name).or_default().push(subnet_id);
    }
    for (zone, subnets) in by_zone {
        if subnets.len() == 1 {
            debug!(zone = %zone, subnet = %subnets[0], "zone subnet mapping");
            map.subnet_by_zone.insert(zone, subnets.into_iter().next().unwrap());
        } else {
            debug!(zone = %zone, subnets = ?subnets, "ambiguous subnets for zone, skipping");
        }
    }

    let map = Arc::new(map);
    Ok(cache().lock().unwrap().entry(key).or_insert_with(|| map.clone()).clone())
}
