//! Elastic EC2-backed worker cluster
//!
//! An [`EcCluster`] maintains a fleet of VMs running the skiff agent,
//! expanding with demand and shrinking as idle workers terminate
//! themselves. No local state is persisted: cluster membership is inferred
//! from provider tags, so several driver processes can safely share one
//! cluster.
//!
//! The moving parts:
//! - [`catalog`] / [`state`]: which instance types exist and which are
//!   currently worth asking for
//! - [`probe`]: spot capacity probing
//! - [`launch`]: one VM bring-up
//! - [`manager`]: the demand loop converting unmet allocation requests
//!   into launches under the cost and pending caps
//! - the reconciler in this module: tag-filtered fleet listing that
//!   replaces the in-memory pool set

pub mod advisor;
pub mod azsubnet;
pub mod catalog;
pub mod ec2;
pub mod launch;
pub mod manager;
pub mod probe;
pub mod state;
pub mod userdata;

use crate::advisor::SpotAdvisor;
use crate::azsubnet::az_subnet_map;
use crate::catalog::InstanceConfig;
use crate::ec2::{Ec2Ops, EbsLayout, LaunchSpec, ManagedInstance, SpotRequestStatus, VmState};
use crate::launch::{BootstrapCheck, Launcher};
use crate::manager::{InstanceSpec, ManagedCluster, Manager, ManagerConfig};
use crate::probe::SpotProber;
use crate::state::InstanceState;
use async_trait::async_trait;
use futures::FutureExt;
use oxbow_core::limiter::{BatchLimiter, RateLimiter};
use oxbow_core::{Error, Requirements, Resources, Result};
use oxbow_pool::client::PoolClient;
use oxbow_pool::{allocate_from_pools, Alloc, AllocMeta, Pool};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// TTL for instance types the provider refused to launch.
const UNAVAILABLE_TTL: Duration = Duration::from_secs(3600);
/// Memoization window for spot capacity probes.
const PROBE_WINDOW: Duration = Duration::from_secs(60);
/// How long one attempt to allocate from the existing pools may take.
const POOL_ALLOC_TIMEOUT: Duration = Duration::from_secs(30);
/// Cadence of pool re-attempts while waiting on the demand loop.
const ALLOC_ATTEMPT_INTERVAL: Duration = Duration::from_secs(60);
/// Per-page deadline for the reconciler's instance listing.
const LIST_PAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tag keys identifying cluster membership.
const USER_TAG: &str = "user";
const CLUSTER_TAG: &str = "cluster";
const MANAGED_BY_TAG: &str = "managedby";
const VERSION_TAG: &str = "skiff:version";
const MANAGED_BY: &str = "oxbow";

const GIB: f64 = (1u64 << 30) as f64;

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name; distinct names maintain distinct fleets.
    pub name: String,
    /// Owning user, written to instance tags.
    pub user: String,
    pub region: String,
    /// Prefer spot instances.
    pub spot: bool,
    /// Aggregate hourly bid cap in USD.
    pub max_hourly_cost_usd: f64,
    /// Concurrency cap for in-flight launches.
    pub max_pending_instances: usize,
    /// EBS volume type for worker data volumes.
    pub disk_type: String,
    /// Data disk per worker, GiB.
    pub disk_space_gib: u64,
    /// Number of EBS volumes; more than one forms RAID0.
    pub disk_slices: u64,
    /// Instance type allow-list; empty admits every verified type.
    pub instance_types: Vec<String>,
    /// How many VMs a spot capacity probe asks for.
    pub spot_probe_depth: usize,
    /// Hard deadline for agent readiness after a launch.
    pub bootstrap_expiry_secs: u64,
    /// Disable idle self-termination on the workers.
    pub immortal: bool,
    pub ami: String,
    pub security_group: String,
    pub instance_profile: Option<String>,
    pub key_name: Option<String>,
    pub ssh_keys: Vec<String>,
    /// Subnet ids; when set, launches pick the subnet for their zone.
    pub subnets: Vec<String>,
    /// HTTPS URL of the bootstrap image workers chain-load.
    pub bootstrap_image: String,
    /// Agent version this driver is compatible with.
    pub skiff_version: String,
    /// Informational labels added to instance tags.
    pub labels: BTreeMap<String, String>,
    /// Extra cloud-config appended to worker userdata.
    pub extra_cloud_config: Option<String>,
    /// Overrides the per-instance agent base URL (port-forwarded agents,
    /// tests). Not part of persisted configuration.
    #[serde(skip)]
    pub agent_base: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            user: String::new(),
            region: String::new(),
            spot: false,
            max_hourly_cost_usd: 10.0,
            max_pending_instances: 5,
            disk_type: "gp3".to_string(),
            disk_space_gib: 0,
            disk_slices: 1,
            instance_types: Vec::new(),
            spot_probe_depth: 1,
            bootstrap_expiry_secs: 600,
            immortal: false,
            ami: String::new(),
            security_group: String::new(),
            instance_profile: None,
            key_name: None,
            ssh_keys: Vec::new(),
            subnets: Vec::new(),
            bootstrap_image: String::new(),
            skiff_version: String::new(),
            labels: BTreeMap::new(),
            extra_cloud_config: None,
            agent_base: None,
        }
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::fatal("missing region parameter"));
        }
        if self.disk_type.is_empty() {
            return Err(Error::fatal("missing disk type parameter"));
        }
        if self.disk_space_gib == 0 {
            return Err(Error::fatal("missing disk space parameter"));
        }
        if self.ami.is_empty() {
            return Err(Error::fatal("missing AMI parameter"));
        }
        if self.security_group.is_empty() {
            return Err(Error::fatal("missing security group parameter"));
        }
        if self.skiff_version.is_empty() {
            return Err(Error::fatal("missing skiff version parameter"));
        }
        Ok(())
    }
}

/// A snapshot of the fleet for observability.
#[derive(Debug, Clone, Default)]
pub struct FleetStats {
    pub instances: usize,
    pub by_type: BTreeMap<String, usize>,
    pub total: Resources,
    /// Upper bound on the fleet's hourly cost in USD.
    pub hourly_price_usd: f64,
}

struct PoolEntry {
    instance: ManagedInstance,
    pool: Arc<dyn Pool>,
}

struct Inner {
    config: ClusterConfig,
    state: Arc<InstanceState>,
    ec2: Arc<dyn Ec2Ops>,
    http: reqwest::Client,
    prober: Arc<SpotProber>,
    desc_inst: Arc<BatchLimiter<String, ManagedInstance>>,
    desc_spot: Arc<BatchLimiter<String, SpotRequestStatus>>,
    submit_limiter: Arc<RateLimiter>,
    refresh_limiter: Arc<RateLimiter>,
    bootstrap_check: BootstrapCheck,
    pools: Mutex<HashMap<String, PoolEntry>>,
    manager: OnceLock<Manager>,
    /// Offered resource vectors recorded at launch, which may differ
    /// slightly from the catalog.
    offered: Mutex<HashMap<String, Resources>>,
}

/// An elastic cluster of skiff workers on EC2.
#[derive(Clone)]
pub struct EcCluster {
    inner: Arc<Inner>,
}

impl EcCluster {
    pub fn new(
        config: ClusterConfig,
        ec2: Arc<dyn Ec2Ops>,
        advisor: Option<Arc<dyn SpotAdvisor>>,
        http: reqwest::Client,
    ) -> Result<Self> {
        config.validate()?;

        // The admissible catalog slice, with the configured disk filled in.
        let mut configs = Vec::new();
        for c in catalog::instance_types().values() {
            if !config.instance_types.is_empty()
                && !config.instance_types.contains(&c.instance_type)
            {
                continue;
            }
            let mut c = c.clone();
            c.resources.set("disk", config.disk_space_gib as f64 * GIB);
            configs.push(c);
        }
        for name in &config.instance_types {
            if catalog::instance_type(name).is_none() {
                debug!(instance_type = %name, "unknown instance type in allow-list");
            }
        }
        if configs.is_empty() {
            return Err(Error::fatal("no configured instance types"));
        }
        let state = Arc::new(InstanceState::new(
            configs,
            UNAVAILABLE_TTL,
            config.region.clone(),
            advisor,
        ));

        let desc_inst = {
            let ec2 = ec2.clone();
            Arc::new(BatchLimiter::new(
                100,
                5.0,
                Arc::new(move |ids: Vec<String>| {
                    let ec2 = ec2.clone();
                    async move { ec2.describe_instances(ids).await }.boxed()
                }),
            ))
        };
        let desc_spot = {
            let ec2 = ec2.clone();
            Arc::new(BatchLimiter::new(
                30,
                2.0,
                Arc::new(move |ids: Vec<String>| {
                    let ec2 = ec2.clone();
                    async move { ec2.describe_spot_requests(ids).await }.boxed()
                }),
            ))
        };
        let prober = {
            let ec2 = ec2.clone();
            let probe_config = config.clone();
            Arc::new(SpotProber::new(
                Arc::new(move |instance_type: String, depth: usize| {
                    let ec2 = ec2.clone();
                    let config = probe_config.clone();
                    async move {
                        let Some(cfg) = catalog::instance_type(&instance_type) else {
                            return Ok(false);
                        };
                        let spec = probe_spec(&config, cfg.clone());
                        ec2.spot_capacity(&spec, depth).await
                    }
                    .boxed()
                }),
                config.spot_probe_depth,
                PROBE_WINDOW,
            ))
        };

        let bootstrap_check: BootstrapCheck = Arc::new(tokio::sync::OnceCell::new());
        if config.agent_base.is_some() {
            // Overridden agent base: launches are not reaching real VMs, so
            // the artifact HEAD check is moot.
            let _ = bootstrap_check.set(Ok(()));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state,
                ec2,
                http,
                prober,
                desc_inst,
                desc_spot,
                submit_limiter: Arc::new(RateLimiter::new(5.0, 5)),
                refresh_limiter: Arc::new(RateLimiter::new(1.0, 1)),
                bootstrap_check,
                pools: Mutex::new(HashMap::new()),
                manager: OnceLock::new(),
                offered: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start the demand loop. Must be called before [`Self::allocate`];
    /// calling it again is a no-op.
    pub fn start(&self) {
        let mut manager_config = ManagerConfig::default();
        manager_config.max_hourly_cost_usd = self.inner.config.max_hourly_cost_usd;
        manager_config.max_pending_instances = self.inner.config.max_pending_instances;
        self.inner
            .manager
            .get_or_init(|| Manager::start(Arc::new(Managed(self.inner.clone())), manager_config));
    }

    /// Tags written on every instance this cluster launches.
    pub fn instance_tags(&self) -> BTreeMap<String, String> {
        let config = &self.inner.config;
        let mut tags = BTreeMap::new();
        tags.insert("Name".to_string(), format!("{} (oxbow)", config.user));
        tags.insert(USER_TAG.to_string(), config.user.clone());
        tags.insert(CLUSTER_TAG.to_string(), config.name.clone());
        tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY.to_string());
        for (k, v) in &config.labels {
            tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        tags
    }

    /// Tags identifying instances that belong to this cluster, including
    /// the agent version tag the skiff adds once it is up.
    pub fn query_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(USER_TAG.to_string(), self.inner.config.user.clone());
        tags.insert(CLUSTER_TAG.to_string(), self.inner.config.name.clone());
        tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY.to_string());
        tags.insert(VERSION_TAG.to_string(), self.inner.config.skiff_version.clone());
        tags
    }

    /// The hourly price upper bound of `instance_type` in this region.
    pub fn instance_price_usd(&self, instance_type: &str) -> f64 {
        self.inner
            .state
            .config(instance_type)
            .map(|c| c.price(&self.inner.config.region))
            .unwrap_or(0.0)
    }

    pub fn cheapest_instance_price_usd(&self) -> f64 {
        self.inner
            .state
            .cheapest()
            .map(|c| c.price(&self.inner.config.region))
            .unwrap_or(0.0)
    }

    /// The resource vector the instance's agent actually offered at
    /// launch, when this process launched it. May differ slightly from the
    /// catalog.
    pub fn offered_resources(&self, instance_id: &str) -> Option<Resources> {
        self.inner.offered.lock().unwrap().get(instance_id).cloned()
    }

    /// A point-in-time fleet summary.
    pub fn fleet_stats(&self) -> FleetStats {
        let pools = self.inner.pools.lock().unwrap();
        let mut stats = FleetStats { instances: pools.len(), ..Default::default() };
        for entry in pools.values() {
            *stats.by_type.entry(entry.instance.instance_type.clone()).or_insert(0) += 1;
            if let Some(cfg) = self.inner.state.config(&entry.instance.instance_type) {
                stats.total.add(&cfg.resources);
                stats.hourly_price_usd += cfg.price(&self.inner.config.region);
            }
        }
        stats
    }

    /// Reconcile the in-memory pool set against the provider's view:
    /// the pool set becomes exactly the running instances matching
    /// [`Self::query_tags`]. Returns instance id -> type.
    pub async fn refresh(&self) -> Result<HashMap<String, String>> {
        let tags = self.query_tags();
        let mut live: HashMap<String, ManagedInstance> = HashMap::new();
        let mut next_token = None;
        loop {
            self.inner.refresh_limiter.acquire().await;
            let page = tokio::time::timeout(
                LIST_PAGE_TIMEOUT,
                self.inner.ec2.list_instances_page(&tags, next_token),
            )
            .await
            .map_err(|_| Error::temporary("instance listing timed out"))??;
            let (instances, token) = page;
            for inst in instances {
                if inst.state == VmState::Running {
                    live.insert(inst.id.clone(), inst);
                }
            }
            match token {
                Some(t) => next_token = Some(t),
                None => break,
            }
        }

        let mut result = HashMap::new();
        {
            let mut pools = self.inner.pools.lock().unwrap();
            pools.retain(|id, _| live.contains_key(id));
            for (id, inst) in live {
                result.insert(id.clone(), inst.instance_type.clone());
                if pools.contains_key(&id) {
                    continue;
                }
                let Some(dns) = inst.public_dns.clone() else {
                    debug!(instance_id = %id, "running instance has no dns yet");
                    continue;
                };
                debug!(instance_id = %id, instance_type = %inst.instance_type, dns = %dns, "discovered instance");
                let pool: Arc<dyn Pool> = match &self.inner.config.agent_base {
                    Some(base) => {
                        Arc::new(PoolClient::with_base(&id, base.clone(), self.inner.http.clone()))
                    }
                    None => Arc::new(PoolClient::new(&id, &dns, self.inner.http.clone())),
                };
                pools.insert(id, PoolEntry { instance: inst, pool });
            }
        }
        self.log_fleet();
        Ok(result)
    }

    fn log_fleet(&self) {
        let stats = self.fleet_stats();
        let counts: Vec<String> =
            stats.by_type.iter().map(|(t, n)| format!("{t}:{n}")).collect();
        info!(
            instances = stats.instances,
            types = %counts.join(","),
            hourly_usd = format!("{:.2}", stats.hourly_price_usd),
            total = %stats.total,
            "fleet"
        );
    }

    fn pool_snapshot(&self) -> Vec<Arc<dyn Pool>> {
        self.inner.pools.lock().unwrap().values().map(|e| e.pool.clone()).collect()
    }

    async fn try_pools(
        &self,
        req: &Requirements,
        meta: &AllocMeta,
    ) -> Result<Arc<dyn Alloc>> {
        let pools = self.pool_snapshot();
        if pools.is_empty() {
            return Err(Error::unavailable("no pools"));
        }
        tokio::time::timeout(POOL_ALLOC_TIMEOUT, allocate_from_pools(&pools, req, meta.clone()))
            .await
            .map_err(|_| Error::temporary("pool allocation timed out"))?
    }

    /// Bring up one instance of `instance_type` to measure how long a
    /// usable agent takes and what resources it really offers. The VM is
    /// terminated afterwards. Spot unavailability falls back to on-demand.
    pub async fn probe(&self, instance_type: &str) -> Result<(Resources, Duration)> {
        let config = self
            .inner
            .state
            .config(instance_type)
            .ok_or_else(|| Error::not_exist(format!("instance type {instance_type}")))?;
        let started = Instant::now();
        let (instance, resources) = self.launch_instance(&config).await?;
        let elapsed = started.elapsed();
        if let Err(err) = self.inner.ec2.terminate_instance(&instance.id).await {
            warn!(instance_id = %instance.id, error = %err, "probe terminate failed");
        }
        Ok((resources, elapsed))
    }

    async fn launch_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<(ManagedInstance, Resources)> {
        let inner = &self.inner;
        let subnet_id = if inner.config.subnets.is_empty() {
            None
        } else {
            let map =
                az_subnet_map(inner.ec2.as_ref(), &inner.config.region, &inner.config.subnets)
                    .await?;
            let mut zones = map.zones();
            zones.sort();
            zones.first().and_then(|z| map.subnet_for_zone(z)).map(str::to_string)
        };

        let ebs = EbsLayout {
            volume_type: inner.config.disk_type.clone(),
            size_gib: inner.config.disk_space_gib,
            slices: inner.config.disk_slices.max(1),
        };
        let user_data = userdata::encoded_cloud_config(&userdata::UserdataSpec {
            bootstrap_image: inner.config.bootstrap_image.clone(),
            bootstrap_expiry_secs: inner.config.bootstrap_expiry_secs,
            immortal: inner.config.immortal,
            ssh_keys: inner.config.ssh_keys.clone(),
            ebs: ebs.clone(),
            extra_cloud_config: inner.config.extra_cloud_config.clone(),
        });
        let spec = LaunchSpec {
            config: config.clone(),
            ami: inner.config.ami.clone(),
            spot: inner.config.spot,
            spot_price: inner
                .config
                .spot
                .then(|| config.price(&inner.config.region)),
            subnet_id,
            security_group: inner.config.security_group.clone(),
            instance_profile: inner.config.instance_profile.clone(),
            key_name: inner.config.key_name.clone(),
            user_data,
            ebs,
            tags: self.instance_tags(),
        };
        let launcher = Launcher {
            spec,
            bootstrap_image: inner.config.bootstrap_image.clone(),
            bootstrap_expiry: Duration::from_secs(inner.config.bootstrap_expiry_secs),
            poll_interval: Duration::from_secs(5),
            ec2: inner.ec2.clone(),
            http: inner.http.clone(),
            prober: inner.prober.clone(),
            desc_inst: inner.desc_inst.clone(),
            desc_spot: inner.desc_spot.clone(),
            submit_limiter: inner.submit_limiter.clone(),
            bootstrap_check: inner.bootstrap_check.clone(),
            agent_base: inner.config.agent_base.clone(),
        };
        let (instance, resources) = launcher.launch().await?;
        inner.offered.lock().unwrap().insert(instance.id.clone(), resources.clone());
        Ok((instance, resources))
    }
}

/// The manager-facing surface of the cluster.
struct Managed(Arc<Inner>);

#[async_trait]
impl ManagedCluster for Managed {
    fn available(&self, need: &Resources, max_price: f64) -> Option<InstanceSpec> {
        let inner = &self.0;
        inner
            .state
            .min_available(need, inner.config.spot, max_price)
            .map(|c| InstanceSpec {
                price: c.price(&inner.config.region),
                resources: c.resources.clone(),
                instance_type: c.instance_type,
            })
    }

    async fn launch(&self, spec: InstanceSpec) -> Result<String> {
        let cluster = EcCluster { inner: self.0.clone() };
        let Some(config) = self.0.state.config(&spec.instance_type) else {
            return Err(Error::not_exist(format!("instance type {}", spec.instance_type)));
        };
        match cluster.launch_instance(&config).await {
            Ok((instance, _)) => Ok(instance.id),
            Err(err) => {
                if err.is(oxbow_core::ErrorKind::Unavailable) {
                    self.0.state.unavailable(&config);
                }
                Err(err)
            }
        }
    }

    async fn refresh(&self) -> Result<HashMap<String, String>> {
        EcCluster { inner: self.0.clone() }.refresh().await
    }

    fn notify(&self, waiting: &Resources, pending: &Resources) {
        info!(waiting = %waiting, pending = %pending, "demand");
    }

    fn instance_price(&self, instance_type: &str) -> f64 {
        self.0
            .state
            .config(instance_type)
            .map(|c| c.price(&self.0.config.region))
            .unwrap_or(0.0)
    }

    fn type_resources(&self, instance_type: &str) -> Option<Resources> {
        self.0.state.config(instance_type).map(|c| c.resources)
    }
}

#[async_trait]
impl oxbow_pool::Cluster for EcCluster {
    fn can_allocate(&self, resources: &Resources) -> Result<()> {
        if self.inner.state.available(resources) {
            return Ok(());
        }
        let largest = self.inner.state.largest();
        let detail = largest
            .map(|c| format!("largest available type {} has {}", c.instance_type, c.resources))
            .unwrap_or_else(|| "no instance types configured".to_string());
        Err(Error::resources_exhausted(format!(
            "requested resources {resources} not satisfiable: {detail}"
        )))
    }

    async fn allocate(
        &self,
        req: Requirements,
        labels: BTreeMap<String, String>,
    ) -> Result<Arc<dyn Alloc>> {
        self.can_allocate(&req.min)?;
        let Some(manager) = self.inner.manager.get() else {
            return Err(Error::fatal("cluster not started"));
        };
        debug!(req = %req, "allocate");
        let meta = AllocMeta { owner: self.inner.config.user.clone(), labels };

        if let Ok(alloc) = self.try_pools(&req, &meta).await {
            return Ok(alloc);
        }

        let mut needch = manager.allocate(req.clone());
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + ALLOC_ATTEMPT_INTERVAL,
            ALLOC_ATTEMPT_INTERVAL,
        );
        loop {
            tokio::select! {
                signal = needch.recv() => {
                    match self.try_pools(&req, &meta).await {
                        Ok(alloc) => return Ok(alloc),
                        Err(err) => {
                            debug!(error = %err, "pool allocation failed, reprovisioning");
                        }
                    }
                    if signal.is_none() {
                        // Demand loop gone: the cluster is shutting down.
                        return Err(Error::canceled("cluster shut down"));
                    }
                    needch = manager.allocate(req.clone());
                }
                _ = ticker.tick() => {
                    if let Ok(alloc) = self.try_pools(&req, &meta).await {
                        return Ok(alloc);
                    }
                }
            }
        }
    }
}

fn probe_spec(config: &ClusterConfig, instance_config: InstanceConfig) -> LaunchSpec {
    LaunchSpec {
        config: instance_config,
        ami: config.ami.clone(),
        spot: true,
        spot_price: None,
        subnet_id: None,
        security_group: config.security_group.clone(),
        instance_profile: None,
        key_name: None,
        user_data: String::new(),
        ebs: EbsLayout {
            volume_type: config.disk_type.clone(),
            size_gib: config.disk_space_gib.max(1),
            slices: 1,
        },
        tags: BTreeMap::new(),
    }
}
