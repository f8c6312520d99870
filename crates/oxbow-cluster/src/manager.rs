//! The demand loop
//!
//! The [`Manager`] converts unmet allocation demand into instance launches,
//! subject to the hourly cost cap and the pending-launch cap. It owns no
//! cloud plumbing itself: it drives a [`ManagedCluster`], and launches
//! report back over a completion channel (the manager never blocks on a
//! launcher, and a launcher never calls back into the manager).

use async_trait::async_trait;
use oxbow_core::{Requirements, Resources, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// A launch decision: which type to bring up, and its bid-price upper bound.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub resources: Resources,
    pub price: f64,
}

/// The cluster surface the manager drives.
#[async_trait]
pub trait ManagedCluster: Send + Sync {
    /// The cheapest available spec satisfying `need` within `max_price`.
    fn available(&self, need: &Resources, max_price: f64) -> Option<InstanceSpec>;

    /// Launch one instance of `spec`, returning its id once the agent is
    /// ready. The cluster records type unavailability internally.
    async fn launch(&self, spec: InstanceSpec) -> Result<String>;

    /// Reconcile the pool against the provider; returns instance id -> type.
    async fn refresh(&self) -> Result<HashMap<String, String>>;

    /// Publish the current waiting/pending aggregates for observability.
    fn notify(&self, waiting: &Resources, pending: &Resources);

    /// The hourly price upper bound of a running instance type.
    fn instance_price(&self, instance_type: &str) -> f64;

    /// The catalog resource vector of an instance type.
    fn type_resources(&self, instance_type: &str) -> Option<Resources>;
}

/// Caps and cadences for the demand loop.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_hourly_cost_usd: f64,
    pub max_pending_instances: usize,
    pub refresh_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_hourly_cost_usd: 10.0,
            max_pending_instances: 5,
            refresh_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(5),
        }
    }
}

struct Waiter {
    req: Requirements,
    tx: mpsc::Sender<()>,
}

/// Handle to a running demand loop.
pub struct Manager {
    waiter_tx: mpsc::UnboundedSender<Waiter>,
}

impl Manager {
    /// Start the demand loop. It runs until the `Manager` (and every
    /// receiver it handed out) is dropped.
    pub fn start(cluster: Arc<dyn ManagedCluster>, config: ManagerConfig) -> Self {
        let (waiter_tx, waiter_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cluster, config, waiter_rx));
        Self { waiter_tx }
    }

    /// Register demand. The returned channel is signalled once, when new
    /// capacity that can hold the requirement appears; the caller
    /// re-registers if the pools still cannot serve it. Drop the receiver
    /// to cancel the wait.
    pub fn allocate(&self, req: Requirements) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let _ = self.waiter_tx.send(Waiter { req, tx });
        rx
    }
}

async fn run(
    cluster: Arc<dyn ManagedCluster>,
    config: ManagerConfig,
    mut waiter_rx: mpsc::UnboundedReceiver<Waiter>,
) {
    let mut waiters: Vec<Waiter> = Vec::new();
    // Launch id -> spec for in-flight launches.
    let mut pending: HashMap<u64, InstanceSpec> = HashMap::new();
    let mut next_launch_id: u64 = 0;
    // Instance id -> type, from the last successful refresh.
    let mut pool: HashMap<String, String> = HashMap::new();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(u64, Result<String>)>();
    let mut refresh_tick = tokio::time::interval(config.refresh_interval);
    refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut housekeeping = tokio::time::interval(config.tick_interval);
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            waiter = waiter_rx.recv() => match waiter {
                Some(w) => waiters.push(w),
                // Every handle dropped: the cluster is shutting down.
                None => return,
            },
            Some((launch_id, result)) = done_rx.recv() => {
                let spec = pending.remove(&launch_id);
                match (&spec, result) {
                    (Some(spec), Ok(instance_id)) => {
                        info!(instance_id = %instance_id, instance_type = %spec.instance_type, "launch complete");
                        refresh(&cluster, &mut pool, &mut waiters).await;
                    }
                    (Some(spec), Err(err)) => {
                        error!(instance_type = %spec.instance_type, error = %err, "launch failed");
                    }
                    (None, _) => {}
                }
            }
            _ = refresh_tick.tick() => {
                refresh(&cluster, &mut pool, &mut waiters).await;
            }
            _ = housekeeping.tick() => {}
        }
        evaluate(
            &cluster,
            &config,
            &mut waiters,
            &mut pending,
            &mut next_launch_id,
            &pool,
            &done_tx,
        );
    }
}

async fn refresh(
    cluster: &Arc<dyn ManagedCluster>,
    pool: &mut HashMap<String, String>,
    waiters: &mut Vec<Waiter>,
) {
    match cluster.refresh().await {
        Ok(state) => {
            let new_capacity: Vec<Resources> = state
                .iter()
                .filter(|(id, _)| !pool.contains_key(*id))
                .filter_map(|(_, typ)| cluster.type_resources(typ))
                .collect();
            *pool = state;
            if new_capacity.is_empty() {
                return;
            }
            // Wake the waiters the new instances can hold; each re-attempts
            // its allocation against the live pools and re-registers if
            // that still fails.
            waiters.retain(|w| {
                if new_capacity.iter().any(|r| r.available(&w.req.min)) {
                    let _ = w.tx.try_send(());
                    false
                } else {
                    true
                }
            });
        }
        Err(err) => {
            debug!(error = %err, "refresh failed");
        }
    }
}

fn evaluate(
    cluster: &Arc<dyn ManagedCluster>,
    config: &ManagerConfig,
    waiters: &mut Vec<Waiter>,
    pending: &mut HashMap<u64, InstanceSpec>,
    next_launch_id: &mut u64,
    pool: &HashMap<String, String>,
    done_tx: &mpsc::UnboundedSender<(u64, Result<String>)>,
) {
    waiters.retain(|w| !w.tx.is_closed());

    let mut waiting = Resources::new();
    for w in waiters.iter() {
        waiting.add(&w.req.total());
    }
    let mut pending_total = Resources::new();
    for spec in pending.values() {
        pending_total.add(&spec.resources);
    }
    cluster.notify(&waiting, &pending_total);

    loop {
        if pending.len() >= config.max_pending_instances {
            return;
        }
        // Capacity already on the way counts against demand: satisfy
        // waiters out of the pending pot before launching more.
        let mut pot = pending_total.clone();
        let mut largest_unmet: Option<&Resources> = None;
        for w in waiters.iter() {
            if pot.available(&w.req.min) {
                pot.sub(&w.req.min);
                continue;
            }
            match largest_unmet {
                Some(cur) if cur.cmp_size(&w.req.min).is_ge() => {}
                _ => largest_unmet = Some(&w.req.min),
            }
        }
        let Some(need) = largest_unmet else { return };

        let committed: f64 = pool.values().map(|t| cluster.instance_price(t)).sum::<f64>()
            + pending.values().map(|s| s.price).sum::<f64>();
        let budget = config.max_hourly_cost_usd - committed;
        if budget <= 0.0 {
            debug!(committed, "hourly cost cap reached");
            return;
        }
        let Some(spec) = cluster.available(need, budget) else {
            debug!(need = %need, budget, "no available instance type");
            return;
        };

        let launch_id = *next_launch_id;
        *next_launch_id += 1;
        debug!(instance_type = %spec.instance_type, price = spec.price, "launching");
        pending_total.add(&spec.resources);
        pending.insert(launch_id, spec.clone());
        let cluster = cluster.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = cluster.launch(spec).await;
            let _ = done_tx.send((launch_id, result));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxbow_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GIB: f64 = (1u64 << 30) as f64;

    struct StubCluster {
        price: f64,
        launches: Mutex<Vec<InstanceSpec>>,
        launched: AtomicUsize,
        hold_launches: bool,
        release: tokio::sync::Notify,
        notified: Mutex<Vec<(Resources, Resources)>>,
    }

    impl StubCluster {
        fn new(price: f64, hold_launches: bool) -> Arc<Self> {
            Arc::new(Self {
                price,
                launches: Mutex::new(Vec::new()),
                launched: AtomicUsize::new(0),
                hold_launches,
                release: tokio::sync::Notify::new(),
                notified: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ManagedCluster for StubCluster {
        fn available(&self, need: &Resources, max_price: f64) -> Option<InstanceSpec> {
            (self.price <= max_price).then(|| InstanceSpec {
                instance_type: "c5.2xlarge".into(),
                resources: need.clone().with("cpu", need.get("cpu").max(8.0)),
                price: self.price,
            })
        }

        async fn launch(&self, spec: InstanceSpec) -> Result<String> {
            self.launches.lock().unwrap().push(spec);
            if self.hold_launches {
                self.release.notified().await;
            }
            let n = self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(format!("i-{n}"))
        }

        async fn refresh(&self) -> Result<HashMap<String, String>> {
            let n = self.launched.load(Ordering::SeqCst);
            Ok((0..n).map(|i| (format!("i-{i}"), "c5.2xlarge".to_string())).collect())
        }

        fn notify(&self, waiting: &Resources, pending: &Resources) {
            self.notified.lock().unwrap().push((waiting.clone(), pending.clone()));
        }

        fn instance_price(&self, _instance_type: &str) -> f64 {
            self.price
        }

        fn type_resources(&self, _instance_type: &str) -> Option<Resources> {
            Some(Resources::cpu_mem(8.0, 16.0 * GIB))
        }
    }

    fn config(max_cost: f64, max_pending: usize) -> ManagerConfig {
        ManagerConfig {
            max_hourly_cost_usd: max_cost,
            max_pending_instances: max_pending,
            refresh_interval: Duration::from_millis(20),
            tick_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn demand_triggers_a_launch_and_a_notification() {
        let cluster = StubCluster::new(0.5, true);
        let manager = Manager::start(cluster.clone(), config(10.0, 1));
        let mut rx = manager.allocate(Requirements::narrow(Resources::cpu_mem(4.0, 8.0 * GIB)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let launches = cluster.launches.lock().unwrap();
            assert_eq!(launches.len(), 1);
            assert_eq!(launches[0].instance_type, "c5.2xlarge");
        }
        // The waiter is signalled once the launch lands in the pool. The
        // waiter stays unserved (nothing allocates here), so the manager
        // is free to keep provisioning; only the signal is asserted.
        cluster.release.notify_waiters();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("waiter signalled")
            .expect("channel open");
        let notified = cluster.notified.lock().unwrap();
        assert!(notified.iter().any(|(w, _)| w.get("cpu") >= 4.0));
    }

    #[tokio::test]
    async fn pending_cap_bounds_inflight_launches() {
        let cluster = StubCluster::new(0.1, true);
        let manager = Manager::start(cluster.clone(), config(100.0, 2));
        // Demand that would justify many instances.
        let mut rxs = Vec::new();
        for _ in 0..6 {
            rxs.push(manager.allocate(Requirements::narrow(Resources::cpu_mem(8.0, 8.0 * GIB))));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.launches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cost_cap_blocks_launch_initiation() {
        // One instance costs 6; the cap is 10, so a second concurrent
        // launch would exceed it and must not be initiated.
        let cluster = StubCluster::new(6.0, true);
        let manager = Manager::start(cluster.clone(), config(10.0, 5));
        let _rx1 = manager.allocate(Requirements::narrow(Resources::cpu_mem(8.0, 8.0 * GIB)));
        let _rx2 = manager.allocate(Requirements::narrow(Resources::cpu_mem(8.0, 8.0 * GIB)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.launches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_waiters_stop_driving_demand() {
        let cluster = StubCluster::new(0.1, true);
        let manager = Manager::start(cluster.clone(), config(100.0, 1));
        let rx = manager.allocate(Requirements::narrow(Resources::cpu_mem(8.0, 8.0 * GIB)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.launches.lock().unwrap().len(), 1);
        drop(rx);
        cluster.release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The first launch completes but no further demand exists.
        assert_eq!(cluster.launches.lock().unwrap().len(), 1);
    }
}
