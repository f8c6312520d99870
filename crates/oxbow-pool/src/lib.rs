//! Worker pools and allocs
//!
//! A worker (one VM running the skiff agent) is a [`Pool`]: it advertises
//! free capacity as [`Offer`]s and turns an accepted offer into an
//! [`Alloc`], a time-bounded reservation that must be kept alive. The
//! scheduler acquires allocs from a [`Cluster`], which either finds capacity
//! among the live pools or provisions new workers.
//!
//! All three surfaces are traits so the scheduler can be exercised against
//! in-memory fakes; the production implementations are the HTTPS
//! [`client::PoolClient`] and the EC2-backed cluster.

pub mod client;
pub mod keepalive;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxbow_core::{Digest, Error, ExecConfig, ExecResult, Fileset, Repository, Requirements, Resources, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use keepalive::{keepalive_loop, KeepalivePolicy};

/// Free capacity advertised by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub resources: Resources,
}

/// Metadata attached to an alloc at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocMeta {
    pub owner: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A point-in-time view of an alloc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocInspect {
    pub id: String,
    pub resources: Resources,
    pub expires: DateTime<Utc>,
    pub last_keepalive: DateTime<Utc>,
    pub meta: AllocMeta,
}

/// One worker's allocation surface.
#[async_trait]
pub trait Pool: Send + Sync {
    /// The worker's identity (its instance id).
    fn id(&self) -> String;

    /// Currently advertised offers.
    async fn offers(&self) -> Result<Vec<Offer>>;

    /// Accept `offer_id`, reserving `resources` out of it.
    async fn allocate(
        &self,
        offer_id: &str,
        meta: AllocMeta,
        resources: Resources,
    ) -> Result<Arc<dyn Alloc>>;
}

/// A time-bounded capacity reservation on a worker.
#[async_trait]
pub trait Alloc: Send + Sync {
    fn id(&self) -> String;

    fn resources(&self) -> Resources;

    /// The alloc's content-addressed repository.
    fn repository(&self) -> Arc<dyn Repository>;

    /// Install `fileset` into the alloc's repository, resolving unresolved
    /// files and incrementing per-file refcounts. `src` is consulted for
    /// resolved files the alloc does not already hold. Returns the resolved
    /// fileset.
    async fn load(&self, fileset: &Fileset, src: &dyn Repository) -> Result<Fileset>;

    /// Decrement refcounts for `fileset`. Idempotent at the zero floor.
    async fn unload(&self, fileset: &Fileset) -> Result<()>;

    /// Start an exec under this alloc.
    async fn put_exec(&self, task: Digest, config: ExecConfig) -> Result<()>;

    /// Wait for the exec's result.
    async fn wait_exec(&self, task: Digest) -> Result<ExecResult>;

    /// Extend the alloc's lease, asking for `interval`; returns the granted
    /// interval until expiry.
    async fn keepalive(&self, interval: std::time::Duration) -> Result<std::time::Duration>;

    /// Release the alloc.
    async fn free(&self) -> Result<()>;

    async fn inspect(&self) -> Result<AllocInspect>;
}

/// The scheduler's source of allocs.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Whether `resources` fit on any instance type this cluster can run.
    /// Returns `ResourcesExhausted` naming the largest type otherwise.
    fn can_allocate(&self, resources: &Resources) -> Result<()>;

    /// Reserve an alloc within the requirement boundaries, provisioning new
    /// workers if the live pools cannot serve it.
    async fn allocate(
        &self,
        req: Requirements,
        labels: BTreeMap<String, String>,
    ) -> Result<Arc<dyn Alloc>>;
}

/// Allocate from the live pools: gather offers, pick the smallest one that
/// dominates `req.min` (to reduce over-provisioning), and accept it.
pub async fn allocate_from_pools(
    pools: &[Arc<dyn Pool>],
    req: &Requirements,
    meta: AllocMeta,
) -> Result<Arc<dyn Alloc>> {
    let mut candidates: Vec<(Arc<dyn Pool>, Offer)> = Vec::new();
    for pool in pools {
        match pool.offers().await {
            Ok(offers) => {
                for offer in offers {
                    if offer.resources.available(&req.min) {
                        candidates.push((pool.clone(), offer));
                    }
                }
            }
            Err(err) => {
                tracing::debug!(pool = %pool.id(), error = %err, "offers unavailable");
            }
        }
    }
    candidates.sort_by(|a, b| a.1.resources.cmp_size(&b.1.resources));
    for (pool, offer) in candidates {
        match pool.allocate(&offer.id, meta.clone(), req.min.clone()).await {
            Ok(alloc) => return Ok(alloc),
            Err(err) => {
                // Raced with another allocation; try the next offer.
                tracing::debug!(pool = %pool.id(), offer = %offer.id, error = %err, "offer lost");
            }
        }
    }
    Err(Error::unavailable(format!("no pool can serve {req}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticAlloc {
        id: String,
        resources: Resources,
        repo: Arc<oxbow_core::InmemoryRepository>,
    }

    #[async_trait]
    impl Alloc for StaticAlloc {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn resources(&self) -> Resources {
            self.resources.clone()
        }
        fn repository(&self) -> Arc<dyn Repository> {
            self.repo.clone()
        }
        async fn load(&self, fileset: &Fileset, _src: &dyn Repository) -> Result<Fileset> {
            Ok(fileset.clone())
        }
        async fn unload(&self, _fileset: &Fileset) -> Result<()> {
            Ok(())
        }
        async fn put_exec(&self, _task: Digest, _config: ExecConfig) -> Result<()> {
            Ok(())
        }
        async fn wait_exec(&self, _task: Digest) -> Result<ExecResult> {
            Ok(ExecResult::default())
        }
        async fn keepalive(&self, interval: std::time::Duration) -> Result<std::time::Duration> {
            Ok(interval)
        }
        async fn free(&self) -> Result<()> {
            Ok(())
        }
        async fn inspect(&self) -> Result<AllocInspect> {
            Ok(AllocInspect {
                id: self.id.clone(),
                resources: self.resources.clone(),
                expires: Utc::now(),
                last_keepalive: Utc::now(),
                meta: AllocMeta::default(),
            })
        }
    }

    struct StaticPool {
        id: String,
        offers: Vec<Offer>,
        allocated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Pool for StaticPool {
        fn id(&self) -> String {
            self.id.clone()
        }
        async fn offers(&self) -> Result<Vec<Offer>> {
            Ok(self.offers.clone())
        }
        async fn allocate(
            &self,
            offer_id: &str,
            _meta: AllocMeta,
            resources: Resources,
        ) -> Result<Arc<dyn Alloc>> {
            self.allocated.lock().unwrap().push(offer_id.to_string());
            Ok(Arc::new(StaticAlloc {
                id: format!("{}/{offer_id}", self.id),
                resources,
                repo: Arc::new(oxbow_core::InmemoryRepository::new("alloc")),
            }))
        }
    }

    fn pool(id: &str, offers: Vec<(&str, f64, f64)>) -> Arc<dyn Pool> {
        Arc::new(StaticPool {
            id: id.to_string(),
            offers: offers
                .into_iter()
                .map(|(oid, cpu, mem)| Offer {
                    id: oid.to_string(),
                    resources: Resources::cpu_mem(cpu, mem),
                })
                .collect(),
            allocated: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn picks_the_smallest_dominating_offer() {
        let pools = vec![
            pool("i-big", vec![("o1", 64.0, 256.0)]),
            pool("i-small", vec![("o2", 8.0, 32.0)]),
            pool("i-tiny", vec![("o3", 2.0, 4.0)]),
        ];
        let req = Requirements::narrow(Resources::cpu_mem(4.0, 16.0));
        let alloc = allocate_from_pools(&pools, &req, AllocMeta::default()).await.unwrap();
        assert_eq!(alloc.id(), "i-small/o2");
        assert_eq!(alloc.resources(), req.min);
    }

    #[tokio::test]
    async fn no_dominating_offer_is_unavailable() {
        let pools = vec![pool("i-small", vec![("o1", 2.0, 4.0)])];
        let req = Requirements::narrow(Resources::cpu_mem(16.0, 64.0));
        let err = allocate_from_pools(&pools, &req, AllocMeta::default()).await.unwrap_err();
        assert!(err.is(oxbow_core::ErrorKind::Unavailable));
    }
}
