//! Spot capacity probing
//!
//! Before bidding on spot capacity, the launcher asks the prober whether at
//! least `depth` VMs of the type could currently be had. Probes are
//! expensive (they touch the spot market), so results are memoized for a
//! short window and concurrent callers for the same type share a single
//! in-flight probe.

use futures::future::BoxFuture;
use oxbow_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// The underlying capacity check.
pub type ProbeFn =
    Arc<dyn Fn(String, usize) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

struct Cached {
    at: Instant,
    available: bool,
}

/// Memoizing, single-flight spot capacity prober.
pub struct SpotProber {
    probe: ProbeFn,
    depth: usize,
    window: Duration,
    // Outer lock guards the map; the per-type lock serializes probes of one
    // type so concurrent callers share the first caller's result.
    entries: std::sync::Mutex<HashMap<String, Arc<Mutex<Option<Cached>>>>>,
}

impl SpotProber {
    pub fn new(probe: ProbeFn, depth: usize, window: Duration) -> Self {
        Self { probe, depth: depth.max(1), window, entries: std::sync::Mutex::new(HashMap::new()) }
    }

    /// Whether `instance_type` currently has spot capacity at the probe
    /// depth. Probe failures are reported; memoized results are not.
    pub async fn probe(&self, instance_type: &str) -> Result<bool> {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            entries.entry(instance_type.to_string()).or_default().clone()
        };
        let mut cached = entry.lock().await;
        if let Some(c) = cached.as_ref() {
            if c.at.elapsed() < self.window {
                return Ok(c.available);
            }
        }
        debug!(instance_type, depth = self.depth, "probing spot capacity");
        let available = (self.probe)(instance_type.to_string(), self.depth).await?;
        *cached = Some(Cached { at: Instant::now(), available });
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_prober(window: Duration) -> (Arc<SpotProber>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let prober = SpotProber::new(
            Arc::new(move |_t: String, _d: usize| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
                .boxed()
            }),
            2,
            window,
        );
        (Arc::new(prober), calls)
    }

    #[tokio::test]
    async fn results_are_memoized_per_type() {
        let (prober, calls) = counting_prober(Duration::from_secs(60));
        assert!(prober.probe("c5.2xlarge").await.unwrap());
        assert!(prober.probe("c5.2xlarge").await.unwrap());
        assert!(prober.probe("m5.2xlarge").await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn memoization_expires() {
        let (prober, calls) = counting_prober(Duration::from_millis(10));
        assert!(prober.probe("c5.2xlarge").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(prober.probe("c5.2xlarge").await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_probe() {
        let (prober, calls) = counting_prober(Duration::from_secs(60));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = prober.clone();
            handles.push(tokio::spawn(async move { p.probe("r5.2xlarge").await }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
