//! Rate and batch limiters
//!
//! Cloud-provider calls are throttled two ways: a token-bucket
//! [`RateLimiter`] bounds calls per second, and a [`BatchLimiter`] coalesces
//! concurrent keyed requests (e.g. describe-instance-status by instance id)
//! into batched calls behind a rate limiter.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// A token-bucket rate limiter.
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// A limiter allowing `qps` operations per second with bursts of up to
    /// `burst` tokens.
    pub fn new(qps: f64, burst: usize) -> Self {
        let burst = (burst.max(1)) as f64;
        Self { qps, burst, state: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    /// Wait until a token is available and consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut b = self.state.lock().unwrap();
                let now = Instant::now();
                b.tokens =
                    (b.tokens + now.duration_since(b.last).as_secs_f64() * self.qps).min(self.burst);
                b.last = now;
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - b.tokens) / self.qps))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// The batched call underlying a [`BatchLimiter`]: given up to
/// `max_per_batch` keys, return a value per key. Keys absent from the result
/// resolve to `NotExist` for their callers.
pub type BatchFn<K, V> =
    Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, Result<HashMap<K, V>>> + Send + Sync>;

/// Coalesces concurrent keyed calls into rate-limited batches.
///
/// Callers enqueue their key and one of them drives the flush loop; every
/// caller sharing a batch receives its own slice of the batched result.
pub struct BatchLimiter<K, V> {
    run: BatchFn<K, V>,
    max_per_batch: usize,
    limiter: RateLimiter,
    queue: Mutex<VecDeque<(K, oneshot::Sender<Result<V>>)>>,
    flushing: AtomicBool,
}

impl<K, V> BatchLimiter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_per_batch: usize, qps: f64, run: BatchFn<K, V>) -> Self {
        Self {
            run,
            max_per_batch: max_per_batch.max(1),
            limiter: RateLimiter::new(qps, 1),
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
        }
    }

    /// Resolve `key` through a (possibly shared) batched call.
    pub async fn call(&self, key: K) -> Result<V> {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().unwrap().push_back((key, tx));
        if self.try_become_flusher() {
            self.flush().await;
        }
        rx.await.unwrap_or_else(|_| Err(Error::canceled("batch call dropped")))
    }

    fn try_become_flusher(&self) -> bool {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn flush(&self) {
        loop {
            let batch: Vec<(K, oneshot::Sender<Result<V>>)> = {
                let mut q = self.queue.lock().unwrap();
                let n = q.len().min(self.max_per_batch);
                q.drain(..n).collect()
            };
            if batch.is_empty() {
                self.flushing.store(false, Ordering::Release);
                // A producer may have enqueued between the drain and the
                // release; only one racer reacquires the flag.
                if self.queue.lock().unwrap().is_empty() || !self.try_become_flusher() {
                    return;
                }
                continue;
            }
            self.limiter.acquire().await;
            let mut keys: Vec<K> = Vec::new();
            for (k, _) in &batch {
                if !keys.contains(k) {
                    keys.push(k.clone());
                }
            }
            match (self.run)(keys).await {
                Ok(values) => {
                    for (key, tx) in batch {
                        let v = values
                            .get(&key)
                            .cloned()
                            .ok_or_else(|| Error::not_exist(format!("batch key {key:?}")));
                        let _ = tx.send(v);
                    }
                }
                Err(err) => {
                    for (_, tx) in batch {
                        let _ = tx.send(Err(err.clone()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_out_calls() {
        let lim = Arc::new(RateLimiter::new(2.0, 1));
        let start = tokio::time::Instant::now();
        for _ in 0..4 {
            lim.acquire().await;
        }
        // 1 burst token + 3 at 2 qps => at least 1.5s of virtual time.
        assert!(start.elapsed() >= Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn batches_coalesce_concurrent_callers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let lim: Arc<BatchLimiter<u32, u32>> = Arc::new(BatchLimiter::new(
            10,
            1000.0,
            Arc::new(move |keys: Vec<u32>| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async move { Ok(keys.into_iter().map(|k| (k, k * 2)).collect()) }.boxed()
            }),
        ));
        let mut handles = Vec::new();
        for i in 0..20u32 {
            let lim = lim.clone();
            handles.push(tokio::spawn(async move { lim.call(i).await }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap().unwrap(), (i as u32) * 2);
        }
        // Far fewer underlying calls than callers.
        assert!(calls.load(Ordering::SeqCst) <= 20);
    }

    #[tokio::test]
    async fn missing_keys_resolve_to_not_exist() {
        let lim: Arc<BatchLimiter<u32, u32>> = Arc::new(BatchLimiter::new(
            10,
            1000.0,
            Arc::new(|_keys: Vec<u32>| async move { Ok(HashMap::new()) }.boxed()),
        ));
        let err = lim.call(7).await.unwrap_err();
        assert!(err.is(crate::ErrorKind::NotExist));
    }
}
