//! Alloc keepalive driving
//!
//! Each live alloc gets one keepalive task extending its lease on a cadence.
//! Failures are retried with backoff; once the policy is exhausted (or a
//! non-retryable error arrives) the loop reports the error and the scheduler
//! treats every task on the alloc as lost. A `Canceled` keepalive is treated
//! like any other failure here; an intentional free happens only after the
//! alloc is drained, so the conflation is harmless.

use crate::Alloc;
use oxbow_core::retry::RetryPolicy;
use oxbow_core::{Error, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cadence and retry policy for keepalives.
#[derive(Debug, Clone)]
pub struct KeepalivePolicy {
    /// The lease interval requested from the worker.
    pub interval: Duration,
    /// Retry policy for failed keepalive calls.
    pub retry: RetryPolicy,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retry: RetryPolicy::exponential(
                Duration::from_millis(500),
                Duration::from_secs(10),
                1.5,
            )
            .with_max_tries(5)
            .with_jitter(0.2),
        }
    }
}

/// Drive keepalives for `alloc` until one fails for good; returns the error
/// that ended the lease.
pub async fn keepalive_loop(alloc: Arc<dyn Alloc>, policy: KeepalivePolicy) -> Error {
    let mut attempt = 0usize;
    loop {
        match alloc.keepalive(policy.interval).await {
            Ok(granted) => {
                attempt = 0;
                // Renew at half the granted interval so one failed round
                // trip does not expire the lease.
                let next = granted.min(policy.interval) / 2;
                tokio::time::sleep(next.max(Duration::from_millis(100))).await;
            }
            Err(err) if matches!(err.kind(), ErrorKind::Fatal | ErrorKind::Canceled) => {
                debug!(alloc = %alloc.id(), error = %err, "keepalive ended");
                return err;
            }
            Err(err) => match policy.retry.wait(attempt) {
                Some(wait) => {
                    debug!(alloc = %alloc.id(), error = %err, attempt, "keepalive retry");
                    attempt += 1;
                    tokio::time::sleep(wait).await;
                }
                None => {
                    debug!(alloc = %alloc.id(), error = %err, "keepalive gave up");
                    return err;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use oxbow_core::{Digest, ExecConfig, ExecResult, Fileset, Repository, Resources, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlakyAlloc {
        oks: AtomicUsize,
        err: Mutex<Error>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Alloc for FlakyAlloc {
        fn id(&self) -> String {
            "test".into()
        }
        fn resources(&self) -> Resources {
            Resources::new()
        }
        fn repository(&self) -> Arc<dyn Repository> {
            Arc::new(oxbow_core::InmemoryRepository::new("x"))
        }
        async fn load(&self, fs: &Fileset, _src: &dyn Repository) -> Result<Fileset> {
            Ok(fs.clone())
        }
        async fn unload(&self, _fs: &Fileset) -> Result<()> {
            Ok(())
        }
        async fn put_exec(&self, _task: Digest, _config: ExecConfig) -> Result<()> {
            Ok(())
        }
        async fn wait_exec(&self, _task: Digest) -> Result<ExecResult> {
            Ok(ExecResult::default())
        }
        async fn keepalive(&self, interval: Duration) -> Result<Duration> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.oks.load(Ordering::SeqCst) {
                Ok(interval)
            } else {
                Err(self.err.lock().unwrap().clone())
            }
        }
        async fn free(&self) -> Result<()> {
            Ok(())
        }
        async fn inspect(&self) -> Result<crate::AllocInspect> {
            Ok(crate::AllocInspect {
                id: "test".into(),
                resources: Resources::new(),
                expires: Utc::now(),
                last_keepalive: Utc::now(),
                meta: crate::AllocMeta::default(),
            })
        }
    }

    fn policy() -> KeepalivePolicy {
        KeepalivePolicy {
            interval: Duration::from_millis(20),
            retry: RetryPolicy::exponential(
                Duration::from_millis(1),
                Duration::from_millis(5),
                1.5,
            )
            .with_max_tries(3),
        }
    }

    #[tokio::test]
    async fn fatal_errors_end_the_lease_immediately() {
        let alloc = Arc::new(FlakyAlloc {
            oks: AtomicUsize::new(2),
            err: Mutex::new(Error::fatal("alloc failed")),
            calls: AtomicUsize::new(0),
        });
        let err = keepalive_loop(alloc.clone(), policy()).await;
        assert!(err.is(ErrorKind::Fatal));
        assert_eq!(alloc.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_then_reported() {
        let alloc = Arc::new(FlakyAlloc {
            oks: AtomicUsize::new(0),
            err: Mutex::new(Error::temporary("blip")),
            calls: AtomicUsize::new(0),
        });
        let err = keepalive_loop(alloc.clone(), policy()).await;
        assert!(err.is(ErrorKind::Temporary));
        // Initial call plus max_tries retries.
        assert_eq!(alloc.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn canceled_is_reported_like_a_failure() {
        let alloc = Arc::new(FlakyAlloc {
            oks: AtomicUsize::new(0),
            err: Mutex::new(Error::canceled("alloc canceled")),
            calls: AtomicUsize::new(0),
        });
        let err = keepalive_loop(alloc, policy()).await;
        assert!(err.is(ErrorKind::Canceled));
    }
}
