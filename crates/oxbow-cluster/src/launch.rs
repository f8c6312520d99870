//! Single-VM bring-up
//!
//! A [`Launcher`] drives one instance from request to agent readiness:
//!
//! ```text
//! selecting -> requesting -> awaiting-agent -> ready | failed
//! ```
//!
//! Spot launches consult the capacity prober first and fall back to
//! on-demand within the same attempt. If a VM was created and the launcher
//! nonetheless fails, the VM is terminated before the error is returned.

use crate::ec2::{Ec2Ops, LaunchSpec, ManagedInstance, VmState};
use crate::probe::SpotProber;
use oxbow_core::limiter::{BatchLimiter, RateLimiter};
use oxbow_core::{Error, ErrorKind, Resources, Result};
use oxbow_pool::client::PoolClient;
use oxbow_pool::Pool as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Process-wide bootstrap image check, run once and memoized.
pub type BootstrapCheck = Arc<OnceCell<std::result::Result<(), Error>>>;

/// Orchestrates one VM launch.
pub struct Launcher {
    pub spec: LaunchSpec,
    pub bootstrap_image: String,
    pub bootstrap_expiry: Duration,
    pub poll_interval: Duration,
    pub ec2: Arc<dyn Ec2Ops>,
    pub http: reqwest::Client,
    pub prober: Arc<SpotProber>,
    pub desc_inst: Arc<BatchLimiter<String, ManagedInstance>>,
    pub desc_spot: Arc<BatchLimiter<String, crate::ec2::SpotRequestStatus>>,
    pub submit_limiter: Arc<RateLimiter>,
    pub bootstrap_check: BootstrapCheck,
    /// Overrides the agent base URL derived from the instance DNS name
    /// (port-forwarded agents, tests).
    pub agent_base: Option<String>,
}

impl Launcher {
    /// Bring up one instance and wait for its agent, returning the running
    /// instance and the resource vector its first offer advertises (which
    /// may differ slightly from the catalog).
    pub async fn launch(&self) -> Result<(ManagedInstance, Resources)> {
        let instance_type = self.spec.config.instance_type.clone();

        // Selecting: decide spot vs on-demand.
        let mut spot = self.spec.spot;
        if spot {
            match self.prober.probe(&instance_type).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(%instance_type, "spot capacity unavailable, falling back to on-demand");
                    spot = false;
                }
                Err(err) => {
                    warn!(%instance_type, error = %err, "spot probe failed, falling back to on-demand");
                    spot = false;
                }
            }
        }

        self.ensure_bootstrap().await?;

        let deadline = Instant::now() + self.bootstrap_expiry;

        // Requesting.
        self.submit_limiter.acquire().await;
        let mut spec = self.spec.clone();
        spec.spot = spot;
        let instance_id = if spot {
            match self.submit_spot(&spec, deadline).await {
                Ok(id) => id,
                Err(err) if err.is(ErrorKind::Unavailable) => {
                    // In-attempt fallback: the same launch retries on-demand.
                    info!(%instance_type, error = %err, "spot request unavailable, falling back to on-demand");
                    self.submit_limiter.acquire().await;
                    spec.spot = false;
                    self.ec2.run_instance(&spec).await?
                }
                Err(err) => return Err(err),
            }
        } else {
            self.ec2.run_instance(&spec).await?
        };
        info!(instance_id = %instance_id, %instance_type, spot = spec.spot, "instance requested");

        // Awaiting agent. From here on a VM exists: terminate it on any
        // failure before returning.
        match self.await_agent(&instance_id, deadline).await {
            Ok(ready) => Ok(ready),
            Err(err) => {
                if let Err(terr) = self.ec2.terminate_instance(&instance_id).await {
                    warn!(instance_id = %instance_id, error = %terr, "terminate after failed launch");
                }
                Err(err)
            }
        }
    }

    /// Submit a spot request and poll it (batched) until an instance is
    /// assigned. The request is canceled on every failure path.
    async fn submit_spot(&self, spec: &LaunchSpec, deadline: Instant) -> Result<String> {
        let request_id = self.ec2.request_spot_instance(spec).await?;
        debug!(request_id = %request_id, "spot request submitted");
        loop {
            let status = self.desc_spot.call(request_id.clone()).await?;
            if let Some(instance_id) = status.instance_id {
                // Spot launch specs cannot carry tags; apply them now.
                self.ec2.create_tags(&instance_id, &spec.tags).await?;
                return Ok(instance_id);
            }
            if status.unavailable() {
                let _ = self.ec2.cancel_spot_requests(vec![request_id.clone()]).await;
                return Err(Error::unavailable(format!(
                    "spot request {request_id}: {}",
                    status.status_code
                )));
            }
            if Instant::now() >= deadline {
                let _ = self.ec2.cancel_spot_requests(vec![request_id.clone()]).await;
                return Err(Error::unavailable(format!(
                    "spot request {request_id} unfulfilled before deadline"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll the instance (batched describes) until it is running with a DNS
    /// name, then confirm the agent answers its offers endpoint.
    async fn await_agent(&self, instance_id: &str, deadline: Instant) -> Result<(ManagedInstance, Resources)> {
        let instance = loop {
            let instance = self.desc_inst.call(instance_id.to_string()).await?;
            if instance.running_with_dns() {
                break instance;
            }
            if matches!(instance.state, VmState::Terminated | VmState::ShuttingDown) {
                return Err(Error::unavailable(format!(
                    "instance {instance_id} terminated during bring-up"
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::temporary(format!(
                    "instance {instance_id} not running before bootstrap deadline"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let dns = instance.public_dns.clone().unwrap_or_default();
        let client = match &self.agent_base {
            Some(base) => PoolClient::with_base(instance_id, base.clone(), self.http.clone()),
            None => PoolClient::new(instance_id, &dns, self.http.clone()),
        };
        loop {
            match client.offers().await {
                Ok(offers) if !offers.is_empty() => {
                    debug!(instance_id, offers = offers.len(), "agent ready");
                    return Ok((instance, offers[0].resources.clone()));
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(instance_id, error = %err, "agent not ready");
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::temporary(format!(
                    "agent on {instance_id} not ready before bootstrap deadline"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ensure_bootstrap(&self) -> Result<()> {
        let image = self.bootstrap_image.clone();
        let http = self.http.clone();
        self.bootstrap_check
            .get_or_init(|| async move { validate_bootstrap(&http, &image).await })
            .await
            .clone()
    }
}

/// Validate the bootstrap image URL: https scheme, HEAD answers 200 with
/// `binary/octet-stream`. Failures are fatal; a misconfigured bootstrap
/// would brick every instance we launch.
pub(crate) async fn validate_bootstrap(http: &reqwest::Client, url: &str) -> std::result::Result<(), Error> {
    if !url.starts_with("https://") {
        return Err(Error::fatal(format!("bootstrap image {url}: scheme not supported")));
    }
    let resp = http
        .head(url)
        .send()
        .await
        .map_err(|e| Error::fatal(format!("bootstrap image {url}: {e}")))?;
    if resp.status() != reqwest::StatusCode::OK {
        return Err(Error::fatal(format!("bootstrap image {url}: HEAD {}", resp.status())));
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "binary/octet-stream" {
        return Err(Error::fatal(format!(
            "bootstrap image {url}: content type {content_type:?} not supported"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_must_be_https() {
        let http = reqwest::Client::new();
        let err = validate_bootstrap(&http, "http://example.com/bootstrap").await.unwrap_err();
        assert!(err.is(ErrorKind::Fatal));
    }
}
