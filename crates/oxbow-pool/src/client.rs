//! HTTPS client for the skiff worker API
//!
//! Thin wrapper over one worker's `/v1/` surface (port 9000, mutual TLS;
//! the authenticated transport is supplied by the embedder via a configured
//! `reqwest::Client`). Transport and status failures are translated into the
//! oxbow error taxonomy at this boundary.

use crate::{Alloc, AllocInspect, AllocMeta, Offer, Pool};
use async_trait::async_trait;
use oxbow_core::{Digest, Error, ErrorKind, ExecConfig, ExecResult, Fileset, Repository, Resources, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A client for one worker's pool API.
pub struct PoolClient {
    instance_id: String,
    base: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct AllocateRequest<'a> {
    meta: &'a AllocMeta,
    resources: &'a Resources,
}

#[derive(Deserialize)]
struct AllocateReply {
    alloc_id: String,
    resources: Resources,
}

#[derive(Serialize)]
struct KeepaliveRequest {
    interval_secs: u64,
}

#[derive(Deserialize)]
struct KeepaliveReply {
    interval_secs: u64,
}

#[derive(Serialize)]
struct LoadRequest<'a> {
    fileset: &'a Fileset,
    src: String,
}

#[derive(Serialize)]
struct UnloadRequest<'a> {
    fileset: &'a Fileset,
}

#[derive(Deserialize)]
struct WireError {
    kind: ErrorKind,
    message: String,
}

#[derive(Deserialize)]
struct WaitReply {
    fileset: Fileset,
    #[serde(default)]
    error: Option<WireError>,
}

impl PoolClient {
    /// A client for the worker at `dns`, e.g. `https://{dns}:9000/v1/`.
    pub fn new(instance_id: impl Into<String>, dns: &str, http: reqwest::Client) -> Self {
        Self {
            instance_id: instance_id.into(),
            base: format!("https://{dns}:9000/v1"),
            http,
        }
    }

    /// A client against an explicit base URL (tests, port-forwarded agents).
    pub fn with_base(instance_id: impl Into<String>, base: impl Into<String>, http: reqwest::Client) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self { instance_id: instance_id.into(), base, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(self.url(path)).send().await.map_err(transport_error)?;
        decode(resp).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    resp.json().await.map_err(|e| Error::other(format!("decode response: {e}")))
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::temporary(format!("request timed out: {err}"))
    } else {
        Error::network(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    let kind = match status {
        StatusCode::NOT_FOUND => ErrorKind::NotExist,
        StatusCode::NOT_IMPLEMENTED => ErrorKind::NotSupported,
        StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Unavailable,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::Temporary,
        s if s.is_server_error() => ErrorKind::Temporary,
        _ => ErrorKind::Other,
    };
    Error::new(kind, format!("{status}: {body}"))
}

#[async_trait]
impl Pool for PoolClient {
    fn id(&self) -> String {
        self.instance_id.clone()
    }

    async fn offers(&self) -> Result<Vec<Offer>> {
        self.get_json("offers").await
    }

    async fn allocate(
        &self,
        offer_id: &str,
        meta: AllocMeta,
        resources: Resources,
    ) -> Result<Arc<dyn Alloc>> {
        let reply: AllocateReply = self
            .post_json(
                &format!("offers/{offer_id}/allocate"),
                &AllocateRequest { meta: &meta, resources: &resources },
            )
            .await?;
        Ok(Arc::new(ClientAlloc {
            client: PoolClient {
                instance_id: self.instance_id.clone(),
                base: self.base.clone(),
                http: self.http.clone(),
            },
            alloc_id: reply.alloc_id,
            resources: reply.resources,
        }))
    }
}

/// An alloc reached over the worker's HTTPS API.
pub struct ClientAlloc {
    client: PoolClient,
    alloc_id: String,
    resources: Resources,
}

#[async_trait]
impl Alloc for ClientAlloc {
    fn id(&self) -> String {
        format!("{}/{}", self.client.instance_id, self.alloc_id)
    }

    fn resources(&self) -> Resources {
        self.resources.clone()
    }

    fn repository(&self) -> Arc<dyn Repository> {
        Arc::new(HttpRepository {
            base: format!("{}/allocs/{}/repo", self.client.base, self.alloc_id),
            http: self.client.http.clone(),
        })
    }

    async fn load(&self, fileset: &Fileset, src: &dyn Repository) -> Result<Fileset> {
        self.client
            .post_json(
                &format!("allocs/{}/load", self.alloc_id),
                &LoadRequest { fileset, src: src.url() },
            )
            .await
    }

    async fn unload(&self, fileset: &Fileset) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post_json(&format!("allocs/{}/unload", self.alloc_id), &UnloadRequest { fileset })
            .await?;
        Ok(())
    }

    async fn put_exec(&self, task: Digest, config: ExecConfig) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post_json(&format!("allocs/{}/exec/{task}", self.alloc_id), &config)
            .await?;
        Ok(())
    }

    async fn wait_exec(&self, task: Digest) -> Result<ExecResult> {
        let reply: WaitReply = self
            .client
            .get_json(&format!("allocs/{}/exec/{task}/wait", self.alloc_id))
            .await?;
        Ok(ExecResult {
            fileset: reply.fileset,
            err: reply.error.map(|e| Error::new(e.kind, e.message)),
        })
    }

    async fn keepalive(&self, interval: Duration) -> Result<Duration> {
        let reply: KeepaliveReply = self
            .client
            .post_json(
                &format!("allocs/{}/keepalive", self.alloc_id),
                &KeepaliveRequest { interval_secs: interval.as_secs() },
            )
            .await?;
        Ok(Duration::from_secs(reply.interval_secs))
    }

    async fn free(&self) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post_json(&format!("allocs/{}/free", self.alloc_id), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn inspect(&self) -> Result<AllocInspect> {
        self.client.get_json(&format!("allocs/{}", self.alloc_id)).await
    }
}

/// A worker repository reached over the same port.
pub struct HttpRepository {
    base: String,
    http: reqwest::Client,
}

#[async_trait]
impl Repository for HttpRepository {
    fn url(&self) -> String {
        self.base.clone()
    }

    async fn stat(&self, id: Digest) -> Result<u64> {
        let resp = self
            .http
            .head(format!("{}/{id}", self.base))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, ""));
        }
        resp.content_length()
            .ok_or_else(|| Error::other(format!("no content length for {}", id.short())))
    }

    async fn get(&self, id: Digest) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(format!("{}/{id}", self.base))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, ""));
        }
        Ok(resp.bytes().await.map_err(transport_error)?.to_vec())
    }

    async fn put(&self, data: Vec<u8>) -> Result<Digest> {
        #[derive(Deserialize)]
        struct PutReply {
            id: Digest,
        }
        let resp = self
            .http
            .post(self.base.clone())
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;
        let reply: PutReply = decode(resp).await?;
        Ok(reply.id)
    }
}
