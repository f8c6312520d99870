//! Blob stores and the scheme mux
//!
//! A [`Store`] is a URL-addressed blob backend (one per scheme). The
//! [`Mux`] dispatches operations on full URLs to the store registered for
//! their scheme; an unregistered scheme yields `NotSupported`, which is how
//! the direct-transfer path decides to fall back to alloc-based staging.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A URL-addressed blob store for a single scheme.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store `data` at `url`.
    async fn put(&self, url: &str, data: Vec<u8>) -> Result<()>;

    /// Fetch the blob at `url`.
    async fn get(&self, url: &str) -> Result<Vec<u8>>;

    /// The size of the blob at `url`, or `NotExist`.
    async fn stat(&self, url: &str) -> Result<u64>;

    /// Server-side copy within this store.
    async fn transfer(&self, dst_url: &str, src_url: &str) -> Result<()>;
}

/// The scheme of a URL, e.g. `s3` for `s3://bucket/key`.
pub fn scheme(url: &str) -> Option<&str> {
    url.split_once("://").map(|(s, _)| s)
}

/// Dispatches blob operations by URL scheme.
#[derive(Clone, Default)]
pub struct Mux {
    stores: HashMap<String, Arc<dyn Store>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, scheme: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.stores.insert(scheme.into(), store);
        self
    }

    fn store_for(&self, url: &str) -> Result<&Arc<dyn Store>> {
        let scheme = scheme(url)
            .ok_or_else(|| Error::not_supported(format!("no scheme in url {url:?}")))?;
        self.stores
            .get(scheme)
            .ok_or_else(|| Error::not_supported(format!("scheme {scheme:?} not supported")))
    }

    /// Whether this mux can reach `url`.
    pub fn supports(&self, url: &str) -> bool {
        self.store_for(url).is_ok()
    }

    pub async fn put(&self, url: &str, data: Vec<u8>) -> Result<()> {
        self.store_for(url)?.put(url, data).await
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.store_for(url)?.get(url).await
    }

    pub async fn stat(&self, url: &str) -> Result<u64> {
        self.store_for(url)?.stat(url).await
    }

    /// Copy `src_url` to `dst_url`. Same-scheme copies happen inside the
    /// store; cross-scheme copies are read-then-write.
    pub async fn transfer(&self, dst_url: &str, src_url: &str) -> Result<()> {
        let dst = self.store_for(dst_url)?;
        if scheme(dst_url) == scheme(src_url) {
            return dst.transfer(dst_url, src_url).await;
        }
        let data = self.get(src_url).await?;
        dst.put(dst_url, data).await
    }
}

type ErrHook = Box<dyn Fn() -> Option<Error> + Send + Sync>;

/// An in-memory blob store for tests.
///
/// `maybe_err` (if set) is consulted before every transfer, letting tests
/// inject transient failures.
#[derive(Default)]
pub struct TestStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    maybe_err: Mutex<Option<ErrHook>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook invoked before each transfer; returning `Some` fails
    /// the transfer with that error.
    pub fn set_transfer_err(&self, hook: impl Fn() -> Option<Error> + Send + Sync + 'static) {
        *self.maybe_err.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl Store for TestStore {
    async fn put(&self, url: &str, data: Vec<u8>) -> Result<()> {
        self.objects.lock().unwrap().insert(url.to_string(), data);
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::not_exist(format!("blob {url:?}")))
    }

    async fn stat(&self, url: &str) -> Result<u64> {
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .map(|d| d.len() as u64)
            .ok_or_else(|| Error::not_exist(format!("blob {url:?}")))
    }

    async fn transfer(&self, dst_url: &str, src_url: &str) -> Result<()> {
        if let Some(hook) = self.maybe_err.lock().unwrap().as_ref() {
            if let Some(err) = hook() {
                return Err(err);
            }
        }
        let mut objects = self.objects.lock().unwrap();
        let data = objects
            .get(src_url)
            .cloned()
            .ok_or_else(|| Error::not_exist(format!("blob {src_url:?}")))?;
        objects.insert(dst_url.to_string(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn mux() -> Mux {
        Mux::new().with_store("test", Arc::new(TestStore::new()))
    }

    #[tokio::test]
    async fn unknown_scheme_is_not_supported() {
        let m = mux();
        let err = m.get("other://bucket/key").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(!m.supports("other://x"));
        assert!(m.supports("test://x"));
    }

    #[tokio::test]
    async fn transfer_copies_within_a_store() {
        let m = mux();
        m.put("test://in/a", b"payload".to_vec()).await.unwrap();
        m.transfer("test://out/a", "test://in/a").await.unwrap();
        assert_eq!(m.get("test://out/a").await.unwrap(), b"payload");
        assert_eq!(m.stat("test://out/a").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn injected_errors_fail_transfers() {
        let store = Arc::new(TestStore::new());
        store.set_transfer_err(|| Some(Error::temporary("flaky")));
        let m = Mux::new().with_store("test", store.clone());
        m.put("test://in/a", b"x".to_vec()).await.unwrap();
        let err = m.transfer("test://out/a", "test://in/a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Temporary);
    }
}
