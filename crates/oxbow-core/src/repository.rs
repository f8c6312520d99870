//! Content-addressed repositories
//!
//! A [`Repository`] stores immutable blobs keyed by digest. Workers expose
//! one per alloc; the driver process has its own. The optional
//! [`BlobLocator`] capability reports where a blob lives in external blob
//! storage, which enables direct blob-to-blob transfers that bypass allocs
//! entirely.

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::fileset::File;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// A content-addressed blob store.
#[async_trait]
pub trait Repository: Send + Sync {
    /// A URL identifying this repository.
    fn url(&self) -> String;

    /// The size of the blob named by `id`, or `NotExist`.
    async fn stat(&self, id: Digest) -> Result<u64>;

    /// Fetch the blob named by `id`.
    async fn get(&self, id: Digest) -> Result<Vec<u8>>;

    /// Store `data`, returning its digest.
    async fn put(&self, data: Vec<u8>) -> Result<Digest>;

    /// The blob-locating capability, if this repository is backed by
    /// external blob storage.
    fn blob_locator(&self) -> Option<&dyn BlobLocator> {
        None
    }
}

/// Reports the external blob location of repository objects.
pub trait BlobLocator: Send + Sync {
    /// The blob URL for `id`, if known.
    fn location(&self, id: Digest) -> Option<String>;
}

/// The subset of `files` missing from `repo`.
pub async fn missing(repo: &dyn Repository, files: &[File]) -> Result<Vec<File>> {
    let mut out = Vec::new();
    for file in files {
        match repo.stat(file.id).await {
            Ok(_) => {}
            Err(e) if e.is(crate::ErrorKind::NotExist) => out.push(file.clone()),
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// An in-memory repository.
///
/// The reference implementation used by tests and by the in-process side of
/// staging; worker repositories implement the same trait over the wire.
pub struct InmemoryRepository {
    name: String,
    objects: Mutex<HashMap<Digest, Vec<u8>>>,
    locations: Mutex<HashMap<Digest, String>>,
    locating: bool,
}

impl InmemoryRepository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::new(HashMap::new()),
            locations: Mutex::new(HashMap::new()),
            locating: false,
        }
    }

    /// An in-memory repository that also implements [`BlobLocator`].
    pub fn locating(name: impl Into<String>) -> Self {
        Self { locating: true, ..Self::new(name) }
    }

    /// Record the external blob location of `id`.
    pub fn set_location(&self, id: Digest, location: impl Into<String>) {
        self.locations.lock().unwrap().insert(id, location.into());
    }

    /// Drop the blob named by `id`, if present. Collection is the holder's
    /// concern; repositories themselves never expire objects.
    pub fn remove(&self, id: Digest) {
        self.objects.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl Repository for InmemoryRepository {
    fn url(&self) -> String {
        format!("mem://{}", self.name)
    }

    async fn stat(&self, id: Digest) -> Result<u64> {
        self.objects
            .lock()
            .unwrap()
            .get(&id)
            .map(|d| d.len() as u64)
            .ok_or_else(|| Error::not_exist(format!("{}: {}", self.url(), id.short())))
    }

    async fn get(&self, id: Digest) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_exist(format!("{}: {}", self.url(), id.short())))
    }

    async fn put(&self, data: Vec<u8>) -> Result<Digest> {
        let id = Digest::of_bytes(&data);
        self.objects.lock().unwrap().insert(id, data);
        Ok(id)
    }

    fn blob_locator(&self) -> Option<&dyn BlobLocator> {
        self.locating.then_some(self as &dyn BlobLocator)
    }
}

impl BlobLocator for InmemoryRepository {
    fn location(&self, id: Digest) -> Option<String> {
        self.locations.lock().unwrap().get(&id).cloned()
    }
}
