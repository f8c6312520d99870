//! Files and filesets

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A content-addressed file reference.
///
/// A file is *resolved* when its id is a real digest. An unresolved file
/// (zero id) carries a `source` URL naming where the content can be fetched
/// from; resolution happens when the file is loaded into a repository or
/// transferred directly between blob stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl File {
    pub fn resolved(id: Digest, size: u64) -> Self {
        Self { id, size, source: None }
    }

    pub fn reference(source: impl Into<String>) -> Self {
        Self { id: Digest::zero(), size: 0, source: Some(source.into()) }
    }

    pub fn is_resolved(&self) -> bool {
        !self.id.is_zero()
    }
}

/// A map of logical names to content-addressed files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fileset {
    pub map: BTreeMap<String, File>,
}

impl Fileset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, file: File) {
        self.map.insert(name.into(), file);
    }

    pub fn files(&self) -> Vec<File> {
        self.map.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total size of all files in bytes.
    pub fn size(&self) -> u64 {
        self.map.values().map(|f| f.size).sum()
    }
}

impl FromIterator<(String, File)> for Fileset {
    fn from_iter<T: IntoIterator<Item = (String, File)>>(iter: T) -> Self {
        Self { map: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_sums_files() {
        let mut fs = Fileset::new();
        fs.insert("a", File::resolved(Digest::of_bytes(b"a"), 10));
        fs.insert("b", File::resolved(Digest::of_bytes(b"b"), 32));
        assert_eq!(fs.size(), 42);
        assert_eq!(fs.len(), 2);
    }

    #[test]
    fn references_are_unresolved() {
        let f = File::reference("s3://bucket/key");
        assert!(!f.is_resolved());
        assert!(File::resolved(Digest::of_bytes(b"x"), 1).is_resolved());
    }
}
