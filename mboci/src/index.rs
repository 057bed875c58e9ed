use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use mbblob::BlobRef;
use mbdigest::Digest;

// The bundle index is the manifest's config blob and the authoritative
// catalog of a bundle's files. Its canonical encoding must be byte-stable:
// struct fields are declared in key order and all maps are BTreeMaps, so
// serde_json emits recursively-sorted keys with compact separators. The
// digest of those bytes is the bundle identity.

pub const BUNDLE_INDEX_MEDIA_TYPE: &str = "application/vnd.modelops.bundle.index.v1+json";
pub const INDEX_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Json(#[from] serde_json::Error),
    UnsupportedVersion(String),
    BadPath(String),
    // storage=blob without a blobRef
    MissingBlobRef(String),
    // storage=oci carrying a blobRef
    UnexpectedBlobRef(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Oci,
    Blob,
}

// field order is canonical key order; keep alphabetical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "blobRef")]
    pub blob_ref: Option<BlobRef>,
    pub digest: Digest,
    pub path: String,
    pub size: u64,
    pub storage: StorageKind,
}

impl FileEntry {
    pub fn oci(path: &str, digest: Digest, size: u64) -> FileEntry {
        FileEntry {
            blob_ref: None,
            digest,
            path: path.to_string(),
            size,
            storage: StorageKind::Oci,
        }
    }

    pub fn blob(path: &str, digest: Digest, size: u64, blob_ref: BlobRef) -> FileEntry {
        FileEntry {
            blob_ref: Some(blob_ref),
            digest,
            path: path.to_string(),
            size,
            storage: StorageKind::Blob,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !is_safe_rel_path(&self.path) {
            return Err(Error::BadPath(self.path.clone()));
        }
        match (self.storage, &self.blob_ref) {
            (StorageKind::Blob, None) => Err(Error::MissingBlobRef(self.path.clone())),
            (StorageKind::Oci, Some(_)) => Err(Error::UnexpectedBlobRef(self.path.clone())),
            _ => Ok(()),
        }
    }
}

// field order is canonical key order; keep alphabetical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleIndex {
    pub created: String,
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub version: String,
}

impl BundleIndex {
    pub fn new(entries: impl IntoIterator<Item = FileEntry>) -> BundleIndex {
        BundleIndex {
            created: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            files: entries
                .into_iter()
                .map(|e| (e.path.clone(), e))
                .collect(),
            metadata: BTreeMap::new(),
            version: INDEX_VERSION.to_string(),
        }
    }

    /// Parse and validate a raw config blob.
    pub fn from_slice(data: &[u8]) -> Result<BundleIndex, Error> {
        let index: BundleIndex = serde_json::from_slice(data)?;
        index.validate()?;
        Ok(index)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.version != INDEX_VERSION {
            return Err(Error::UnsupportedVersion(self.version.clone()));
        }
        for (key, entry) in &self.files {
            if *key != entry.path {
                return Err(Error::BadPath(format!(
                    "key {key:?} does not match entry path {:?}",
                    entry.path
                )));
            }
            entry.validate()?;
        }
        Ok(())
    }

    /// Canonical encoding; equal values always produce equal bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("index serialization cannot fail")
    }

    /// The bundle identity: digest of the canonical encoding.
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(self.canonical_bytes())
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }
}

// POSIX relative, forward slashes, nothing that can escape a root
pub fn is_safe_rel_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\\') || path.ends_with('/') {
        return false;
    }
    path.split('/')
        .all(|c| !c.is_empty() && c != "." && c != "..")
}
