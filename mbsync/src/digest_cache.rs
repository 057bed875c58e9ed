use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use mbcas::fsutil::atomic_write;
use mbdigest::Digest;

pub const DIGEST_CACHE_FILE: &str = "digests.json";

// Scanning rehashes every tracked file, which hurts on big data directories.
// A digest is reusable as long as (size, mtime_ns, inode) are all unchanged;
// any edit, replace, or touch invalidates the entry. Entries are advisory:
// a missing or corrupt cache file just means everything gets rehashed.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    size: u64,
    mtime_ns: i64,
    inode: u64,
    digest: Digest,
}

#[derive(Debug, Default)]
pub struct DigestCache {
    path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
    dirty: bool,
}

impl DigestCache {
    pub fn load(path: &Path) -> DigestCache {
        let entries = match std::fs::read(path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("digest cache {:?} unreadable, starting fresh: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        DigestCache {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rel_path: &str, meta: &std::fs::Metadata) -> Option<Digest> {
        let entry = self.entries.get(rel_path)?;
        if entry.size == meta.len()
            && entry.mtime_ns == mtime_ns_of(meta)
            && entry.inode == inode_of(meta)
        {
            Some(entry.digest)
        } else {
            None
        }
    }

    pub fn insert(&mut self, rel_path: &str, meta: &std::fs::Metadata, digest: Digest) {
        let entry = CacheEntry {
            size: meta.len(),
            mtime_ns: mtime_ns_of(meta),
            inode: inode_of(meta),
            digest,
        };
        if self.entries.get(rel_path) != Some(&entry) {
            self.entries.insert(rel_path.to_string(), entry);
            self.dirty = true;
        }
    }

    /// Drop entries whose file no longer exists under `root`.
    pub fn clear_stale(&mut self, root: &Path) {
        let before = self.entries.len();
        self.entries.retain(|rel_path, _| root.join(rel_path).exists());
        if self.entries.len() != before {
            self.dirty = true;
            debug!("dropped {} stale digest cache entries", before - self.entries.len());
        }
    }

    /// Persist if anything changed since load; atomic like every other state
    /// file.
    pub fn save(&mut self) -> std::io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        atomic_write(&self.path, &serde_json::to_vec_pretty(&self.entries)?)?;
        self.dirty = false;
        Ok(())
    }
}

fn mtime_ns_of(meta: &std::fs::Metadata) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
    }
    #[cfg(not(unix))]
    {
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

fn inode_of(meta: &std::fs::Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0
    }
}
