use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use oci_spec::distribution::Reference;

use mbcas::lock::{DEFAULT_LOCK_TIMEOUT, FileLock};
use mbcas::{Cas, LinkMode, fsutil::atomic_write};
use mbdigest::Digest;

use crate::dist::{self, Client};
use crate::index::{BundleIndex, StorageKind};

// Worker-side cache layer on top of the distribution client: given a bundle
// reference, produce a complete, verified directory on local disk. The same
// digest may be requested by many processes at once; a per-digest lock plus a
// `.complete` marker make reuse safe and crash recovery deterministic. A
// directory without its marker is a crash remnant and is rebuilt.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Dist(#[from] dist::Error),
    Cas(#[from] mbcas::Error),
    Io(#[from] std::io::Error),
    BadBundleRef(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How bundle directories are named under `<cache>/bundles/`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CacheNaming {
    /// First 12 hex chars, docker style.
    #[default]
    DigestShort,
    /// The full 64 hex chars.
    DigestFull,
    /// `ab/cd/<rest>`, git style.
    DigestNested,
}

/// Parse `sha256:<hex>` or `<repository>@sha256:<hex>`.
pub fn parse_bundle_ref(bundle_ref: &str) -> Result<(Option<&str>, Digest), Error> {
    let (repository, digest_part) = match bundle_ref.split_once('@') {
        Some((repository, digest_part)) => (Some(repository), digest_part),
        None => (None, bundle_ref),
    };
    if !digest_part.starts_with("sha256:") {
        return Err(Error::BadBundleRef(format!(
            "expected sha256:<hex> or repository@sha256:<hex>, got {bundle_ref:?}"
        )));
    }
    let digest = digest_part
        .parse()
        .map_err(|_| Error::BadBundleRef(bundle_ref.to_string()))?;
    Ok((repository, digest))
}

pub struct BundleRepo {
    registry_ref: String,
    client: Client,
    cas: Cas,
    bundles_dir: PathBuf,
    indexes_dir: PathBuf,
    locks_dir: PathBuf,
    naming: CacheNaming,
    link_mode: LinkMode,
}

impl BundleRepo {
    pub fn new(registry_ref: &str, cache_dir: &Path, client: Client) -> Result<BundleRepo, Error> {
        let bundles_dir = cache_dir.join("bundles");
        let indexes_dir = cache_dir.join("indexes");
        let locks_dir = cache_dir.join("locks");
        for dir in [&bundles_dir, &indexes_dir, &locks_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(BundleRepo {
            registry_ref: registry_ref.to_string(),
            client,
            cas: Cas::open(cache_dir)?,
            bundles_dir,
            indexes_dir,
            locks_dir,
            naming: CacheNaming::default(),
            link_mode: LinkMode::Auto,
        })
    }

    pub fn with_naming(mut self, naming: CacheNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_link_mode(mut self, link_mode: LinkMode) -> Self {
        self.link_mode = link_mode;
        self
    }

    pub fn cas(&self) -> &Cas {
        &self.cas
    }

    fn bundle_dir_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        match self.naming {
            CacheNaming::DigestShort => self.bundles_dir.join(&hex[..12]),
            CacheNaming::DigestFull => self.bundles_dir.join(&hex),
            CacheNaming::DigestNested => self
                .bundles_dir
                .join(&hex[..2])
                .join(&hex[2..4])
                .join(&hex[4..]),
        }
    }

    fn index_path_for(&self, digest: &Digest) -> PathBuf {
        self.indexes_dir.join(format!("{}.json", digest.hex()))
    }

    /// Ensure the bundle is fully materialized locally; returns its digest
    /// and directory. Safe against concurrent callers for the same digest.
    pub async fn ensure_local(&self, bundle_ref: &str) -> Result<(Digest, PathBuf), Error> {
        let (repository, digest) = parse_bundle_ref(bundle_ref)?;
        let effective = match repository {
            Some(repository) => format!("{}/{}", self.registry_ref, repository),
            None => self.registry_ref.clone(),
        };
        let reference: Reference = format!("{effective}@{digest}")
            .parse()
            .map_err(|e| Error::BadBundleRef(format!("{effective}@{digest}: {e}")))?;

        let bundle_dir = self.bundle_dir_for(&digest);
        let marker = bundle_dir.join(".complete");
        let lock_path = self.locks_dir.join(format!("{}.lock", digest.hex()));

        let lock = tokio::task::spawn_blocking(move || {
            FileLock::acquire(&lock_path, DEFAULT_LOCK_TIMEOUT)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        // the marker is the only thing that makes a directory reusable
        if bundle_dir.exists() && marker.exists() {
            debug!("bundle {} already complete", digest.short());
            drop(lock);
            return Ok((digest, bundle_dir));
        }
        if bundle_dir.exists() {
            warn!(
                "removing incomplete bundle directory {:?} (crash remnant)",
                bundle_dir
            );
            std::fs::remove_dir_all(&bundle_dir)?;
        }
        std::fs::create_dir_all(&bundle_dir)?;

        match self.populate(&reference, &digest, &bundle_dir).await {
            Ok(()) => {
                atomic_write(&marker, b"ok")?;
                drop(lock);
                Ok((digest, bundle_dir))
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&bundle_dir);
                drop(lock);
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        reference: &Reference,
        digest: &Digest,
        bundle_dir: &Path,
    ) -> Result<(), Error> {
        if let Some(index) = self.load_cached_index(digest) {
            if self.can_materialize_from_cache(&index) {
                debug!("materializing bundle {} from cas", digest.short());
                for entry in index.files.values() {
                    self.cas.materialize(
                        &entry.digest,
                        &bundle_dir.join(&entry.path),
                        self.link_mode,
                        false,
                    )?;
                }
                return Ok(());
            }
        }

        info!("pulling bundle {} from {}", digest.short(), reference);
        let index = self.client.get_index(reference).await?;
        atomic_write(&self.index_path_for(digest), &index.canonical_bytes())?;

        let entries: Vec<_> = index.files.values().cloned().collect();
        if entries.iter().any(|e| e.storage == StorageKind::Blob) {
            warn!(
                "bundle {} contains blob-storage entries; workers pull OCI content only",
                digest.short()
            );
        }
        self.client
            .pull_selected(
                reference,
                &entries,
                bundle_dir,
                None,
                Some(&self.cas),
                self.link_mode,
            )
            .await?;
        Ok(())
    }

    fn load_cached_index(&self, digest: &Digest) -> Option<BundleIndex> {
        let path = self.index_path_for(digest);
        let data = std::fs::read(&path).ok()?;
        match BundleIndex::from_slice(&data) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("cached index {:?} is unusable: {}", path, e);
                None
            }
        }
    }

    // the zero-network path: every entry an OCI layer we already hold
    fn can_materialize_from_cache(&self, index: &BundleIndex) -> bool {
        index
            .files
            .values()
            .all(|e| e.storage == StorageKind::Oci && self.cas.has(&e.digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileEntry;

    fn test_repo(cache: &Path) -> BundleRepo {
        let client = Client::builder().insecure(true).build().unwrap();
        BundleRepo::new("localhost:5000/org/models", cache, client).unwrap()
    }

    async fn seed(cas: &Cas, content: &str) -> FileEntry {
        let digest = Digest::from_bytes(content);
        let bytes = content.as_bytes().to_vec();
        cas.ensure_present(&digest, |tmp| {
            let bytes = bytes.clone();
            async move {
                std::fs::write(&tmp, &bytes)?;
                Ok(())
            }
        })
        .await
        .unwrap();
        FileEntry::oci(
            &format!("files/{content}.txt"),
            digest,
            content.len() as u64,
        )
    }

    #[test]
    fn test_parse_bundle_ref() {
        let d = Digest::from_bytes("x");
        let d_str = d.to_string();
        let (repository, parsed) = parse_bundle_ref(&d_str).unwrap();
        assert!(repository.is_none());
        assert_eq!(parsed, d);

        let extra_str = format!("extra/repo@{d}");
        let (repository, parsed) = parse_bundle_ref(&extra_str).unwrap();
        assert_eq!(repository, Some("extra/repo"));
        assert_eq!(parsed, d);

        assert!(parse_bundle_ref("latest").is_err());
        assert!(parse_bundle_ref("repo@latest").is_err());
        assert!(parse_bundle_ref("sha256:abcd").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ensure_local_from_cached_index() {
        let cache = tempfile::tempdir().unwrap();
        let repo = test_repo(cache.path());

        let a = seed(repo.cas(), "alpha").await;
        let b = seed(repo.cas(), "beta").await;
        let index = BundleIndex::new([a.clone(), b.clone()]);

        // pretend a previous pull cached this index under the manifest digest
        let manifest_digest = Digest::from_bytes("some-manifest");
        atomic_write(
            &repo.index_path_for(&manifest_digest),
            &index.canonical_bytes(),
        )
        .unwrap();

        let (digest, dir) = repo.ensure_local(&manifest_digest.to_string()).await.unwrap();
        assert_eq!(digest, manifest_digest);
        assert!(dir.join(".complete").exists());
        assert_eq!(
            std::fs::read(dir.join(&a.path)).unwrap(),
            b"alpha".to_vec()
        );
        assert_eq!(std::fs::read(dir.join(&b.path)).unwrap(), b"beta".to_vec());

        // second call hits the marker and returns the same directory
        let (_, dir2) = repo.ensure_local(&manifest_digest.to_string()).await.unwrap();
        assert_eq!(dir, dir2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ensure_local_rebuilds_crash_remnant() {
        let cache = tempfile::tempdir().unwrap();
        let repo = test_repo(cache.path());

        let a = seed(repo.cas(), "gamma").await;
        let index = BundleIndex::new([a.clone()]);
        let manifest_digest = Digest::from_bytes("manifest-2");
        atomic_write(
            &repo.index_path_for(&manifest_digest),
            &index.canonical_bytes(),
        )
        .unwrap();

        // simulate a crash mid-pull: directory with junk, no marker
        let bundle_dir = repo.bundle_dir_for(&manifest_digest);
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("partial.bin"), b"junk").unwrap();

        let (_, dir) = repo.ensure_local(&manifest_digest.to_string()).await.unwrap();
        assert!(!dir.join("partial.bin").exists());
        assert_eq!(std::fs::read(dir.join(&a.path)).unwrap(), b"gamma".to_vec());
        assert!(dir.join(".complete").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_naming_strategies() {
        let cache = tempfile::tempdir().unwrap();
        let d = Digest::from_bytes("n");
        let hex = d.hex();

        let repo = test_repo(cache.path());
        assert!(repo.bundle_dir_for(&d).ends_with(&hex[..12]));

        let repo = test_repo(cache.path()).with_naming(CacheNaming::DigestFull);
        assert!(repo.bundle_dir_for(&d).ends_with(&hex));

        let repo = test_repo(cache.path()).with_naming(CacheNaming::DigestNested);
        let nested: PathBuf = [&hex[..2], &hex[2..4], &hex[4..]].iter().collect();
        assert!(repo.bundle_dir_for(&d).ends_with(nested));
    }
}
