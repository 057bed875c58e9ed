use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;

use mbdigest::Digest;

use crate::{BlobRef, BlobStore, BlobUri, Error, sharded_key};

/// Filesystem-backed blob store. The main production use is sharing a
/// directory between test peers and air-gapped setups; layout is the same
/// sharded scheme as every other backend.
pub struct FsBlobStore {
    base_dir: PathBuf,
    prefix: String,
}

impl FsBlobStore {
    pub fn new(base_dir: &Path, prefix: &str) -> Result<FsBlobStore, Error> {
        let base_dir = std::path::absolute(base_dir)?;
        std::fs::create_dir_all(&base_dir)?;
        Ok(FsBlobStore {
            base_dir,
            prefix: prefix.to_string(),
        })
    }

    fn path_for(&self, digest: &Digest) -> PathBuf {
        self.base_dir.join(sharded_key(&self.prefix, digest))
    }

    fn uri_for(&self, path: &Path) -> Result<BlobUri, Error> {
        let s = path
            .to_str()
            .ok_or_else(|| Error::BadUri(format!("non-utf8 path {path:?}")))?;
        BlobUri::new("fs", "", s)
    }

    fn resolve(&self, blob_ref: &BlobRef) -> Result<PathBuf, Error> {
        blob_ref.uri.expect_scheme("fs")?;
        Ok(Path::new("/").join(blob_ref.uri.key()))
    }
}

// copy src into dest's directory under a temp name, then rename into place
fn atomic_copy(src: &Path, dest: &Path) -> Result<(), Error> {
    let parent = dest.parent().ok_or_else(|| {
        Error::Io(std::io::Error::other(format!("no parent for {dest:?}")))
    })?;
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::fs::copy(src, tmp.path())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, digest: &Digest, path: &Path) -> Result<BlobRef, Error> {
        let dest = self.path_for(digest);
        if dest.exists() {
            // idempotent re-put of identical content; anything else is refused
            let existing = Digest::from_file(&dest)?;
            if existing != *digest {
                return Err(Error::Conflict(format!(
                    "key for {digest} holds content with digest {existing}"
                )));
            }
            debug!("blob {} already present, skipping copy", digest.short());
            return Ok(BlobRef::new(self.uri_for(&dest)?));
        }
        atomic_copy(path, &dest)?;
        Ok(BlobRef::new(self.uri_for(&dest)?))
    }

    async fn get(&self, blob_ref: &BlobRef, dest: &Path) -> Result<(), Error> {
        let src = self.resolve(blob_ref)?;
        if !src.exists() {
            return Err(Error::NotFound(blob_ref.uri.to_string()));
        }
        atomic_copy(&src, dest)
    }

    async fn exists(&self, blob_ref: &BlobRef) -> Result<bool, Error> {
        Ok(self.resolve(blob_ref)?.exists())
    }
}
