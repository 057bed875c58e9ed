use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, warn};

use mbdigest::Digest;

use crate::fsutil::fsync_dir;
use crate::lock::{DEFAULT_LOCK_TIMEOUT, FileLock};
use crate::Error;

/// How `materialize` places content at a destination.
///
/// `Auto` tries reflink, then hardlink, then copy. Hardlinked destinations
/// share the cache object's inode, so callers that intend to chmod the
/// destination read-only must pass `skip_if_hardlink_and_readonly` or the
/// restriction would stick to the cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LinkMode {
    #[default]
    Auto,
    Reflink,
    Hardlink,
    Copy,
}

impl std::str::FromStr for LinkMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<LinkMode, Error> {
        match s {
            "auto" => Ok(LinkMode::Auto),
            "reflink" => Ok(LinkMode::Reflink),
            "hardlink" => Ok(LinkMode::Hardlink),
            "copy" => Ok(LinkMode::Copy),
            other => Err(Error::BadLinkMode(other.to_string())),
        }
    }
}

/// Content-addressed object store shared by every process on the machine.
///
/// Objects live at `<root>/objects/sha256/<hex[0:2]>/<hex[2:4]>/<hex>` and
/// are immutable (mode 0444) from the instant they become visible. A sibling
/// `<hex>.lock` file serializes fetches of the same digest across processes.
pub struct Cas {
    root: PathBuf,
    objdir: PathBuf,
}

impl Cas {
    pub fn open(root: impl Into<PathBuf>) -> Result<Cas, Error> {
        let root = root.into();
        let objdir = root.join("objects").join("sha256");
        std::fs::create_dir_all(&objdir)?;
        Ok(Cas { root, objdir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Computed object path; no side effects. The `Digest` type already
    /// guarantees the hex is exactly 64 lowercase chars, so this can never
    /// escape the objects tree.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.objdir.join(&hex[..2]).join(&hex[2..4]).join(hex)
    }

    fn lock_path_for(&self, digest: &Digest) -> PathBuf {
        let mut p = self.path_for(digest).into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.path_for(digest).exists()
    }

    /// Fetch-once promotion. If the object is already present, returns its
    /// path. Otherwise acquires the per-object lock, re-checks, has `fetch`
    /// write into a temp file in the object's directory, verifies the digest,
    /// fsyncs, chmods 0444, and renames into place. Concurrent callers across
    /// processes invoke `fetch` exactly once.
    pub async fn ensure_present<F, Fut>(&self, digest: &Digest, fetch: F) -> Result<PathBuf, Error>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let final_path = self.path_for(digest);
        if final_path.exists() {
            return Ok(final_path);
        }

        let parent = final_path.parent().expect("object path has parent");
        std::fs::create_dir_all(parent)?;

        let lock_path = self.lock_path_for(digest);
        let lock = tokio::task::spawn_blocking(move || {
            FileLock::acquire(&lock_path, DEFAULT_LOCK_TIMEOUT)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        // another process may have promoted while we waited
        if final_path.exists() {
            drop(lock);
            return Ok(final_path);
        }

        // temp lives next to the final path so the rename stays on one
        // filesystem; NamedTempFile unlinks it on any early return
        let tmp = tempfile::Builder::new()
            .prefix(".cas-")
            .tempfile_in(parent)?;

        fetch(tmp.path().to_path_buf()).await?;

        let actual = Digest::from_file(tmp.path())?;
        if actual != *digest {
            return Err(Error::DigestMismatch {
                expected: *digest,
                actual,
            });
        }

        tmp.as_file().sync_all()?;

        // read-only before visible, so nothing downstream can mutate it
        let mut perms = std::fs::metadata(tmp.path())?.permissions();
        set_mode(&mut perms, 0o444);
        std::fs::set_permissions(tmp.path(), perms)?;

        tmp.persist(&final_path).map_err(|e| Error::Io(e.error))?;
        fsync_dir(parent);
        debug!("cas promoted {}", digest.short());

        drop(lock);
        Ok(final_path)
    }

    /// Place the object at `dest` by reflink, hardlink, or copy. Every
    /// strategy stages through a temp file in `dest`'s directory and renames,
    /// so an interrupted materialization leaves either a correct `dest` or no
    /// `dest`.
    pub fn materialize(
        &self,
        digest: &Digest,
        dest: &Path,
        mode: LinkMode,
        skip_if_hardlink_and_readonly: bool,
    ) -> Result<(), Error> {
        let src = self.path_for(digest);
        if !src.exists() {
            return Err(Error::NotInCache(*digest));
        }
        let parent = dest
            .parent()
            .ok_or_else(|| Error::Io(std::io::Error::other(format!("no parent for {dest:?}"))))?;
        std::fs::create_dir_all(parent)?;

        if matches!(mode, LinkMode::Reflink | LinkMode::Auto) {
            let tmp = tmp_name(dest, "reflink");
            match reflink_copy::reflink(&src, &tmp) {
                Ok(()) => {
                    finish_tmp(&tmp, dest, parent)?;
                    debug!("materialized {} via reflink", digest.short());
                    return Ok(());
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp);
                    if mode == LinkMode::Reflink {
                        debug!("reflink failed for {:?}: {}", dest, e);
                        return Err(Error::ReflinkUnsupported(dest.to_path_buf()));
                    }
                }
            }
        }

        if matches!(mode, LinkMode::Hardlink | LinkMode::Auto) {
            if skip_if_hardlink_and_readonly {
                debug!("skipping hardlink for {:?} (read-only destination)", dest);
            } else {
                let tmp = tmp_name(dest, "hardlink");
                match std::fs::hard_link(&src, &tmp) {
                    Ok(()) => {
                        std::fs::rename(&tmp, dest)?;
                        fsync_dir(parent);
                        debug!("materialized {} via hardlink", digest.short());
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = std::fs::remove_file(&tmp);
                        if mode == LinkMode::Hardlink {
                            return Err(Error::Io(e));
                        }
                    }
                }
            }
        }

        // copy always works; destination gets writable permissions back
        let tmp = tmp_name(dest, "copy");
        let result = (|| -> Result<(), Error> {
            std::fs::copy(&src, &tmp)?;
            let mut perms = std::fs::metadata(&tmp)?.permissions();
            set_mode(&mut perms, 0o644);
            std::fs::set_permissions(&tmp, perms)?;
            finish_tmp(&tmp, dest, parent)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        } else {
            debug!("materialized {} via copy", digest.short());
        }
        result
    }

    /// Delete objects not used within the cutoff (access time when the
    /// filesystem tracks it, else mtime). Lock files are preserved. Returns
    /// the number of objects removed.
    pub fn cleanup_old_objects(&self, keep_recent_hours: u64) -> Result<usize, Error> {
        let cutoff = SystemTime::now() - Duration::from_secs(keep_recent_hours * 3600);
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(&self.objdir) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("cleanup walk error: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().is_some_and(|e| e == "lock") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let last_used = meta.accessed().or_else(|_| meta.modified());
            let Ok(last_used) = last_used else { continue };
            if last_used < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        removed += 1;
                        debug!("removed old cache object {:?}", entry.path());
                    }
                    Err(e) => debug!("could not remove {:?}: {}", entry.path(), e),
                }
            }
        }
        Ok(removed)
    }
}

fn tmp_name(dest: &Path, strategy: &str) -> PathBuf {
    let name = dest.file_name().unwrap_or_default().to_string_lossy();
    dest.with_file_name(format!(".{name}.{strategy}"))
}

fn finish_tmp(tmp: &Path, dest: &Path, parent: &Path) -> Result<(), Error> {
    let f = std::fs::File::open(tmp)?;
    f.sync_all()?;
    std::fs::rename(tmp, dest)?;
    fsync_dir(parent);
    Ok(())
}

#[cfg(unix)]
fn set_mode(perms: &mut std::fs::Permissions, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(mode);
}

#[cfg(not(unix))]
fn set_mode(perms: &mut std::fs::Permissions, mode: u32) {
    perms.set_readonly(mode & 0o200 == 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mode_of(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn nlink_of(path: &Path) -> u64 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).unwrap().nlink()
    }

    #[tokio::test]
    async fn test_path_for_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("abc");
        let hex = d.hex();
        let expected = dir
            .path()
            .join("objects")
            .join("sha256")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex);
        assert_eq!(cas.path_for(&d), expected);
        assert!(!cas.has(&d));
    }

    #[tokio::test]
    async fn test_ensure_present_promotes_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("content");
        let path = cas
            .ensure_present(&d, |tmp| async move {
                std::fs::write(&tmp, b"content")?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"content");
        assert_eq!(mode_of(&path), 0o444);
        assert!(cas.has(&d));
    }

    #[tokio::test]
    async fn test_ensure_present_skips_fetch_when_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("content");
        cas.ensure_present(&d, |tmp| async move {
            std::fs::write(&tmp, b"content")?;
            Ok(())
        })
        .await
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        cas.ensure_present(&d, move |tmp| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                std::fs::write(&tmp, b"content")?;
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_present_rejects_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("expected");
        let err = cas
            .ensure_present(&d, |tmp| async move {
                std::fs::write(&tmp, b"something else")?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(!cas.has(&d));
        // nothing but the lock file left behind
        let parent = cas.path_for(&d);
        let names: Vec<String> = std::fs::read_dir(parent.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| n.ends_with(".lock")), "{names:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_present_fetches_once() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(Cas::open(dir.path()).unwrap());
        let d = Digest::from_bytes("shared");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cas = cas.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cas.ensure_present(&d, move |tmp| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        std::fs::write(&tmp, b"shared")?;
                        Ok(())
                    }
                })
                .await
            }));
        }
        for h in handles {
            let path = h.await.unwrap().unwrap();
            assert_eq!(Digest::from_file(&path).unwrap(), d);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mode_of(&cas.path_for(&d)), 0o444);
    }

    #[tokio::test]
    async fn test_materialize_copy_is_writable() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("data");
        cas.ensure_present(&d, |tmp| async move {
            std::fs::write(&tmp, b"data")?;
            Ok(())
        })
        .await
        .unwrap();

        let dest = dir.path().join("out").join("file.bin");
        cas.materialize(&d, &dest, LinkMode::Copy, false).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
        assert_eq!(mode_of(&dest), 0o644);
        assert_eq!(nlink_of(&dest), 1);
    }

    #[tokio::test]
    async fn test_materialize_hardlink_shares_inode() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("data");
        cas.ensure_present(&d, |tmp| async move {
            std::fs::write(&tmp, b"data")?;
            Ok(())
        })
        .await
        .unwrap();

        let dest = dir.path().join("linked.bin");
        cas.materialize(&d, &dest, LinkMode::Hardlink, false).unwrap();
        assert_eq!(nlink_of(&dest), 2);

        // the skip flag forces the fall-through to copy
        let dest2 = dir.path().join("copied.bin");
        cas.materialize(&d, &dest2, LinkMode::Hardlink, true).unwrap();
        assert_eq!(nlink_of(&dest2), 1);
        assert_eq!(mode_of(&dest2), 0o644);
    }

    #[tokio::test]
    async fn test_materialize_auto_always_lands() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("data");
        cas.ensure_present(&d, |tmp| async move {
            std::fs::write(&tmp, b"data")?;
            Ok(())
        })
        .await
        .unwrap();
        let dest = dir.path().join("auto.bin");
        cas.materialize(&d, &dest, LinkMode::Auto, false).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_materialize_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("never stored");
        let dest = dir.path().join("out.bin");
        assert!(matches!(
            cas.materialize(&d, &dest, LinkMode::Auto, false),
            Err(Error::NotInCache(_))
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cleanup_preserves_locks() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let d = Digest::from_bytes("old");
        let path = cas
            .ensure_present(&d, |tmp| async move {
                std::fs::write(&tmp, b"old")?;
                Ok(())
            })
            .await
            .unwrap();

        // backdate both times past any cutoff
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_times(&path, old, old).unwrap();

        let removed = cas.cleanup_old_objects(1).unwrap();
        assert_eq!(removed, 1);
        assert!(!cas.has(&d));
        // lock file survived
        let lock = cas.lock_path_for(&d);
        assert!(lock.exists());
    }
}
