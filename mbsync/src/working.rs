use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::UNIX_EPOCH;

use log::{debug, warn};

use mbdigest::Digest;

use crate::diff::{ChangeKind, RemoteState, compute_diff};
use crate::digest_cache::DigestCache;
use crate::state::SyncState;
use crate::track::TrackedFiles;
use crate::{Error, ProjectContext};

pub const DEFAULT_MAX_AUTO_HASH_BYTES: u64 = 100 * 1024 * 1024;

/// One tracked file as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub path: String,
    pub digest: Digest,
    pub size: u64,
    pub mtime: i64,
}

/// What to do when a tracked path is a symlink.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SymlinkPolicy {
    /// Hash the target's content.
    #[default]
    Follow,
    /// Hash the link text itself.
    HashLinkText,
    /// Leave the path out of the snapshot entirely.
    Skip,
    /// Refuse to scan.
    Error,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub symlinks: SymlinkPolicy,
    /// Refuse to auto-hash files above this size; `None` opts in to hashing
    /// anything. A usability guard against accidental multi-GB adds, not an
    /// integrity property.
    pub max_auto_hash_bytes: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> ScanOptions {
        ScanOptions {
            symlinks: SymlinkPolicy::default(),
            max_auto_hash_bytes: Some(DEFAULT_MAX_AUTO_HASH_BYTES),
        }
    }
}

/// Snapshot of the tracked set as it exists on disk: digests for present
/// regular files plus the set of tracked paths that are missing.
#[derive(Debug, Clone, Default)]
pub struct WorkingState {
    pub files: BTreeMap<String, FileInfo>,
    pub missing: BTreeSet<String>,
}

impl WorkingState {
    pub fn scan(
        tracked: &TrackedFiles,
        ctx: &ProjectContext,
        options: &ScanOptions,
    ) -> Result<WorkingState, Error> {
        Self::scan_with_cache(tracked, ctx, options, None)
    }

    /// Scan, reusing cached digests for files whose stat signature is
    /// unchanged. New digests are recorded in the cache; persisting it is the
    /// caller's call.
    pub fn scan_with_cache(
        tracked: &TrackedFiles,
        ctx: &ProjectContext,
        options: &ScanOptions,
        mut digest_cache: Option<&mut DigestCache>,
    ) -> Result<WorkingState, Error> {
        let mut state = WorkingState::default();
        for path in tracked.iter() {
            let full = ctx.root().join(path);
            let meta = match full.symlink_metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    state.missing.insert(path.clone());
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            };

            if meta.file_type().is_symlink() {
                match options.symlinks {
                    SymlinkPolicy::Follow => {}
                    SymlinkPolicy::HashLinkText => {
                        let target = std::fs::read_link(&full)?;
                        let text = target.to_string_lossy();
                        state.files.insert(
                            path.clone(),
                            FileInfo {
                                path: path.clone(),
                                digest: Digest::from_bytes(text.as_bytes()),
                                size: text.len() as u64,
                                mtime: mtime_of(&meta),
                            },
                        );
                        continue;
                    }
                    SymlinkPolicy::Skip => {
                        debug!("skipping symlink {path}");
                        continue;
                    }
                    SymlinkPolicy::Error => {
                        return Err(Error::SymlinkNotAllowed(path.clone()));
                    }
                }
            }

            // follow the link (or take the file itself)
            let meta = match full.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // dangling symlink
                    state.missing.insert(path.clone());
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            };
            if !meta.is_file() {
                state.missing.insert(path.clone());
                continue;
            }
            if let Some(limit) = options.max_auto_hash_bytes {
                if meta.len() > limit {
                    return Err(Error::FileTooLarge {
                        path: path.clone(),
                        size: meta.len(),
                        limit,
                    });
                }
            }
            let digest = match digest_cache.as_deref_mut().and_then(|c| c.get(path, &meta)) {
                Some(digest) => digest,
                None => {
                    let digest = Digest::from_file(&full)?;
                    if let Some(cache) = digest_cache.as_deref_mut() {
                        cache.insert(path, &meta, digest);
                    }
                    digest
                }
            };
            state.files.insert(
                path.clone(),
                FileInfo {
                    path: path.clone(),
                    digest,
                    size: meta.len(),
                    mtime: mtime_of(&meta),
                },
            );
        }
        Ok(state)
    }

    pub fn present_paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    /// Pure summary of where the project stands relative to a remote; no
    /// side effects, suitable for status rendering.
    pub fn status_summary(
        &self,
        remote: Option<&RemoteState>,
        state: &SyncState,
    ) -> StatusSummary {
        let mut summary = StatusSummary {
            total_tracked: self.files.len() + self.missing.len(),
            total_size: self.files.values().map(|f| f.size).sum(),
            ..Default::default()
        };

        let Some(remote) = remote else {
            // no remote to compare against; everything present is local-only
            summary.added_local = self.files.len();
            summary.deleted_local = self.missing.len();
            summary.local_only = self.files.keys().cloned().collect();
            return summary;
        };

        for change in compute_diff(self, remote, state) {
            match change.kind {
                ChangeKind::Unchanged => summary.unchanged += 1,
                ChangeKind::AddedLocal => {
                    summary.added_local += 1;
                    summary.local_only.push(change.path);
                }
                ChangeKind::AddedRemote => {
                    summary.added_remote += 1;
                    summary.remote_only.push(change.path);
                }
                ChangeKind::ModifiedLocal => {
                    summary.modified_local += 1;
                    summary.changed.push((change.path, change.kind));
                }
                ChangeKind::ModifiedRemote => {
                    summary.modified_remote += 1;
                    summary.changed.push((change.path, change.kind));
                }
                ChangeKind::DeletedLocal => {
                    summary.deleted_local += 1;
                    summary.changed.push((change.path, change.kind));
                }
                ChangeKind::DeletedRemote => {
                    summary.deleted_remote += 1;
                    summary.changed.push((change.path, change.kind));
                }
                ChangeKind::Conflict => {
                    summary.conflicts += 1;
                    summary.changed.push((change.path, change.kind));
                }
            }
        }
        summary
    }
}

/// Scan through the project's digest cache, persisting whatever it learned.
/// A cache write failure degrades to a warning; the scan result stands alone.
pub fn scan_with_digest_cache(
    tracked: &TrackedFiles,
    ctx: &ProjectContext,
    options: &ScanOptions,
) -> Result<WorkingState, Error> {
    use crate::digest_cache::DIGEST_CACHE_FILE;
    let mut digests = DigestCache::load(&ctx.storage_dir().join(DIGEST_CACHE_FILE));
    let working = WorkingState::scan_with_cache(tracked, ctx, options, Some(&mut digests))?;
    if let Err(e) = digests.save() {
        warn!("could not persist digest cache: {e}");
    }
    Ok(working)
}

fn mtime_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-kind counts plus compact buckets for display.
#[derive(Debug, Clone, Default)]
pub struct StatusSummary {
    pub total_tracked: usize,
    pub total_size: u64,
    pub unchanged: usize,
    pub added_local: usize,
    pub added_remote: usize,
    pub modified_local: usize,
    pub modified_remote: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub conflicts: usize,
    pub local_only: Vec<String>,
    pub remote_only: Vec<String>,
    pub changed: Vec<(String, ChangeKind)>,
}

impl StatusSummary {
    pub fn has_changes(&self) -> bool {
        self.added_local > 0 || self.modified_local > 0 || self.deleted_local > 0
    }

    pub fn has_remote_changes(&self) -> bool {
        self.added_remote > 0 || self.modified_remote > 0 || self.deleted_remote > 0
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts > 0
    }

    pub fn is_synced(&self) -> bool {
        self.unchanged == self.total_tracked && !self.has_remote_changes() && self.conflicts == 0
    }
}

pub fn humanize_size(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
