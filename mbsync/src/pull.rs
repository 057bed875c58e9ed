use log::{debug, info};

use mbblob::make_blob_store;
use mbcas::{Cas, LinkMode};
use mbdigest::Digest;
use mboci::dist::Client;
use mboci::index::{FileEntry, StorageKind};

use crate::config::BundleConfig;
use crate::context::ProjectContext;
use crate::diff::{ChangeKind, RemoteState, compute_diff};
use crate::state::SyncState;
use crate::track::TrackedFiles;
use crate::working::{ScanOptions, WorkingState, scan_with_digest_cache};
use crate::Error;

/// Pull plan: the tag was dereferenced exactly once when this was built, and
/// apply only ever uses `resolved_digest`, so a tag move between plan and
/// apply changes nothing.
#[derive(Debug, Clone)]
pub struct PullPreview {
    /// What the user asked for, tag or digest.
    pub original_reference: String,
    pub resolved_digest: Digest,
    pub remote: RemoteState,
    pub to_download: Vec<String>,
    /// Paths removed remotely that apply will delete locally (overwrite only).
    pub to_delete_local: Vec<String>,
    /// Conflicting paths that block the pull without overwrite.
    pub conflicts: Vec<String>,
    /// Paths removed remotely but blocked from local deletion (no overwrite).
    pub deleted_remote_blocked: Vec<String>,
    /// Local-only edits the pull preserves; surfaced for display.
    pub modified_local: Vec<String>,
    /// Untracked local files the download set would clobber.
    pub will_overwrite_untracked: Vec<String>,
    pub overwrite: bool,
    pub restore_deleted: bool,
}

impl PullPreview {
    pub fn is_blocked(&self) -> bool {
        !self.overwrite
            && (!self.conflicts.is_empty()
                || !self.deleted_remote_blocked.is_empty()
                || !self.will_overwrite_untracked.is_empty())
    }

    pub fn download_bytes(&self) -> u64 {
        self.to_download
            .iter()
            .filter_map(|p| self.remote.files.get(p))
            .map(|e| e.size)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct PullOutcome {
    pub resolved_digest: Digest,
    pub files_downloaded: usize,
    pub files_deleted: usize,
    pub bytes_downloaded: u64,
}

/// Pure projection of a diff into a pull preview, honoring `overwrite` and
/// `restore_deleted`.
#[allow(clippy::too_many_arguments)]
pub fn build_pull_preview(
    original_reference: &str,
    resolved_digest: Digest,
    remote: RemoteState,
    working: &WorkingState,
    state: &SyncState,
    tracked: &TrackedFiles,
    ctx: &ProjectContext,
    overwrite: bool,
    restore_deleted: bool,
) -> PullPreview {
    let mut preview = PullPreview {
        original_reference: original_reference.to_string(),
        resolved_digest,
        remote: RemoteState::empty(),
        to_download: Vec::new(),
        to_delete_local: Vec::new(),
        conflicts: Vec::new(),
        deleted_remote_blocked: Vec::new(),
        modified_local: Vec::new(),
        will_overwrite_untracked: Vec::new(),
        overwrite,
        restore_deleted,
    };

    for change in compute_diff(working, &remote, state) {
        match change.kind {
            ChangeKind::AddedRemote | ChangeKind::ModifiedRemote => {
                preview.to_download.push(change.path)
            }
            ChangeKind::DeletedLocal => {
                if overwrite || restore_deleted {
                    preview.to_download.push(change.path)
                }
            }
            ChangeKind::DeletedRemote => {
                if overwrite {
                    preview.to_delete_local.push(change.path)
                } else {
                    preview.deleted_remote_blocked.push(change.path)
                }
            }
            ChangeKind::Conflict => {
                if overwrite {
                    preview.to_download.push(change.path)
                } else {
                    preview.conflicts.push(change.path)
                }
            }
            ChangeKind::ModifiedLocal | ChangeKind::AddedLocal => {
                preview.modified_local.push(change.path)
            }
            ChangeKind::Unchanged => {}
        }
    }

    // a file we would write that exists on disk but is not tracked is a
    // collision; without overwrite the apply refuses to touch it
    for path in &preview.to_download {
        if !tracked.contains(path) && ctx.root().join(path).exists() {
            preview.will_overwrite_untracked.push(path.clone());
        }
    }

    preview.remote = remote;
    preview
}

/// Phase 1. The tag is resolved to a digest here and never again.
pub async fn plan_pull(
    client: &Client,
    config: &BundleConfig,
    ctx: &ProjectContext,
    reference: Option<&str>,
    overwrite: bool,
    restore_deleted: bool,
    options: &ScanOptions,
) -> Result<PullPreview, Error> {
    let reference = reference.unwrap_or(&config.default_tag);

    let resolved_digest: Digest = if reference.starts_with("sha256:") {
        reference.parse()?
    } else {
        let tag_ref = config.reference_for_tag(reference)?;
        client.resolve_tag_to_digest(&tag_ref).await?
    };
    debug!("resolved {reference} -> {}", resolved_digest.short());

    let digest_ref = config.reference_for_digest(&resolved_digest)?;
    let index = client.get_index(&digest_ref).await?;
    let remote = RemoteState::from_index(resolved_digest, &index);

    let tracked = TrackedFiles::load(ctx)?;
    let working = scan_with_digest_cache(&tracked, ctx, options)?;
    let state = SyncState::load(ctx)?;

    Ok(build_pull_preview(
        reference,
        resolved_digest,
        remote,
        &working,
        &state,
        &tracked,
        ctx,
        overwrite,
        restore_deleted,
    ))
}

/// Phase 2. Safety guards run before any filesystem write; on refusal the
/// working tree and sync state are untouched. Downloads land through
/// digest-verified temp files, then deletions are applied, then the tracked
/// set and baseline are rewritten.
pub async fn apply_pull(
    client: &Client,
    config: &BundleConfig,
    ctx: &ProjectContext,
    preview: &PullPreview,
    cas: Option<&Cas>,
    link_mode: LinkMode,
) -> Result<PullOutcome, Error> {
    if !preview.overwrite {
        if !preview.conflicts.is_empty() || !preview.deleted_remote_blocked.is_empty() {
            return Err(Error::PullBlocked {
                conflicts: preview.conflicts.clone(),
                deleted_remote: preview.deleted_remote_blocked.clone(),
            });
        }
        if !preview.will_overwrite_untracked.is_empty() {
            return Err(Error::UntrackedCollision(
                preview.will_overwrite_untracked.clone(),
            ));
        }
    }

    let entries: Vec<FileEntry> = preview
        .to_download
        .iter()
        .filter_map(|p| preview.remote.files.get(p))
        .cloned()
        .collect();

    let blob_store = if entries.iter().any(|e| e.storage == StorageKind::Blob) {
        let store = make_blob_store(&config.storage.provider).await?;
        if store.is_none() {
            let offenders = entries
                .iter()
                .filter(|e| e.storage == StorageKind::Blob)
                .map(|e| e.path.clone())
                .collect();
            return Err(Error::BlobStorageRequired(offenders));
        }
        store
    } else {
        None
    };

    // everything below references the resolved digest, never the tag
    let digest_ref = config.reference_for_digest(&preview.resolved_digest)?;
    client
        .pull_selected(
            &digest_ref,
            &entries,
            ctx.root(),
            blob_store.as_deref(),
            cas,
            link_mode,
        )
        .await?;

    let mut tracked = TrackedFiles::load(ctx)?;
    for path in &preview.to_delete_local {
        match std::fs::remove_file(ctx.root().join(path)) {
            Ok(()) => debug!("deleted {path}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        tracked.remove(path);
    }
    for path in &preview.to_download {
        tracked.add(path)?;
    }
    tracked.save(ctx)?;

    let mut state = SyncState::load(ctx)?;
    state.replace_baseline(
        preview
            .remote
            .files
            .iter()
            .map(|(p, e)| (p.clone(), e.digest)),
    );
    state.last_pull_digest = Some(preview.resolved_digest);
    state.save(ctx)?;

    info!(
        "pulled {} files at {}",
        preview.to_download.len(),
        preview.resolved_digest.short()
    );
    Ok(PullOutcome {
        resolved_digest: preview.resolved_digest,
        files_downloaded: preview.to_download.len(),
        files_deleted: preview.to_delete_local.len(),
        bytes_downloaded: preview.download_bytes(),
    })
}
