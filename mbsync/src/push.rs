use std::collections::BTreeMap;

use log::{debug, info};

use mbblob::make_blob_store;
use mbdigest::Digest;
use mboci::dist::{self, Client, PushLayer};
use mboci::index::{BundleIndex, FileEntry, StorageKind};

use crate::config::BundleConfig;
use crate::context::ProjectContext;
use crate::diff::{ChangeKind, RemoteState, compute_diff};
use crate::policy::StoragePolicy;
use crate::state::SyncState;
use crate::track::TrackedFiles;
use crate::working::{ScanOptions, WorkingState, scan_with_digest_cache};
use crate::Error;

const CREATED_ANNOTATION: &str = "org.opencontainers.image.created";
const VERSION_ANNOTATION: &str = "modelops.bundle.version";

/// One file as it will appear in the pushed manifest.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub path: String,
    pub digest: Digest,
    pub size: u64,
    pub storage: StorageKind,
}

/// Everything apply needs, captured at plan time. Never persisted; consumed
/// by a single apply.
#[derive(Debug, Clone)]
pub struct PushPlan {
    pub tag: String,
    /// The digest the tag pointed at when the plan was made; `None` for a
    /// tag that did not exist. Apply re-reads the tag and compares.
    pub tag_base_digest: Option<Digest>,
    /// Every tracked file present on disk, unchanged ones included; the
    /// manifest is always a full mirror.
    pub manifest_files: Vec<PlannedFile>,
    /// Paths with new content (added or modified locally).
    pub to_upload: Vec<String>,
    pub unchanged: Vec<String>,
    /// Tracked-but-missing paths being dropped from the manifest.
    pub deleted: Vec<String>,
    /// The remote's path→digest mapping at plan time, for the no-op check.
    pub remote_files: BTreeMap<String, Digest>,
}

impl PushPlan {
    pub fn upload_bytes(&self) -> u64 {
        let uploads: std::collections::BTreeSet<&str> =
            self.to_upload.iter().map(String::as_str).collect();
        self.manifest_files
            .iter()
            .filter(|f| uploads.contains(f.path.as_str()))
            .map(|f| f.size)
            .sum()
    }

    /// True when applying would reproduce the remote exactly.
    pub fn is_noop(&self) -> bool {
        self.to_upload.is_empty()
            && self.manifest_files.len() == self.remote_files.len()
            && self
                .manifest_files
                .iter()
                .all(|f| self.remote_files.get(&f.path) == Some(&f.digest))
    }
}

/// Result of a successful (or skipped) push apply.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub manifest_digest: Digest,
    pub tag: String,
    pub files_pushed: usize,
    pub files_uploaded: usize,
    pub bytes_uploaded: u64,
    pub files_deleted: usize,
    pub skipped: bool,
}

/// Pure projection of a diff into a push plan. Strict mirror semantics: the
/// manifest lists exactly the locally-present tracked files, so anything
/// tracked-then-deleted falls out of the next manifest.
pub fn build_push_plan(
    tag: &str,
    tag_base_digest: Option<Digest>,
    working: &WorkingState,
    remote: &RemoteState,
    state: &SyncState,
    policy: &StoragePolicy,
) -> Result<PushPlan, Error> {
    let matcher = policy.matcher()?;

    let offenders = matcher.files_requiring_blob_storage(
        working
            .files
            .values()
            .map(|f| (f.path.as_str(), f.size)),
    );
    if !offenders.is_empty() {
        return Err(Error::BlobStorageRequired(offenders));
    }

    let mut plan = PushPlan {
        tag: tag.to_string(),
        tag_base_digest,
        manifest_files: Vec::new(),
        to_upload: Vec::new(),
        unchanged: Vec::new(),
        deleted: Vec::new(),
        remote_files: remote
            .files
            .iter()
            .map(|(p, e)| (p.clone(), e.digest))
            .collect(),
    };

    for change in compute_diff(working, remote, state) {
        if let Some(local) = &change.local {
            let (storage, _) = matcher.classify(&local.path, local.size);
            plan.manifest_files.push(PlannedFile {
                path: local.path.clone(),
                digest: local.digest,
                size: local.size,
                storage,
            });
        }
        match change.kind {
            ChangeKind::AddedLocal | ChangeKind::ModifiedLocal => {
                plan.to_upload.push(change.path)
            }
            ChangeKind::Unchanged => plan.unchanged.push(change.path),
            ChangeKind::DeletedLocal => plan.deleted.push(change.path),
            _ => {}
        }
    }

    if plan.manifest_files.is_empty() {
        return Err(Error::NothingToPush);
    }
    Ok(plan)
}

/// Resolve a tag and derive the remote state from its bundle index. A tag
/// that does not exist is an empty remote, not an error.
pub async fn fetch_remote_state(
    client: &Client,
    config: &BundleConfig,
    tag: &str,
) -> Result<(Option<Digest>, RemoteState), Error> {
    let tag_ref = config.reference_for_tag(tag)?;
    match client.resolve_tag_to_digest(&tag_ref).await {
        Ok(digest) => {
            let digest_ref = config.reference_for_digest(&digest)?;
            let index = client.get_index(&digest_ref).await?;
            Ok((Some(digest), RemoteState::from_index(digest, &index)))
        }
        Err(dist::Error::NotFound(_)) => Ok((None, RemoteState::empty())),
        Err(e) => Err(e.into()),
    }
}

/// Phase 1: snapshot disk and remote, project the diff into a plan.
pub async fn plan_push(
    client: &Client,
    config: &BundleConfig,
    ctx: &ProjectContext,
    tag: Option<&str>,
    options: &ScanOptions,
) -> Result<PushPlan, Error> {
    let tag = tag.unwrap_or(&config.default_tag);
    let tracked = TrackedFiles::load(ctx)?;
    let working = scan_with_digest_cache(&tracked, ctx, options)?;
    let (tag_base_digest, remote) = fetch_remote_state(client, config, tag).await?;
    let state = SyncState::load(ctx)?;
    build_push_plan(tag, tag_base_digest, &working, &remote, &state, &config.storage)
}

/// Phase 2: the optimistic-concurrency check, the uploads, the manifest put,
/// and the wholesale sync-state rewrite, in that order. The baseline is only
/// touched after the registry has confirmed the manifest.
pub async fn apply_push(
    client: &Client,
    config: &BundleConfig,
    ctx: &ProjectContext,
    plan: &PushPlan,
    force: bool,
) -> Result<PushOutcome, Error> {
    let tag_ref = config.reference_for_tag(&plan.tag)?;

    // the only race detection there is: registries have no compare-and-swap
    // on tags, so we re-read and compare against the plan's snapshot
    if let Some(expected) = plan.tag_base_digest {
        if !force {
            let actual = match client.resolve_tag_to_digest(&tag_ref).await {
                Ok(digest) => Some(digest),
                Err(dist::Error::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
            if actual != Some(expected) {
                return Err(Error::TagMoved {
                    tag: plan.tag.clone(),
                    expected,
                    actual,
                });
            }
        }
    }

    if plan.is_noop() {
        if let Some(digest) = plan.tag_base_digest {
            info!("nothing changed; remote already at {}", digest.short());
            return Ok(PushOutcome {
                manifest_digest: digest,
                tag: plan.tag.clone(),
                files_pushed: plan.manifest_files.len(),
                files_uploaded: 0,
                bytes_uploaded: 0,
                files_deleted: 0,
                skipped: true,
            });
        }
    }

    // blob-classified content goes out first so the index can carry refs
    let mut blob_refs = BTreeMap::new();
    let blob_files: Vec<&PlannedFile> = plan
        .manifest_files
        .iter()
        .filter(|f| f.storage == StorageKind::Blob)
        .collect();
    if !blob_files.is_empty() {
        let store = make_blob_store(&config.storage.provider)
            .await?
            .ok_or_else(|| {
                Error::BlobStorageRequired(
                    blob_files.iter().map(|f| f.path.clone()).collect(),
                )
            })?;
        for file in &blob_files {
            let blob_ref = store
                .put(&file.digest, &ctx.root().join(&file.path))
                .await?;
            debug!("blob {} -> {}", file.path, blob_ref.uri);
            blob_refs.insert(file.path.clone(), blob_ref);
        }
    }

    let mut entries = Vec::with_capacity(plan.manifest_files.len());
    let mut layers = Vec::new();
    for file in &plan.manifest_files {
        match file.storage {
            StorageKind::Oci => {
                entries.push(FileEntry::oci(&file.path, file.digest, file.size));
                layers.push(PushLayer {
                    path: file.path.clone(),
                    digest: file.digest,
                    size: file.size,
                    source: ctx.root().join(&file.path),
                });
            }
            StorageKind::Blob => {
                // populated just above
                let blob_ref = blob_refs
                    .get(&file.path)
                    .cloned()
                    .ok_or_else(|| Error::BlobStorageRequired(vec![file.path.clone()]))?;
                entries.push(FileEntry::blob(&file.path, file.digest, file.size, blob_ref));
            }
        }
    }

    let mut index = BundleIndex::new(entries);
    index
        .metadata
        .insert("tool".to_string(), "modelops-bundle".to_string());

    let annotations = BTreeMap::from([
        (CREATED_ANNOTATION.to_string(), index.created.clone()),
        (
            VERSION_ANNOTATION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ]);

    let manifest_digest = client
        .push_with_index_config(&tag_ref, &index, &layers, &annotations)
        .await?;
    info!(
        "pushed {} files to {}:{} -> {}",
        plan.manifest_files.len(),
        config.registry_ref,
        plan.tag,
        manifest_digest.short()
    );

    // baseline mirrors what just became the remote; deletions fall out here
    let mut state = SyncState::load(ctx)?;
    state.replace_baseline(
        plan.manifest_files
            .iter()
            .map(|f| (f.path.clone(), f.digest)),
    );
    state.last_push_digest = Some(manifest_digest);
    state.save(ctx)?;

    Ok(PushOutcome {
        manifest_digest,
        tag: plan.tag.clone(),
        files_pushed: plan.manifest_files.len(),
        files_uploaded: plan.to_upload.len(),
        bytes_uploaded: plan.upload_bytes(),
        files_deleted: plan.deleted.len(),
        skipped: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::working::FileInfo;
    use std::collections::BTreeSet;

    fn info(path: &str, content: &str) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            digest: Digest::from_bytes(content),
            size: content.len() as u64,
            mtime: 0,
        }
    }

    fn working(files: &[(&str, &str)], missing: &[&str]) -> WorkingState {
        WorkingState {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), info(p, c)))
                .collect(),
            missing: missing.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn remote(files: &[(&str, &str)]) -> RemoteState {
        RemoteState {
            manifest_digest: Some(Digest::from_bytes("m")),
            files: files
                .iter()
                .map(|(p, c)| {
                    (
                        p.to_string(),
                        FileEntry::oci(p, Digest::from_bytes(c), c.len() as u64),
                    )
                })
                .collect(),
        }
    }

    fn baseline(files: &[(&str, &str)]) -> SyncState {
        SyncState {
            last_synced_files: files
                .iter()
                .map(|(p, c)| (p.to_string(), Digest::from_bytes(c)))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_mirror_manifest_includes_every_present_file() {
        let working = working(
            &[("same.txt", "v1"), ("edit.txt", "v2"), ("new.txt", "v1")],
            &["gone.txt"],
        );
        let rem = remote(&[("same.txt", "v1"), ("edit.txt", "v1"), ("gone.txt", "v1")]);
        let base = baseline(&[("same.txt", "v1"), ("edit.txt", "v1"), ("gone.txt", "v1")]);

        let plan = build_push_plan(
            "latest",
            rem.manifest_digest,
            &working,
            &rem,
            &base,
            &StoragePolicy::default(),
        )
        .unwrap();

        // manifest == exactly the present tracked files
        let manifest_paths: BTreeSet<&str> = plan
            .manifest_files
            .iter()
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(
            manifest_paths,
            BTreeSet::from(["same.txt", "edit.txt", "new.txt"])
        );
        assert_eq!(plan.to_upload, vec!["edit.txt", "new.txt"]);
        assert_eq!(plan.unchanged, vec!["same.txt"]);
        assert_eq!(plan.deleted, vec!["gone.txt"]);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_noop_when_mirroring_remote() {
        let working = working(&[("a.txt", "v1"), ("b.txt", "v1")], &[]);
        let rem = remote(&[("a.txt", "v1"), ("b.txt", "v1")]);
        let base = baseline(&[("a.txt", "v1"), ("b.txt", "v1")]);
        let plan = build_push_plan(
            "latest",
            rem.manifest_digest,
            &working,
            &rem,
            &base,
            &StoragePolicy::default(),
        )
        .unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.upload_bytes(), 0);
    }

    #[test]
    fn test_extra_remote_file_defeats_noop() {
        // remote holds a file we no longer track at all; mirror semantics
        // will prune it, so this is not a no-op
        let working = working(&[("a.txt", "v1")], &[]);
        let rem = remote(&[("a.txt", "v1"), ("stray.txt", "v1")]);
        // stray.txt not in baseline: it shows up as ADDED_REMOTE but the
        // mirror manifest still drops it
        let base = baseline(&[("a.txt", "v1")]);
        let plan = build_push_plan(
            "latest",
            rem.manifest_digest,
            &working,
            &rem,
            &base,
            &StoragePolicy::default(),
        )
        .unwrap();
        assert!(!plan.is_noop());
        assert_eq!(plan.manifest_files.len(), 1);
    }

    #[test]
    fn test_storage_classification_attached() {
        let mut policy = StoragePolicy::default();
        policy.provider = mbblob::ProviderConfig {
            provider: "s3".to_string(),
            container: "bucket".to_string(),
            prefix: String::new(),
        };
        policy.threshold_bytes = 4;

        let working = working(&[("small.txt", "abc"), ("large.bin", "abcdefgh")], &[]);
        let plan = build_push_plan(
            "latest",
            None,
            &working,
            &RemoteState::empty(),
            &SyncState::default(),
            &policy,
        )
        .unwrap();
        let by_path: BTreeMap<&str, StorageKind> = plan
            .manifest_files
            .iter()
            .map(|f| (f.path.as_str(), f.storage))
            .collect();
        assert_eq!(by_path["small.txt"], StorageKind::Oci);
        assert_eq!(by_path["large.bin"], StorageKind::Blob);
    }

    #[test]
    fn test_blob_needed_without_provider_refused_at_plan_time() {
        let policy = StoragePolicy {
            threshold_bytes: 4,
            ..Default::default()
        };
        let working = working(&[("large.bin", "abcdefgh")], &[]);
        let err = build_push_plan(
            "latest",
            None,
            &working,
            &RemoteState::empty(),
            &SyncState::default(),
            &policy,
        )
        .unwrap_err();
        match err {
            Error::BlobStorageRequired(files) => {
                assert_eq!(files, vec!["large.bin".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_plan_refused() {
        let working = working(&[], &["gone.txt"]);
        let err = build_push_plan(
            "latest",
            None,
            &working,
            &RemoteState::empty(),
            &SyncState::default(),
            &StoragePolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NothingToPush));
    }
}
