use std::collections::{BTreeMap, BTreeSet};

use mbdigest::Digest;
use mboci::index::{BundleIndex, FileEntry};

use crate::state::SyncState;
use crate::working::{FileInfo, WorkingState};

/// What happened to a path, judged from the (local, remote, baseline) triple.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Unchanged,
    AddedLocal,
    AddedRemote,
    ModifiedLocal,
    ModifiedRemote,
    DeletedLocal,
    DeletedRemote,
    Conflict,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub local: Option<FileInfo>,
    pub remote: Option<FileEntry>,
    pub baseline: Option<Digest>,
}

/// The remote side of a diff, derived from a bundle index.
#[derive(Debug, Clone, Default)]
pub struct RemoteState {
    pub manifest_digest: Option<Digest>,
    pub files: BTreeMap<String, FileEntry>,
}

impl RemoteState {
    /// A tag that does not exist yet.
    pub fn empty() -> RemoteState {
        RemoteState::default()
    }

    pub fn from_index(manifest_digest: Digest, index: &BundleIndex) -> RemoteState {
        RemoteState {
            manifest_digest: Some(manifest_digest),
            files: index.files.clone(),
        }
    }
}

/// Classify every path known to any of the three inputs. Local deletions are
/// the tracked-but-missing set; a deletion whose remote side also changed is
/// a conflict, and one that never made it into a sync is skipped entirely.
/// Output is sorted by path.
pub fn compute_diff(
    local: &WorkingState,
    remote: &RemoteState,
    baseline: &SyncState,
) -> Vec<FileChange> {
    let mut changes = Vec::new();

    for path in &local.missing {
        let last = baseline.last_synced_files.get(path).copied();
        let remote_file = remote.files.get(path);

        let Some(last) = last else {
            // tracked, then deleted, before ever syncing
            continue;
        };
        let kind = match remote_file {
            Some(remote_file) if remote_file.digest != last => ChangeKind::Conflict,
            _ => ChangeKind::DeletedLocal,
        };
        changes.push(FileChange {
            path: path.clone(),
            kind,
            local: None,
            remote: remote_file.cloned(),
            baseline: Some(last),
        });
    }

    let all_paths: BTreeSet<&String> = local
        .files
        .keys()
        .chain(remote.files.keys())
        .filter(|p| !local.missing.contains(*p))
        .collect();

    for path in all_paths {
        let local_file = local.files.get(path);
        let remote_file = remote.files.get(path);
        let last = baseline.last_synced_files.get(path).copied();

        let kind = match (local_file, remote_file) {
            (Some(l), Some(r)) => {
                if l.digest == r.digest {
                    ChangeKind::Unchanged
                } else {
                    match last {
                        // no baseline to attribute the change: conservative
                        None => ChangeKind::Conflict,
                        Some(last) if l.digest == last && r.digest != last => {
                            ChangeKind::ModifiedRemote
                        }
                        Some(last) if r.digest == last && l.digest != last => {
                            ChangeKind::ModifiedLocal
                        }
                        Some(_) => ChangeKind::Conflict,
                    }
                }
            }
            (Some(l), None) => match last {
                None => ChangeKind::AddedLocal,
                Some(last) if l.digest == last => ChangeKind::DeletedRemote,
                Some(_) => ChangeKind::Conflict,
            },
            (None, Some(_)) => ChangeKind::AddedRemote,
            (None, None) => continue,
        };
        changes.push(FileChange {
            path: path.clone(),
            kind,
            local: local_file.cloned(),
            remote: remote_file.cloned(),
            baseline: last,
        });
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str, content: &str) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            digest: Digest::from_bytes(content),
            size: content.len() as u64,
            mtime: 0,
        }
    }

    fn entry(path: &str, content: &str) -> FileEntry {
        FileEntry::oci(path, Digest::from_bytes(content), content.len() as u64)
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
            manifest_digest: Some(Digest::from_bytes("manifest")),
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), entry(p, c)))
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

    fn kinds(changes: &[FileChange]) -> BTreeMap<String, ChangeKind> {
        changes.iter().map(|c| (c.path.clone(), c.kind)).collect()
    }

    #[test]
    fn test_both_present_cases() {
        let local = working(
            &[
                ("same.txt", "v1"),
                ("remote_moved.txt", "v1"),
                ("local_moved.txt", "v2"),
                ("both_moved.txt", "v2"),
                ("no_baseline.txt", "v2"),
            ],
            &[],
        );
        let rem = remote(&[
            ("same.txt", "v1"),
            ("remote_moved.txt", "v2"),
            ("local_moved.txt", "v1"),
            ("both_moved.txt", "v3"),
            ("no_baseline.txt", "v1"),
        ]);
        let base = baseline(&[
            ("same.txt", "v1"),
            ("remote_moved.txt", "v1"),
            ("local_moved.txt", "v1"),
            ("both_moved.txt", "v1"),
        ]);
        let k = kinds(&compute_diff(&local, &rem, &base));
        assert_eq!(k["same.txt"], ChangeKind::Unchanged);
        assert_eq!(k["remote_moved.txt"], ChangeKind::ModifiedRemote);
        assert_eq!(k["local_moved.txt"], ChangeKind::ModifiedLocal);
        assert_eq!(k["both_moved.txt"], ChangeKind::Conflict);
        assert_eq!(k["no_baseline.txt"], ChangeKind::Conflict);
    }

    #[test]
    fn test_one_sided_cases() {
        let local = working(&[("new_local.txt", "v1"), ("was_synced.txt", "v1")], &[]);
        let rem = remote(&[("new_remote.txt", "v1")]);
        let base = baseline(&[("was_synced.txt", "v1")]);
        let k = kinds(&compute_diff(&local, &rem, &base));
        assert_eq!(k["new_local.txt"], ChangeKind::AddedLocal);
        assert_eq!(k["new_remote.txt"], ChangeKind::AddedRemote);
        // present locally, gone remotely, unchanged since sync
        assert_eq!(k["was_synced.txt"], ChangeKind::DeletedRemote);
    }

    #[test]
    fn test_local_edit_remote_delete_is_conflict() {
        let local = working(&[("edited.txt", "v2")], &[]);
        let rem = remote(&[]);
        let base = baseline(&[("edited.txt", "v1")]);
        let k = kinds(&compute_diff(&local, &rem, &base));
        assert_eq!(k["edited.txt"], ChangeKind::Conflict);
    }

    #[test]
    fn test_missing_local_cases() {
        let local = working(
            &[],
            &["deleted.txt", "deleted_remote_changed.txt", "never_synced.txt"],
        );
        let rem = remote(&[
            ("deleted.txt", "v1"),
            ("deleted_remote_changed.txt", "v2"),
        ]);
        let base = baseline(&[
            ("deleted.txt", "v1"),
            ("deleted_remote_changed.txt", "v1"),
        ]);
        let changes = compute_diff(&local, &rem, &base);
        let k = kinds(&changes);
        assert_eq!(k["deleted.txt"], ChangeKind::DeletedLocal);
        // deleted here, changed there
        assert_eq!(
            k["deleted_remote_changed.txt"],
            ChangeKind::Conflict
        );
        // tracked then deleted before any sync: not reported at all
        assert!(!k.contains_key("never_synced.txt"));
    }

    #[test]
    fn test_deleted_local_beats_remote_presence() {
        // a path that is both missing locally and present remotely must be
        // classified exactly once, from the deletion branch
        let local = working(&[], &["gone.txt"]);
        let rem = remote(&[("gone.txt", "v1")]);
        let base = baseline(&[("gone.txt", "v1")]);
        let changes = compute_diff(&local, &rem, &base);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::DeletedLocal);
    }

    #[test]
    fn test_output_sorted_by_path() {
        let local = working(&[("b.txt", "x"), ("a.txt", "x"), ("c.txt", "x")], &[]);
        let changes = compute_diff(&local, &RemoteState::empty(), &SyncState::default());
        let paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "c.txt"]);
    }
}
