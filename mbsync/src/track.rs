use std::collections::BTreeSet;

use mbcas::fsutil::atomic_write;
use mboci::index::is_safe_rel_path;

use crate::{Error, ProjectContext};

/// The set of paths the user asked to sync, persisted as sorted newline-
/// separated lines in `.modelops-bundle/tracked` for stable diffs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedFiles {
    files: BTreeSet<String>,
}

impl TrackedFiles {
    pub fn load(ctx: &ProjectContext) -> Result<TrackedFiles, Error> {
        let path = ctx.tracked_path();
        if !path.exists() {
            return Ok(TrackedFiles::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut tracked = TrackedFiles::default();
        for line in raw.lines() {
            let line = line.trim();
            if !line.is_empty() {
                tracked.add(line)?;
            }
        }
        Ok(tracked)
    }

    pub fn save(&self, ctx: &ProjectContext) -> Result<(), Error> {
        let mut out = String::new();
        for path in &self.files {
            out.push_str(path);
            out.push('\n');
        }
        atomic_write(&ctx.tracked_path(), out.as_bytes())?;
        Ok(())
    }

    /// Returns false if the path was already tracked.
    pub fn add(&mut self, path: &str) -> Result<bool, Error> {
        if !is_safe_rel_path(path) {
            return Err(Error::BadTrackedPath(path.to_string()));
        }
        Ok(self.files.insert(path.to_string()))
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.files.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::init(dir.path()).unwrap();

        let mut tracked = TrackedFiles::default();
        assert!(tracked.add("b.txt").unwrap());
        assert!(tracked.add("a/deep.txt").unwrap());
        assert!(!tracked.add("b.txt").unwrap());
        tracked.save(&ctx).unwrap();

        let raw = std::fs::read_to_string(ctx.tracked_path()).unwrap();
        assert_eq!(raw, "a/deep.txt\nb.txt\n");

        let back = TrackedFiles::load(&ctx).unwrap();
        assert_eq!(back, tracked);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::init(dir.path()).unwrap();
        assert!(TrackedFiles::load(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_unsafe_paths() {
        let mut tracked = TrackedFiles::default();
        assert!(tracked.add("../escape.txt").is_err());
        assert!(tracked.add("/abs.txt").is_err());
        assert!(tracked.add("ok/file.txt").is_ok());
    }
}
