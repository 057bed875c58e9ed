use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use log::debug;

use crate::Error;

pub const PROJECT_DIR: &str = ".modelops-bundle";
pub const CONFIG_FILE: &str = "config.yaml";
pub const TRACKED_FILE: &str = "tracked";
pub const STATE_FILE: &str = "state.json";
pub const IGNORE_FILE: &str = ".modelopsignore";

// always excluded, before .modelopsignore gets a say
const DEFAULT_IGNORES: &[&str] = &[
    ".git/",
    ".modelops-bundle/",
    ".modelopsignore",
    "__pycache__/",
    "*.pyc",
    ".venv/",
    "venv/",
    "node_modules/",
    "target/",
    ".idea/",
    ".vscode/",
    "*.swp",
    ".DS_Store",
    "Thumbs.db",
    ".ipynb_checkpoints/",
];

/// A project is any directory containing `.modelops-bundle/`. The context
/// owns root discovery, the standard file locations under that directory,
/// and the ignore rules used when scanning.
pub struct ProjectContext {
    root: PathBuf,
    ignore: Gitignore,
}

impl ProjectContext {
    /// Walk up from `start` to the first directory holding `.modelops-bundle/`.
    pub fn discover(start: &Path) -> Result<ProjectContext, Error> {
        let start = std::path::absolute(start)?;
        let mut current = start.as_path();
        loop {
            if current.join(PROJECT_DIR).is_dir() {
                return Self::at_root(current);
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return Err(Error::NotAProject(start)),
            }
        }
    }

    /// Create `.modelops-bundle/` at `path` and return the context.
    pub fn init(path: &Path) -> Result<ProjectContext, Error> {
        let root = std::path::absolute(path)?;
        std::fs::create_dir_all(root.join(PROJECT_DIR))?;
        Self::at_root(&root)
    }

    pub fn is_initialized(path: &Path) -> bool {
        path.join(PROJECT_DIR).is_dir()
    }

    fn at_root(root: &Path) -> Result<ProjectContext, Error> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in DEFAULT_IGNORES {
            builder.add_line(None, pattern)?;
        }
        let ignore_file = root.join(IGNORE_FILE);
        if ignore_file.exists() {
            if let Some(e) = builder.add(&ignore_file) {
                debug!("ignoring unusable {IGNORE_FILE}: {e}");
            }
        }
        Ok(ProjectContext {
            root: root.to_path_buf(),
            ignore: builder.build()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.root.join(PROJECT_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage_dir().join(CONFIG_FILE)
    }

    pub fn tracked_path(&self) -> PathBuf {
        self.storage_dir().join(TRACKED_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.storage_dir().join(STATE_FILE)
    }

    /// Check a project-relative POSIX path against the ignore rules.
    pub fn should_ignore(&self, relpath: &str) -> bool {
        let is_dir = relpath.ends_with('/');
        let relpath = relpath.trim_end_matches('/');
        self.ignore
            .matched_path_or_any_parents(relpath, is_dir)
            .is_ignore()
    }

    /// Convert a path (absolute or cwd-relative) into a project-relative
    /// POSIX string, rejecting anything outside the project.
    pub fn to_project_relative(&self, path: &Path) -> Result<String, Error> {
        let abs = std::path::absolute(path)?;
        let rel = abs
            .strip_prefix(&self.root)
            .map_err(|_| Error::BadTrackedPath(format!("{} is outside the project", abs.display())))?;
        let s = rel
            .to_str()
            .ok_or_else(|| Error::BadTrackedPath(format!("non-utf8 path {rel:?}")))?;
        Ok(s.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::init(dir.path()).unwrap();
        assert!(ProjectContext::is_initialized(dir.path()));

        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = ProjectContext::discover(&nested).unwrap();
        assert_eq!(found.root(), ctx.root());
    }

    #[test]
    fn test_discover_fails_outside_project() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ProjectContext::discover(dir.path()),
            Err(Error::NotAProject(_))
        ));
    }

    #[test]
    fn test_default_ignores() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::init(dir.path()).unwrap();
        assert!(ctx.should_ignore(".git/config"));
        assert!(ctx.should_ignore(".modelops-bundle/state.json"));
        assert!(ctx.should_ignore("src/__pycache__/mod.pyc"));
        assert!(ctx.should_ignore("node_modules/pkg/index.js"));
        assert!(!ctx.should_ignore("data/population.csv"));
        assert!(!ctx.should_ignore("model.py"));
    }

    #[test]
    fn test_modelopsignore_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "*.tmp\nscratch/\n").unwrap();
        let ctx = ProjectContext::init(dir.path()).unwrap();
        assert!(ctx.should_ignore("out.tmp"));
        assert!(ctx.should_ignore("scratch/notes.txt"));
        assert!(!ctx.should_ignore("keep.txt"));
    }

    #[test]
    fn test_to_project_relative() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::init(dir.path()).unwrap();
        let inside = dir.path().join("data").join("x.csv");
        assert_eq!(ctx.to_project_relative(&inside).unwrap(), "data/x.csv");
        assert!(ctx.to_project_relative(Path::new("/definitely/elsewhere")).is_err());
    }
}
