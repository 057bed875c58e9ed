use std::fmt;
use std::path::PathBuf;

use mbdigest::Digest;

pub mod config;
pub mod context;
pub mod diff;
pub mod digest_cache;
pub mod policy;
pub mod pull;
pub mod push;
pub mod state;
pub mod track;
pub mod working;

pub use config::BundleConfig;
pub use context::ProjectContext;
pub use diff::{ChangeKind, FileChange, RemoteState, compute_diff};
pub use digest_cache::DigestCache;
pub use policy::{StorageMode, StoragePolicy};
pub use pull::{PullOutcome, PullPreview, apply_pull, plan_pull};
pub use push::{PushOutcome, PushPlan, apply_push, plan_push};
pub use state::SyncState;
pub use track::TrackedFiles;
pub use working::{StatusSummary, WorkingState};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
    Yaml(#[from] serde_yaml::Error),
    Digest(#[from] mbdigest::Error),
    Dist(#[from] mboci::dist::Error),
    Index(#[from] mboci::index::Error),
    Blob(#[from] mbblob::Error),
    Cas(#[from] mbcas::Error),
    Glob(#[from] globset::Error),
    Ignore(#[from] ignore::Error),
    // not inside a project directory tree
    NotAProject(PathBuf),
    BadReference(String),
    BadTrackedPath(String),
    SymlinkNotAllowed(String),
    FileTooLarge {
        path: String,
        size: u64,
        limit: u64,
    },
    BlobOnlyNeedsProvider,
    BlobStorageRequired(Vec<String>),
    NothingToPush,
    TagMoved {
        tag: String,
        expected: Digest,
        actual: Option<Digest>,
    },
    PullBlocked {
        conflicts: Vec<String>,
        deleted_remote: Vec<String>,
    },
    UntrackedCollision(Vec<String>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
