use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use mbcas::fsutil::atomic_write;
use mbdigest::Digest;

use crate::{Error, ProjectContext};

/// Per-project record of the last-synced remote contents, the third leg of
/// the three-way diff. `last_synced_files` is rewritten wholesale after every
/// successful push or pull so it exactly mirrors the post-sync remote; in
/// particular, entries for locally deleted files get pruned, which is what
/// lets the next diff classify them as local deletions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub last_synced_files: BTreeMap<String, Digest>,
    #[serde(default)]
    pub last_push_digest: Option<Digest>,
    #[serde(default)]
    pub last_pull_digest: Option<Digest>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl SyncState {
    pub fn load(ctx: &ProjectContext) -> Result<SyncState, Error> {
        let path = ctx.state_path();
        if !path.exists() {
            return Ok(SyncState::default());
        }
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    pub fn save(&mut self, ctx: &ProjectContext) -> Result<(), Error> {
        self.updated_at = Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string());
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_write(&ctx.state_path(), &bytes)?;
        Ok(())
    }

    /// Replace the baseline with exactly the given path→digest mapping.
    pub fn replace_baseline(&mut self, files: impl IntoIterator<Item = (String, Digest)>) {
        self.last_synced_files = files.into_iter().collect();
    }
}
