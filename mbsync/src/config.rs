use oci_spec::distribution::Reference;
use serde::{Deserialize, Serialize};

use mbcas::fsutil::atomic_write;
use mbdigest::Digest;

use crate::policy::StoragePolicy;
use crate::{Error, ProjectContext};

fn default_tag() -> String {
    "latest".to_string()
}

/// Project configuration, stored as `.modelops-bundle/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Registry and repository, e.g. `ghcr.io/org/models`.
    pub registry_ref: String,
    #[serde(default = "default_tag")]
    pub default_tag: String,
    #[serde(default)]
    pub storage: StoragePolicy,
    /// Plain http for local registries.
    #[serde(default)]
    pub insecure: bool,
}

impl BundleConfig {
    pub fn new(registry_ref: &str) -> BundleConfig {
        BundleConfig {
            registry_ref: registry_ref.to_string(),
            default_tag: default_tag(),
            storage: StoragePolicy::default(),
            insecure: false,
        }
    }

    pub fn load(ctx: &ProjectContext) -> Result<BundleConfig, Error> {
        let raw = std::fs::read_to_string(ctx.config_path())?;
        let config: BundleConfig = serde_yaml::from_str(&raw)?;
        config.storage.validate()?;
        Ok(config)
    }

    pub fn save(&self, ctx: &ProjectContext) -> Result<(), Error> {
        self.storage.validate()?;
        let raw = serde_yaml::to_string(self)?;
        atomic_write(&ctx.config_path(), raw.as_bytes())?;
        Ok(())
    }

    pub fn reference_for_tag(&self, tag: &str) -> Result<Reference, Error> {
        let raw = format!("{}:{}", self.registry_ref, tag);
        raw.parse()
            .map_err(|e| Error::BadReference(format!("{raw}: {e}")))
    }

    pub fn reference_for_digest(&self, digest: &Digest) -> Result<Reference, Error> {
        let raw = format!("{}@{}", self.registry_ref, digest);
        raw.parse()
            .map_err(|e| Error::BadReference(format!("{raw}: {e}")))
    }
}
