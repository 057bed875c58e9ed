use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use mbblob::ProviderConfig;
use mboci::StorageKind;

use crate::Error;

pub const DEFAULT_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

/// Where file content rides on a push.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Patterns and size threshold decide per file.
    #[default]
    Auto,
    /// Everything as OCI layers.
    OciOnly,
    /// Everything through the blob provider; rejected at validation time
    /// when no provider is configured.
    BlobOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePolicy {
    #[serde(default)]
    pub mode: StorageMode,
    #[serde(default = "default_threshold")]
    pub threshold_bytes: u64,
    #[serde(default)]
    pub force_blob_patterns: Vec<String>,
    #[serde(default)]
    pub force_oci_patterns: Vec<String>,
    #[serde(flatten)]
    pub provider: ProviderConfig,
}

fn default_threshold() -> u64 {
    DEFAULT_THRESHOLD_BYTES
}

impl Default for StoragePolicy {
    fn default() -> StoragePolicy {
        StoragePolicy {
            mode: StorageMode::default(),
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            force_blob_patterns: Vec::new(),
            force_oci_patterns: Vec::new(),
            provider: ProviderConfig::default(),
        }
    }
}

impl StoragePolicy {
    pub fn uses_blob_storage(&self) -> bool {
        self.provider.is_configured()
    }

    /// Construction-time checks: blob-only needs a provider, and the force
    /// patterns have to compile.
    pub fn validate(&self) -> Result<(), Error> {
        if self.mode == StorageMode::BlobOnly && !self.uses_blob_storage() {
            return Err(Error::BlobOnlyNeedsProvider);
        }
        self.matcher()?;
        Ok(())
    }

    pub fn matcher(&self) -> Result<PolicyMatcher<'_>, Error> {
        Ok(PolicyMatcher {
            policy: self,
            force_oci: compile(&self.force_oci_patterns)?,
            force_blob: compile(&self.force_blob_patterns)?,
        })
    }

    /// One-off classification; plan-time code compiles a matcher once instead.
    pub fn classify(&self, path: &str, size: u64) -> Result<(StorageKind, bool), Error> {
        Ok(self.matcher()?.classify(path, size))
    }
}

fn compile(patterns: &[String]) -> Result<GlobSet, Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Policy with the glob sets compiled.
pub struct PolicyMatcher<'a> {
    policy: &'a StoragePolicy,
    force_oci: GlobSet,
    force_blob: GlobSet,
}

impl PolicyMatcher<'_> {
    /// Decide where a file's content goes. The bool is the "would be blob
    /// but no provider is configured" warning; such files fall back to OCI.
    pub fn classify(&self, path: &str, size: u64) -> (StorageKind, bool) {
        let has_provider = self.policy.uses_blob_storage();
        match self.policy.mode {
            StorageMode::OciOnly => (StorageKind::Oci, false),
            // validate() guarantees a provider in blob-only mode
            StorageMode::BlobOnly => (StorageKind::Blob, false),
            StorageMode::Auto => {
                if self.force_oci.is_match(path) {
                    (StorageKind::Oci, false)
                } else if self.force_blob.is_match(path) || size >= self.policy.threshold_bytes {
                    if has_provider {
                        (StorageKind::Blob, false)
                    } else {
                        (StorageKind::Oci, true)
                    }
                } else {
                    (StorageKind::Oci, false)
                }
            }
        }
    }

    /// Paths that want blob storage while no provider is configured; used
    /// for the early actionable push error.
    pub fn files_requiring_blob_storage<'p>(
        &self,
        files: impl IntoIterator<Item = (&'p str, u64)>,
    ) -> Vec<String> {
        if self.policy.uses_blob_storage() || self.policy.mode == StorageMode::OciOnly {
            return Vec::new();
        }
        files
            .into_iter()
            .filter(|(path, size)| self.classify(path, *size).1)
            .map(|(path, _)| path.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_provider(mut policy: StoragePolicy) -> StoragePolicy {
        policy.provider = ProviderConfig {
            provider: "s3".to_string(),
            container: "bucket".to_string(),
            prefix: String::new(),
        };
        policy
    }

    #[test]
    fn test_oci_only_never_blob() {
        let policy = StoragePolicy {
            mode: StorageMode::OciOnly,
            ..Default::default()
        };
        let m = policy.matcher().unwrap();
        assert_eq!(m.classify("huge.bin", u64::MAX), (StorageKind::Oci, false));
    }

    #[test]
    fn test_blob_only_requires_provider() {
        let policy = StoragePolicy {
            mode: StorageMode::BlobOnly,
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(Error::BlobOnlyNeedsProvider)
        ));
        let policy = with_provider(policy);
        policy.validate().unwrap();
        let m = policy.matcher().unwrap();
        assert_eq!(m.classify("tiny.txt", 1), (StorageKind::Blob, false));
    }

    #[test]
    fn test_auto_threshold() {
        let policy = with_provider(StoragePolicy::default());
        let m = policy.matcher().unwrap();
        assert_eq!(
            m.classify("small.csv", DEFAULT_THRESHOLD_BYTES - 1),
            (StorageKind::Oci, false)
        );
        assert_eq!(
            m.classify("big.csv", DEFAULT_THRESHOLD_BYTES),
            (StorageKind::Blob, false)
        );
    }

    #[test]
    fn test_auto_patterns_override_threshold() {
        let policy = with_provider(StoragePolicy {
            force_oci_patterns: vec!["*.json".to_string()],
            force_blob_patterns: vec!["data/**".to_string()],
            ..Default::default()
        });
        let m = policy.matcher().unwrap();
        // forced to oci despite being over threshold
        assert_eq!(
            m.classify("huge.json", u64::MAX),
            (StorageKind::Oci, false)
        );
        // forced to blob despite being tiny
        assert_eq!(m.classify("data/tiny.bin", 1), (StorageKind::Blob, false));
        assert_eq!(m.classify("code/tiny.bin", 1), (StorageKind::Oci, false));
    }

    #[test]
    fn test_no_provider_falls_back_with_warning() {
        let policy = StoragePolicy {
            force_blob_patterns: vec!["*.bin".to_string()],
            ..Default::default()
        };
        let m = policy.matcher().unwrap();
        assert_eq!(m.classify("x.bin", 1), (StorageKind::Oci, true));
        assert_eq!(
            m.classify("big.csv", DEFAULT_THRESHOLD_BYTES),
            (StorageKind::Oci, true)
        );

        let offenders = m.files_requiring_blob_storage([
            ("x.bin", 1u64),
            ("ok.txt", 1u64),
            ("big.csv", DEFAULT_THRESHOLD_BYTES),
        ]);
        assert_eq!(offenders, vec!["x.bin".to_string(), "big.csv".to_string()]);
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let policy = StoragePolicy {
            force_blob_patterns: vec!["[".to_string()],
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
