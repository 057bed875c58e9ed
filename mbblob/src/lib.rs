use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use mbdigest::Digest;

pub mod fs;
pub mod s3;
pub mod uri;

pub use fs::FsBlobStore;
pub use s3::S3BlobStore;
pub use uri::{BlobRef, BlobUri};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadUri(String),
    WrongScheme { expected: String, got: String },
    NotFound(String),
    // an existing key whose content differs from what put() would write
    Conflict(String),
    Transport(String),
    UnsupportedProvider(String),
    MissingContainer(String),
    Digest(#[from] mbdigest::Error),
    Io(#[from] std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Content store keyed by digest. Digest verification after `get` is the
/// caller's responsibility; `put` is idempotent and never overwrites a key
/// whose content differs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, digest: &Digest, path: &Path) -> Result<BlobRef, Error>;
    async fn get(&self, blob_ref: &BlobRef, dest: &Path) -> Result<(), Error>;
    async fn exists(&self, blob_ref: &BlobRef) -> Result<bool, Error>;
}

/// Blob backend selection, as configured in the project's storage policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub prefix: String,
}

impl ProviderConfig {
    pub fn is_configured(&self) -> bool {
        !self.provider.is_empty()
    }
}

/// Build the store named by the config, or `None` when no provider is set.
/// Callers must refuse to push blob-classified files when this is `None`.
pub async fn make_blob_store(
    config: &ProviderConfig,
) -> Result<Option<Box<dyn BlobStore>>, Error> {
    match config.provider.as_str() {
        "" => Ok(None),
        "fs" => {
            if config.container.is_empty() {
                return Err(Error::MissingContainer(
                    "fs provider needs container (a directory path)".to_string(),
                ));
            }
            Ok(Some(Box::new(FsBlobStore::new(
                Path::new(&config.container),
                &config.prefix,
            )?)))
        }
        "s3" => {
            if config.container.is_empty() {
                return Err(Error::MissingContainer(
                    "s3 provider needs container (a bucket name)".to_string(),
                ));
            }
            Ok(Some(Box::new(
                S3BlobStore::from_env(&config.container, &config.prefix).await,
            )))
        }
        other => Err(Error::UnsupportedProvider(other.to_string())),
    }
}

// The only key scheme any backend uses: <prefix>/<hex[0:2]>/<hex[2:4]>/<hex>
pub fn sharded_key(prefix: &str, digest: &Digest) -> String {
    let hex = digest.hex();
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}/{}", &hex[..2], &hex[2..4], hex)
    } else {
        format!("{}/{}/{}/{}", prefix, &hex[..2], &hex[2..4], hex)
    }
}
