use std::fmt;
use std::path::PathBuf;

use mbdigest::Digest;

pub mod cas;
pub mod fsutil;
pub mod lock;

pub use cas::{Cas, LinkMode};
pub use lock::FileLock;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Digest(#[from] mbdigest::Error),
    Io(#[from] std::io::Error),
    DigestMismatch { expected: Digest, actual: Digest },
    NotInCache(Digest),
    LockTimeout(PathBuf),
    ReflinkUnsupported(PathBuf),
    BadLinkMode(String),
    Fetch(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error {
    /// Wrap a caller error raised inside an `ensure_present` fetch callback.
    pub fn fetch(e: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Fetch(Box::new(e))
    }
}
