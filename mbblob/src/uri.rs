use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::Error;

// Canonical blob location: <scheme>://<container>/<key>. Queries and
// fragments are rejected so nobody can smuggle a signed token into an index
// that outlives it. Double slashes are rejected rather than collapsed so two
// spellings of the same key can't produce two index encodings.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUri {
    scheme: String,
    container: String,
    key: String,
}

impl BlobUri {
    pub fn new(scheme: &str, container: &str, key: &str) -> Result<BlobUri, Error> {
        if !is_scheme(scheme) {
            return Err(Error::BadUri(format!("bad scheme {scheme:?}")));
        }
        if container.contains('/') || !is_clean(container) {
            return Err(Error::BadUri(format!("bad container {container:?}")));
        }
        let key = percent_encode(key.trim_start_matches('/'));
        if key.is_empty() || key.contains("//") {
            return Err(Error::BadUri(format!("bad key {key:?}")));
        }
        Ok(BlobUri {
            scheme: scheme.to_string(),
            container: container.to_string(),
            key,
        })
    }

    pub fn parse(s: &str) -> Result<BlobUri, Error> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::BadUri(s.to_string()))?;
        if rest.contains('?') || rest.contains('#') {
            return Err(Error::BadUri("query/fragment not allowed".to_string()));
        }
        if !is_clean(rest) {
            return Err(Error::BadUri(s.to_string()));
        }
        if scheme == "fs" {
            // fs://<absolute path>; no container component
            if !rest.starts_with('/') {
                return Err(Error::BadUri(format!("fs uri must be absolute: {s}")));
            }
            return BlobUri::new(scheme, "", rest);
        }
        let (container, key) = rest
            .split_once('/')
            .ok_or_else(|| Error::BadUri(s.to_string()))?;
        if container.is_empty() {
            return Err(Error::BadUri(s.to_string()));
        }
        BlobUri::new(scheme, container, key)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expect_scheme(&self, scheme: &str) -> Result<(), Error> {
        if self.scheme == scheme {
            Ok(())
        } else {
            Err(Error::WrongScheme {
                expected: scheme.to_string(),
                got: self.scheme.clone(),
            })
        }
    }
}

impl fmt::Display for BlobUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.container, self.key)
    }
}

impl std::str::FromStr for BlobUri {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        BlobUri::parse(s)
    }
}

impl Serialize for BlobUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlobUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlobUri::parse(&s).map_err(de::Error::custom)
    }
}

/// Reference to a blob in external storage, as recorded in a bundle index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub uri: BlobUri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl BlobRef {
    pub fn new(uri: BlobUri) -> BlobRef {
        BlobRef { uri, etag: None }
    }

    pub fn with_etag(uri: BlobUri, etag: Option<String>) -> BlobRef {
        BlobRef { uri, etag }
    }
}

fn is_scheme(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

// printable, no whitespace; percent escapes allowed
fn is_clean(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_graphic())
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => out.push(b as char),
            b'-' | b'_' | b'.' | b'~' | b'/' | b'%' | b':' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
