use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::Sha256;

// Content digests are the only thing that ever turns into a filesystem path
// or registry URL segment, so parsing is strict: exactly "sha256:" + 64 lower
// hex. Anything else is rejected before it can reach a path join.

const HEX_LEN: usize = 64;

pub const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadDigest,
    UnhandledAlgorithm(String),
    Io(#[from] std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Digest {
    Sha256([u8; 32]),
}

impl Digest {
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Digest {
        use sha2::Digest as _;
        Digest::Sha256(Sha256::digest(data).into())
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Digest, Error> {
        use sha2::Digest as _;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest::Sha256(hasher.finalize().into()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Digest, Error> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    pub fn hex(&self) -> String {
        match self {
            Digest::Sha256(data) => hex::encode(data),
        }
    }

    // 12-char prefix, docker style, for logs and cache directory names
    pub fn short(&self) -> String {
        let mut h = self.hex();
        h.truncate(12);
        h
    }

    pub fn parse_hex(hex_str: &str) -> Result<Digest, Error> {
        if hex_str.len() != HEX_LEN || !is_lower_hex(hex_str) {
            return Err(Error::BadDigest);
        }
        let mut data = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut data).map_err(|_| Error::BadDigest)?;
        Ok(Digest::Sha256(data))
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl std::str::FromStr for Digest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.split_once(':') {
            Some(("sha256", hex_part)) => Digest::parse_hex(hex_part),
            Some((algo, _)) if !algo.is_empty() && is_lower_hex_or_alpha(algo) => {
                Err(Error::UnhandledAlgorithm(algo.to_string()))
            }
            _ => Err(Error::BadDigest),
        }
    }
}

fn is_lower_hex_or_alpha(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

impl TryFrom<&str> for Digest {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self, Error> {
        s.parse()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sha256:{}", self.hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
