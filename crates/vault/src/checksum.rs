//! Checksum: full 256-bit BLAKE3 digests as lowercase hex.
//!
//! Unlike content addressing, file verification gains nothing from a
//! shorter digest, so the full output is kept.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const HEX_LEN: usize = 64;
const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("invalid checksum length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in checksum")]
    InvalidHex,
}

impl Checksum {
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(hex::encode(blake3::hash(data).as_bytes()))
    }

    /// Hash a file without loading it into memory.
    pub fn of_file(path: &Path) -> io::Result<(Self, u64)> {
        let mut file = File::open(path)?;
        let mut hasher = StreamingChecksum::new();
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HEX_LEN {
            return Err(ChecksumError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::InvalidHex);
        }
        Ok(Self(s.to_lowercase()))
    }
}

/// Incremental hasher that also counts bytes.
#[derive(Debug, Default)]
pub struct StreamingChecksum {
    hasher: blake3::Hasher,
    len: u64,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    pub fn finalize(&self) -> (Checksum, u64) {
        (Checksum(hex::encode(self.hasher.finalize().as_bytes())), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_one_shot() {
        let data = vec![7u8; READ_BUF * 3 + 17];
        let mut streaming = StreamingChecksum::new();
        for chunk in data.chunks(1000) {
            streaming.update(chunk);
        }
        let (sum, len) = streaming.finalize();
        assert_eq!(sum, Checksum::of_bytes(&data));
        assert_eq!(len, data.len() as u64);
        assert_eq!(sum.as_str().len(), 64);
    }

    #[test]
    fn file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let (sum, len) = Checksum::of_file(&path).unwrap();
        assert_eq!(sum, Checksum::of_bytes(b"hello"));
        assert_eq!(len, 5);
    }

    #[test]
    fn parse_validates() {
        let good = Checksum::of_bytes(b"x");
        assert_eq!(good.as_str().to_uppercase().parse::<Checksum>().unwrap(), good);
        assert!(matches!("abc".parse::<Checksum>(), Err(ChecksumError::InvalidLength(3))));
        assert!(matches!(
            "z".repeat(64).parse::<Checksum>(),
            Err(ChecksumError::InvalidHex)
        ));
    }
}
