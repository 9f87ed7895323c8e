//! Content digests.
//!
//! Every blob handled by strata (layer tars, image configs, manifests) is
//! identified by `sha256:<lowercase hex>`. Files are hashed in fixed-size
//! blocks so a multi-gigabyte layer never has to fit in memory.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use strata_core::error::{Result, StrataError};

/// The only algorithm prefix strata produces or accepts.
pub const SHA256_PREFIX: &str = "sha256:";

/// Read block size used when hashing files: 64 KiB.
const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// A `sha256:<hex>` content identifier.
///
/// The hex part is stored lowercased, so two digests compare equal iff
/// their canonical string forms are equal, regardless of the case they
/// were parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(value: &str) -> Result<Self> {
        let hex = value
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| StrataError::MalformedDigest(value.to_string()))?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::MalformedDigest(value.to_string()));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = StreamingDigest::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Hex portion without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.hex)
    }
}

impl FromStr for Digest {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = StrataError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Incremental SHA-256 for data that arrives in pieces (network streams).
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    len: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes folded in so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> Digest {
        Digest {
            hex: hex::encode(self.hasher.finalize()),
        }
    }
}

/// Compute the digest of a file, streaming it in 64 KiB blocks.
pub fn digest_file(path: &Path) -> Result<Digest> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        StrataError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to open {} for hashing: {}", path.display(), e),
        ))
    })?;

    let mut hasher = StreamingDigest::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Recompute a file's digest and compare it to `expected`.
pub fn verify_file(path: &Path, expected: &Digest) -> Result<()> {
    let actual = digest_file(path)?;
    if &actual != expected {
        return Err(StrataError::ContentMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
